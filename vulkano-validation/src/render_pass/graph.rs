//! The dependency graph between the subpasses of a render pass.

use super::SubpassDependency;
use crate::{ErrorKind, ValidationError};
use ash::vk;
use smallvec::SmallVec;

/// The index of a node in a [`SubpassGraph`]. Subpasses use their own index, the external scopes
/// come after the last subpass.
pub type NodeIndex = u32;

/// An edge of the graph, created from a single subpass dependency.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependencyEdge {
    pub src: NodeIndex,
    pub dst: NodeIndex,
    pub src_stages: vk::PipelineStageFlags2,
    pub dst_stages: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_access: vk::AccessFlags2,

    /// The index of the dependency in the create info of the render pass.
    pub dependency_index: u32,
}

/// A directed acyclic graph of the subpasses of a render pass, with edges pointing from a
/// subpass to the subpasses that depend on it.
///
/// Since a dependency can only go from an earlier subpass to a later one, the graph is acyclic
/// by construction. Reachability between every pair of nodes is computed once, when the graph is
/// created.
#[derive(Clone, Debug)]
pub struct SubpassGraph {
    subpass_count: u32,
    edges: Vec<DependencyEdge>,
    out_edges: Vec<SmallVec<[NodeIndex; 4]>>,
    self_dependencies: Vec<SmallVec<[u32; 2]>>,
    reachable: Vec<Vec<bool>>,
}

impl SubpassGraph {
    /// Builds the graph. Invalid dependencies are reported and left out of the graph.
    pub fn new(
        subpass_count: u32,
        dependencies: &[SubpassDependency],
    ) -> (Self, Vec<Box<ValidationError>>) {
        let node_count = subpass_count as usize + 2;
        let external_in = subpass_count;
        let external_out = subpass_count + 1;

        let mut errors = Vec::new();
        let mut edges = Vec::with_capacity(dependencies.len());
        let mut out_edges = vec![SmallVec::new(); node_count];
        let mut self_dependencies = vec![SmallVec::new(); subpass_count as usize];

        for (dependency_index, dependency) in dependencies.iter().enumerate() {
            let &SubpassDependency {
                src_subpass,
                dst_subpass,
                src_stages,
                dst_stages,
                src_access,
                dst_access,
                dependency_flags: _,
            } = dependency;
            let dependency_index = dependency_index as u32;

            let error = |problem: String, vuid: &'static [&'static str]| {
                Box::new(ValidationError {
                    problem: problem.into(),
                    vuids: vuid,
                    kind: ErrorKind::GraphIncomplete,
                    ..Default::default()
                })
                .add_context(format!("create_info.dependencies[{}]", dependency_index))
            };

            let (src, dst) = match (src_subpass, dst_subpass) {
                (None, None) => {
                    errors.push(error(
                        "`src_subpass` and `dst_subpass` are both external".into(),
                        &["VUID-VkSubpassDependency-srcSubpass-00865"],
                    ));
                    continue;
                }
                (Some(src), _) if src >= subpass_count => {
                    errors.push(error(
                        format!(
                            "`src_subpass` is {}, but the render pass has only {} subpasses",
                            src, subpass_count,
                        ),
                        &["VUID-VkRenderPassCreateInfo-srcSubpass-02517"],
                    ));
                    continue;
                }
                (_, Some(dst)) if dst >= subpass_count => {
                    errors.push(error(
                        format!(
                            "`dst_subpass` is {}, but the render pass has only {} subpasses",
                            dst, subpass_count,
                        ),
                        &["VUID-VkRenderPassCreateInfo-dstSubpass-02518"],
                    ));
                    continue;
                }
                (Some(src), Some(dst)) if src > dst => {
                    errors.push(error(
                        format!(
                            "`src_subpass` ({}) is greater than `dst_subpass` ({})",
                            src, dst,
                        ),
                        &["VUID-VkSubpassDependency-srcSubpass-00864"],
                    ));
                    continue;
                }
                (Some(src), Some(dst)) if src == dst => {
                    self_dependencies[src as usize].push(dependency_index);
                    continue;
                }
                (src, dst) => (src.unwrap_or(external_in), dst.unwrap_or(external_out)),
            };

            if !out_edges[src as usize].contains(&dst) {
                out_edges[src as usize].push(dst);
            }

            edges.push(DependencyEdge {
                src,
                dst,
                src_stages,
                dst_stages,
                src_access,
                dst_access,
                dependency_index,
            });
        }

        let reachable = (0..node_count as NodeIndex)
            .map(|node_index| reachable_from(&out_edges, node_index))
            .collect();

        (
            SubpassGraph {
                subpass_count,
                edges,
                out_edges,
                self_dependencies,
                reachable,
            },
            errors,
        )
    }

    #[inline]
    pub fn subpass_count(&self) -> u32 {
        self.subpass_count
    }

    /// Returns the node that stands for everything before the render pass.
    #[inline]
    pub fn external_in(&self) -> NodeIndex {
        self.subpass_count
    }

    /// Returns the node that stands for everything after the render pass.
    #[inline]
    pub fn external_out(&self) -> NodeIndex {
        self.subpass_count + 1
    }

    #[inline]
    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    /// Returns the nodes that `node` has an explicit edge to.
    #[inline]
    pub fn successors(&self, node: NodeIndex) -> &[NodeIndex] {
        self.out_edges
            .get(node as usize)
            .map_or(&[], |out_edges| out_edges.as_slice())
    }

    /// Returns the indices of the dependencies whose source and destination are both `subpass`.
    #[inline]
    pub fn self_dependencies(&self, subpass: u32) -> &[u32] {
        self.self_dependencies
            .get(subpass as usize)
            .map_or(&[], |dependencies| dependencies.as_slice())
    }

    /// Returns whether there is a path of one or more edges from `src` to `dst`.
    #[inline]
    pub fn reaches(&self, src: NodeIndex, dst: NodeIndex) -> bool {
        self.reachable
            .get(src as usize)
            .and_then(|row| row.get(dst as usize))
            .copied()
            .unwrap_or(false)
    }

    /// Returns whether `a` and `b` are ordered by an explicit or transitive dependency, in either
    /// direction.
    #[inline]
    pub fn dependency_exists(&self, a: NodeIndex, b: NodeIndex) -> bool {
        self.reaches(a, b) || self.reaches(b, a)
    }
}

/// Performs [depth-first search] from `start`, returning which nodes were reached. `start`
/// itself is only included if it is on a cycle, which can't happen for a valid graph.
///
/// [depth-first search]: https://en.wikipedia.org/wiki/Depth-first_search
fn reachable_from(out_edges: &[SmallVec<[NodeIndex; 4]>], start: NodeIndex) -> Vec<bool> {
    fn dfs(out_edges: &[SmallVec<[NodeIndex; 4]>], node_index: NodeIndex, visited: &mut [bool]) {
        for &next in &out_edges[node_index as usize] {
            let is_visited = &mut visited[next as usize];

            if *is_visited {
                continue;
            }

            *is_visited = true;
            dfs(out_edges, next, visited);
        }
    }

    let mut visited = vec![false; out_edges.len()];
    dfs(out_edges, start, &mut visited);

    visited
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dependency(src: Option<u32>, dst: Option<u32>) -> SubpassDependency {
        SubpassDependency {
            src_subpass: src,
            dst_subpass: dst,
            ..Default::default()
        }
    }

    #[test]
    fn transitive_reachability() {
        let (graph, errors) = SubpassGraph::new(
            3,
            &[
                dependency(Some(0), Some(1)),
                dependency(Some(1), Some(2)),
                dependency(None, Some(0)),
            ],
        );
        assert!(errors.is_empty());

        assert!(graph.reaches(0, 2));
        assert!(!graph.reaches(2, 0));
        assert!(graph.dependency_exists(2, 0));
        assert!(graph.reaches(graph.external_in(), 2));
        assert!(!graph.reaches(2, graph.external_out()));
        assert!(!graph.reaches(1, 1));
        assert_eq!(graph.successors(0), &[1]);
    }

    #[test]
    fn unrelated_subpasses() {
        let (graph, errors) = SubpassGraph::new(3, &[dependency(Some(0), Some(2))]);
        assert!(errors.is_empty());
        assert!(graph.dependency_exists(0, 2));
        assert!(!graph.dependency_exists(0, 1));
        assert!(!graph.dependency_exists(1, 2));
    }

    #[test]
    fn self_dependencies_are_not_edges() {
        let (graph, errors) = SubpassGraph::new(2, &[dependency(Some(1), Some(1))]);
        assert!(errors.is_empty());
        assert!(graph.edges().is_empty());
        assert_eq!(graph.self_dependencies(1), &[0]);
        assert!(!graph.reaches(1, 1));
    }

    #[test]
    fn invalid_dependencies() {
        let (graph, errors) = SubpassGraph::new(
            2,
            &[
                dependency(Some(1), Some(0)),
                dependency(None, None),
                dependency(Some(0), Some(5)),
            ],
        );
        let vuids: Vec<_> = errors.iter().map(|err| err.rule_id()).collect();
        assert_eq!(
            vuids,
            [
                "VUID-VkSubpassDependency-srcSubpass-00864",
                "VUID-VkSubpassDependency-srcSubpass-00865",
                "VUID-VkRenderPassCreateInfo-dstSubpass-02518",
            ],
        );
        assert!(errors
            .iter()
            .all(|err| err.kind == ErrorKind::GraphIncomplete));
        assert!(graph.edges().is_empty());
        assert!(!graph.dependency_exists(0, 1));
    }
}
