//! Render passes, and the checks that can be done on them once, when they are created.
//!
//! A render pass consists of subpasses that read and write attachments. Two subpasses that use the
//! same attachment, where at least one of them writes it, must be ordered by a dependency, and an
//! attachment whose contents must survive a subpass that doesn't use it must be preserved by that
//! subpass.

use self::graph::{NodeIndex, SubpassGraph};
use crate::{image::ImageSubresourceRange, ErrorKind, ValidationError};
use ash::vk;
use bitflags::bitflags;
use smallvec::SmallVec;

pub mod graph;

/// Parameters to create a new `RenderPass`.
#[derive(Clone, Debug, Default)]
pub struct RenderPassCreateInfo {
    /// The attachments available for the render pass.
    ///
    /// The default value is empty.
    pub attachments: Vec<AttachmentDescription>,

    /// The subpasses that make up this render pass.
    ///
    /// A render pass must contain at least one subpass.
    ///
    /// The default value is empty, which must be overridden.
    pub subpasses: Vec<SubpassDescription>,

    /// The dependencies between subpasses.
    ///
    /// The default value is empty.
    pub dependencies: Vec<SubpassDependency>,
}

/// Describes an attachment that will be used in a render pass.
#[derive(Clone, Debug)]
pub struct AttachmentDescription {
    /// The format of the image that is going to be bound.
    ///
    /// The default value is [`vk::Format::UNDEFINED`].
    pub format: vk::Format,

    /// What the implementation should do with the attachment at the start of the subpass that
    /// first uses it.
    ///
    /// The default value is [`vk::AttachmentLoadOp::DONT_CARE`].
    pub load_op: vk::AttachmentLoadOp,

    /// What the implementation should do with the attachment at the end of the subpass that last
    /// uses it.
    ///
    /// The default value is [`vk::AttachmentStoreOp::DONT_CARE`].
    pub store_op: vk::AttachmentStoreOp,

    /// The layout that the image must be in at the start of the render pass.
    ///
    /// The default value is [`vk::ImageLayout::UNDEFINED`].
    pub initial_layout: vk::ImageLayout,

    /// The layout that the image will be transitioned to at the end of the render pass.
    ///
    /// The default value is [`vk::ImageLayout::UNDEFINED`].
    pub final_layout: vk::ImageLayout,

    /// Additional structures that extend the description.
    ///
    /// The default value is empty.
    pub extensions: Vec<AttachmentDescriptionExtension>,
}

impl Default for AttachmentDescription {
    #[inline]
    fn default() -> Self {
        Self {
            format: vk::Format::UNDEFINED,
            load_op: vk::AttachmentLoadOp::DONT_CARE,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::UNDEFINED,
            extensions: Vec::new(),
        }
    }
}

impl AttachmentDescription {
    /// Returns the initial and final layout of the stencil aspect, if they are given separately.
    pub fn stencil_layouts(&self) -> Option<(vk::ImageLayout, vk::ImageLayout)> {
        self.extensions.iter().find_map(|extension| match *extension {
            AttachmentDescriptionExtension::StencilLayout {
                stencil_initial_layout,
                stencil_final_layout,
            } => Some((stencil_initial_layout, stencil_final_layout)),
        })
    }
}

/// A structure that extends an [`AttachmentDescription`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachmentDescriptionExtension {
    /// Separate layouts for the stencil aspect of a depth/stencil attachment.
    StencilLayout {
        stencil_initial_layout: vk::ImageLayout,
        stencil_final_layout: vk::ImageLayout,
    },
}

/// A reference in a subpass description to a particular attachment of the render pass.
#[derive(Clone, Debug)]
pub struct AttachmentReference {
    /// The number of the attachment being referred to.
    ///
    /// The default value is `0`.
    pub attachment: u32,

    /// The image layout that the attachment should be transitioned to at the start of the
    /// subpass.
    ///
    /// The default value is [`vk::ImageLayout::UNDEFINED`].
    pub layout: vk::ImageLayout,

    /// For input attachments, the aspects of the image that are read.
    ///
    /// The default value is empty.
    pub aspects: vk::ImageAspectFlags,

    /// Additional structures that extend the reference.
    ///
    /// The default value is empty.
    pub extensions: Vec<AttachmentReferenceExtension>,
}

impl Default for AttachmentReference {
    #[inline]
    fn default() -> Self {
        Self {
            attachment: 0,
            layout: vk::ImageLayout::UNDEFINED,
            aspects: vk::ImageAspectFlags::empty(),
            extensions: Vec::new(),
        }
    }
}

impl AttachmentReference {
    /// Returns the layout of the stencil aspect, if it is given separately.
    pub fn stencil_layout(&self) -> Option<vk::ImageLayout> {
        self.extensions.iter().find_map(|extension| match *extension {
            AttachmentReferenceExtension::StencilLayout { stencil_layout } => Some(stencil_layout),
        })
    }
}

/// A structure that extends an [`AttachmentReference`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachmentReferenceExtension {
    /// A separate layout for the stencil aspect of a depth/stencil attachment.
    StencilLayout { stencil_layout: vk::ImageLayout },
}

/// Describes one of the subpasses of a render pass.
#[derive(Clone, Debug, Default)]
pub struct SubpassDescription {
    /// The attachments of the render pass that are to be used as input attachments in this
    /// subpass.
    ///
    /// The default value is empty.
    pub input_attachments: Vec<Option<AttachmentReference>>,

    /// The attachments of the render pass that are to be used as color attachments in this
    /// subpass.
    ///
    /// The default value is empty.
    pub color_attachments: Vec<Option<AttachmentReference>>,

    /// The attachments of the render pass that are to be used as resolve attachments for the
    /// color attachments of this subpass.
    ///
    /// The default value is empty.
    pub resolve_attachments: Vec<Option<AttachmentReference>>,

    /// The single attachment of the render pass that is to be used as depth/stencil attachment
    /// in this subpass.
    ///
    /// The default value is `None`.
    pub depth_stencil_attachment: Option<AttachmentReference>,

    /// The indices of attachments of the render pass that will be preserved during this subpass.
    ///
    /// The default value is empty.
    pub preserve_attachments: Vec<u32>,
}

/// A dependency between two subpasses of a render pass.
#[derive(Clone, Debug)]
pub struct SubpassDependency {
    /// The index of the subpass that writes the data that `dst_subpass` is going to use.
    ///
    /// `None` specifies an external dependency.
    ///
    /// The default value is `None`.
    pub src_subpass: Option<u32>,

    /// The index of the subpass that reads the data that `src_subpass` wrote.
    ///
    /// `None` specifies an external dependency.
    ///
    /// The default value is `None`.
    pub dst_subpass: Option<u32>,

    /// The default value is empty.
    pub src_stages: vk::PipelineStageFlags2,

    /// The default value is empty.
    pub dst_stages: vk::PipelineStageFlags2,

    /// The default value is empty.
    pub src_access: vk::AccessFlags2,

    /// The default value is empty.
    pub dst_access: vk::AccessFlags2,

    /// The default value is empty.
    pub dependency_flags: vk::DependencyFlags,
}

impl Default for SubpassDependency {
    #[inline]
    fn default() -> Self {
        Self {
            src_subpass: None,
            dst_subpass: None,
            src_stages: vk::PipelineStageFlags2::empty(),
            dst_stages: vk::PipelineStageFlags2::empty(),
            src_access: vk::AccessFlags2::empty(),
            dst_access: vk::AccessFlags2::empty(),
            dependency_flags: vk::DependencyFlags::empty(),
        }
    }
}

bitflags! {
    /// The ways in which a subpass uses an attachment.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AttachmentUses: u8 {
        const INPUT = 1 << 0;
        const COLOR = 1 << 1;
        const RESOLVE = 1 << 2;
        const DEPTH_STENCIL = 1 << 3;
        const PRESERVE = 1 << 4;
    }
}

impl AttachmentUses {
    /// The uses that access the attachment. Preserving an attachment does not.
    pub const ACCESSES: Self = Self::INPUT
        .union(Self::COLOR)
        .union(Self::RESOLVE)
        .union(Self::DEPTH_STENCIL);
}

/// How a single subpass uses a single attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachmentUse {
    pub uses: AttachmentUses,
    pub layout: vk::ImageLayout,
    pub stencil_layout: Option<vk::ImageLayout>,
}

impl AttachmentUse {
    /// Returns whether the subpass accesses the attachment, as opposed to only preserving it or
    /// not using it at all.
    #[inline]
    pub fn is_access(&self) -> bool {
        self.uses.intersects(AttachmentUses::ACCESSES)
    }

    /// Returns whether the subpass may write to the attachment.
    pub fn is_write(&self) -> bool {
        self.uses
            .intersects(AttachmentUses::COLOR | AttachmentUses::RESOLVE)
            || self.uses.contains(AttachmentUses::DEPTH_STENCIL)
                && (!is_read_only_layout(self.layout)
                    || self
                        .stencil_layout
                        .is_some_and(|layout| !is_read_only_layout(layout)))
    }
}

fn is_read_only_layout(layout: vk::ImageLayout) -> bool {
    matches!(
        layout,
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
            | vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL
            | vk::ImageLayout::STENCIL_READ_ONLY_OPTIMAL
            | vk::ImageLayout::READ_ONLY_OPTIMAL
            | vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    )
}

/// An object representing the discrete steps in which rendering is done.
///
/// The dependency graph and the use of each attachment by each subpass are derived once, when the
/// render pass is created.
#[derive(Debug)]
pub struct RenderPass {
    handle: vk::RenderPass,
    attachments: Vec<AttachmentDescription>,
    subpasses: Vec<SubpassDescription>,
    dependencies: Vec<SubpassDependency>,
    graph: SubpassGraph,

    // Indexed by subpass, then by attachment.
    attachment_uses: Vec<Vec<Option<AttachmentUse>>>,
}

impl RenderPass {
    /// Builds the render pass and checks its create info.
    ///
    /// The render pass is always returned, together with all problems that were found. The
    /// dependency and preserve checks are only done if `check_dependencies` is true.
    pub fn new(
        handle: vk::RenderPass,
        create_info: RenderPassCreateInfo,
        check_dependencies: bool,
    ) -> (Self, Vec<Box<ValidationError>>) {
        let RenderPassCreateInfo {
            attachments,
            subpasses,
            dependencies,
        } = create_info;

        let mut errors = Vec::new();

        if subpasses.is_empty() {
            errors.push(Box::new(ValidationError {
                context: "create_info.subpasses".into(),
                problem: "is empty".into(),
                vuids: &["VUID-VkRenderPassCreateInfo-subpassCount-arraylength"],
                objects: [handle.into()].into_iter().collect(),
                kind: ErrorKind::Protocol,
            }));
        }

        let (graph, graph_errors) = SubpassGraph::new(subpasses.len() as u32, &dependencies);
        errors.extend(graph_errors);

        let attachment_uses = subpasses
            .iter()
            .enumerate()
            .map(|(subpass_num, subpass)| {
                build_attachment_uses(subpass_num, subpass, attachments.len(), &mut errors)
            })
            .collect();

        let render_pass = RenderPass {
            handle,
            attachments,
            subpasses,
            dependencies,
            graph,
            attachment_uses,
        };

        if check_dependencies {
            errors.extend(render_pass.validate_shared_attachments());

            for attachment in 0..render_pass.attachments.len() as u32 {
                for subpass in 0..render_pass.subpasses.len() as u32 {
                    if let Err(err) = render_pass.check_preserved(attachment, subpass) {
                        errors.push(err);
                    }
                }
            }
        }

        for err in &mut errors {
            if err.objects.is_empty() {
                err.objects.push(handle.into());
            }
        }

        (render_pass, errors)
    }

    #[inline]
    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    #[inline]
    pub fn attachments(&self) -> &[AttachmentDescription] {
        &self.attachments
    }

    #[inline]
    pub fn subpasses(&self) -> &[SubpassDescription] {
        &self.subpasses
    }

    #[inline]
    pub fn dependencies(&self) -> &[SubpassDependency] {
        &self.dependencies
    }

    #[inline]
    pub fn graph(&self) -> &SubpassGraph {
        &self.graph
    }

    /// Returns how `subpass` uses `attachment`.
    #[inline]
    pub fn attachment_use(&self, subpass: u32, attachment: u32) -> Option<&AttachmentUse> {
        self.attachment_uses
            .get(subpass as usize)?
            .get(attachment as usize)?
            .as_ref()
    }

    /// Returns the attachments that `subpass` accesses, with the layouts they must be in.
    pub fn subpass_layouts(
        &self,
        subpass: u32,
    ) -> impl Iterator<Item = (u32, &AttachmentUse)> + '_ {
        self.attachment_uses
            .get(subpass as usize)
            .into_iter()
            .flatten()
            .enumerate()
            .filter_map(|(attachment, attachment_use)| {
                attachment_use
                    .as_ref()
                    .filter(|attachment_use| attachment_use.is_access())
                    .map(|attachment_use| (attachment as u32, attachment_use))
            })
    }

    fn accessing_subpasses(&self, attachment: u32) -> SmallVec<[u32; 8]> {
        (0..self.subpasses.len() as u32)
            .filter(|&subpass| {
                self.attachment_use(subpass, attachment)
                    .is_some_and(AttachmentUse::is_access)
            })
            .collect()
    }

    /// Checks that every two subpasses that access the same attachment, where at least one of
    /// them writes it, are ordered by a dependency.
    pub fn validate_shared_attachments(&self) -> Vec<Box<ValidationError>> {
        let mut errors = Vec::new();

        for attachment in 0..self.attachments.len() as u32 {
            let users = self.accessing_subpasses(attachment);

            for (i, &first) in users.iter().enumerate() {
                for &second in &users[i + 1..] {
                    let (Some(first_use), Some(second_use)) = (
                        self.attachment_use(first, attachment),
                        self.attachment_use(second, attachment),
                    ) else {
                        continue;
                    };

                    if !first_use.is_write() && !second_use.is_write() {
                        continue;
                    }

                    if !self.graph.dependency_exists(first, second) {
                        errors.push(Box::new(ValidationError {
                            context: format!("create_info.attachments[{}]", attachment).into(),
                            problem: format!(
                                "subpasses {} and {} both use the attachment and at least one of \
                                them writes it, but there is no dependency between them",
                                first, second,
                            )
                            .into(),
                            vuids: &["UNASSIGNED-CoreValidation-DrawState-InvalidRenderpass"],
                            kind: ErrorKind::GraphIncomplete,
                            ..Default::default()
                        }));
                    }
                }
            }
        }

        errors
    }

    /// Checks that `subpass` preserves `attachment` if it has to.
    ///
    /// A subpass that doesn't access an attachment must preserve it if the attachment is accessed
    /// both by a subpass that comes before it in the dependency graph, and by one that comes after
    /// it.
    pub fn check_preserved(
        &self,
        attachment: u32,
        subpass: u32,
    ) -> Result<(), Box<ValidationError>> {
        let attachment_use = self.attachment_use(subpass, attachment);

        if attachment_use.is_some_and(AttachmentUse::is_access) {
            return Ok(());
        }

        let users = self.accessing_subpasses(attachment);
        let node = subpass as NodeIndex;
        let used_before = users.iter().any(|&user| self.graph.reaches(user, node));
        let used_after = users.iter().any(|&user| self.graph.reaches(node, user));

        if !used_before || !used_after {
            return Ok(());
        }

        if attachment_use.is_some_and(|u| u.uses.contains(AttachmentUses::PRESERVE)) {
            return Ok(());
        }

        Err(Box::new(ValidationError {
            context: format!("create_info.subpasses[{}].preserve_attachments", subpass).into(),
            problem: format!(
                "attachment {} is used before and after this subpass, but is not preserved by it",
                attachment,
            )
            .into(),
            vuids: &["UNASSIGNED-CoreValidation-DrawState-InvalidRenderpass"],
            objects: [self.handle.into()].into_iter().collect(),
            kind: ErrorKind::GraphIncomplete,
        }))
    }
}

fn build_attachment_uses(
    subpass_num: usize,
    subpass: &SubpassDescription,
    attachment_count: usize,
    errors: &mut Vec<Box<ValidationError>>,
) -> Vec<Option<AttachmentUse>> {
    let mut uses: Vec<Option<AttachmentUse>> = vec![None; attachment_count];

    let SubpassDescription {
        input_attachments,
        color_attachments,
        resolve_attachments,
        depth_stencil_attachment,
        preserve_attachments,
    } = subpass;

    let references = input_attachments
        .iter()
        .enumerate()
        .map(|(i, r)| (AttachmentUses::INPUT, "input_attachments", Some(i), r.as_ref()))
        .chain(
            color_attachments
                .iter()
                .enumerate()
                .map(|(i, r)| (AttachmentUses::COLOR, "color_attachments", Some(i), r.as_ref())),
        )
        .chain(resolve_attachments.iter().enumerate().map(|(i, r)| {
            (
                AttachmentUses::RESOLVE,
                "resolve_attachments",
                Some(i),
                r.as_ref(),
            )
        }))
        .chain([(
            AttachmentUses::DEPTH_STENCIL,
            "depth_stencil_attachment",
            None,
            depth_stencil_attachment.as_ref(),
        )]);

    for (kind, field, index, reference) in references {
        let Some(reference) = reference else {
            continue;
        };

        if reference.attachment == vk::ATTACHMENT_UNUSED {
            continue;
        }

        let context = || match index {
            Some(index) => format!("create_info.subpasses[{}].{}[{}]", subpass_num, field, index),
            None => format!("create_info.subpasses[{}].{}", subpass_num, field),
        };

        let Some(slot) = uses.get_mut(reference.attachment as usize) else {
            errors.push(
                Box::new(ValidationError {
                    context: "attachment".into(),
                    problem: format!(
                        "is {}, but the render pass has only {} attachments",
                        reference.attachment, attachment_count,
                    )
                    .into(),
                    vuids: &["VUID-VkRenderPassCreateInfo-attachment-00834"],
                    kind: ErrorKind::Protocol,
                    ..Default::default()
                })
                .add_context(context()),
            );
            continue;
        };

        let stencil_layout = reference.stencil_layout();

        let Some(existing) = slot else {
            *slot = Some(AttachmentUse {
                uses: kind,
                layout: reference.layout,
                stencil_layout,
            });
            continue;
        };

        if existing.layout != reference.layout {
            errors.push(
                Box::new(ValidationError {
                    context: "layout".into(),
                    problem: format!(
                        "is {:?}, but attachment {} is also used in this subpass with layout {:?}",
                        reference.layout, reference.attachment, existing.layout,
                    )
                    .into(),
                    vuids: &["VUID-VkSubpassDescription-layout-02519"],
                    kind: ErrorKind::StateMismatch,
                    ..Default::default()
                })
                .add_context(context()),
            );
        }

        let combined = existing.uses | kind;
        let non_input = combined - AttachmentUses::INPUT;
        let conflict = if existing.uses.intersects(kind - AttachmentUses::INPUT) {
            // The same non-input use twice, such as two color attachments.
            true
        } else if non_input.bits().count_ones() > 1 {
            true
        } else {
            combined.contains(AttachmentUses::INPUT)
                && !non_input.is_empty()
                && !matches!(
                    reference.layout,
                    vk::ImageLayout::GENERAL | vk::ImageLayout::ATTACHMENT_FEEDBACK_LOOP_OPTIMAL_EXT
                )
        };

        if conflict {
            errors.push(
                Box::new(ValidationError {
                    context: "attachment".into(),
                    problem: format!(
                        "attachment {} is used as {:?} and as {:?} in the same subpass",
                        reference.attachment, existing.uses, kind,
                    )
                    .into(),
                    vuids: &["UNASSIGNED-CoreValidation-DrawState-InvalidRenderpass"],
                    kind: ErrorKind::StateMismatch,
                    ..Default::default()
                })
                .add_context(context()),
            );
        }

        existing.uses = combined;
    }

    for (preserve_num, &attachment) in preserve_attachments.iter().enumerate() {
        let context = format!(
            "create_info.subpasses[{}].preserve_attachments[{}]",
            subpass_num, preserve_num,
        );

        if attachment == vk::ATTACHMENT_UNUSED {
            errors.push(Box::new(ValidationError {
                context: context.into(),
                problem: "is `ATTACHMENT_UNUSED`".into(),
                vuids: &["VUID-VkSubpassDescription-attachment-00853"],
                kind: ErrorKind::Protocol,
                ..Default::default()
            }));
            continue;
        }

        match uses.get_mut(attachment as usize) {
            None => errors.push(Box::new(ValidationError {
                context: context.into(),
                problem: format!(
                    "is {}, but the render pass has only {} attachments",
                    attachment, attachment_count,
                )
                .into(),
                vuids: &["VUID-VkRenderPassCreateInfo-attachment-00834"],
                kind: ErrorKind::Protocol,
                ..Default::default()
            })),
            Some(Some(existing)) if existing.is_access() => {
                errors.push(Box::new(ValidationError {
                    context: context.into(),
                    problem: format!(
                        "attachment {} is also used as {:?} in this subpass",
                        attachment, existing.uses,
                    )
                    .into(),
                    vuids: &["VUID-VkSubpassDescription-pPreserveAttachments-00854"],
                    kind: ErrorKind::StateMismatch,
                    ..Default::default()
                }))
            }
            Some(Some(existing)) => existing.uses |= AttachmentUses::PRESERVE,
            Some(slot @ None) => {
                *slot = Some(AttachmentUse {
                    uses: AttachmentUses::PRESERVE,
                    layout: vk::ImageLayout::UNDEFINED,
                    stencil_layout: None,
                })
            }
        }
    }

    uses
}

/// Splits `range` into the parts that are in `layout` and the stencil part that is in
/// `stencil_layout`, if a separate stencil layout is given.
pub fn split_stencil_layout(
    range: &ImageSubresourceRange,
    layout: vk::ImageLayout,
    stencil_layout: Option<vk::ImageLayout>,
) -> SmallVec<[(ImageSubresourceRange, vk::ImageLayout); 2]> {
    let mut parts = SmallVec::new();

    match stencil_layout {
        Some(stencil_layout) if range.aspects.contains(vk::ImageAspectFlags::STENCIL) => {
            let other_aspects = range.aspects & !vk::ImageAspectFlags::STENCIL;

            if !other_aspects.is_empty() {
                parts.push((
                    ImageSubresourceRange {
                        aspects: other_aspects,
                        ..range.clone()
                    },
                    layout,
                ));
            }

            parts.push((
                ImageSubresourceRange {
                    aspects: vk::ImageAspectFlags::STENCIL,
                    ..range.clone()
                },
                stencil_layout,
            ));
        }
        _ => parts.push((range.clone(), layout)),
    }

    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn color_reference(attachment: u32, layout: vk::ImageLayout) -> Option<AttachmentReference> {
        Some(AttachmentReference {
            attachment,
            layout,
            ..Default::default()
        })
    }

    fn chain(subpass_count: u32) -> Vec<SubpassDependency> {
        (1..subpass_count)
            .map(|dst| SubpassDependency {
                src_subpass: Some(dst - 1),
                dst_subpass: Some(dst),
                ..Default::default()
            })
            .collect()
    }

    /// Attachment 0 is written in subpasses 0 and 2, attachment 1 only in subpass 1.
    fn three_subpasses(preserve_in_middle: bool) -> RenderPassCreateInfo {
        RenderPassCreateInfo {
            attachments: vec![AttachmentDescription::default(); 2],
            subpasses: vec![
                SubpassDescription {
                    color_attachments: vec![color_reference(
                        0,
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    )],
                    ..Default::default()
                },
                SubpassDescription {
                    color_attachments: vec![color_reference(
                        1,
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    )],
                    preserve_attachments: if preserve_in_middle { vec![0] } else { vec![] },
                    ..Default::default()
                },
                SubpassDescription {
                    input_attachments: vec![color_reference(
                        0,
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    )],
                    ..Default::default()
                },
            ],
            dependencies: chain(3),
        }
    }

    #[test]
    fn preserve_completeness() {
        let (render_pass, errors) =
            RenderPass::new(vk::RenderPass::from_raw(1), three_subpasses(false), true);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::GraphIncomplete);
        assert!(render_pass.check_preserved(0, 1).is_err());
        assert!(render_pass.check_preserved(1, 0).is_ok());

        let (render_pass, errors) =
            RenderPass::new(vk::RenderPass::from_raw(1), three_subpasses(true), true);
        assert!(errors.is_empty(), "{errors:?}");
        assert!(render_pass.check_preserved(0, 1).is_ok());
    }

    #[test]
    fn missing_dependency_between_writers() {
        let mut create_info = three_subpasses(true);
        create_info.dependencies.clear();

        let (_, errors) = RenderPass::new(vk::RenderPass::from_raw(1), create_info, true);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::GraphIncomplete);
        assert!(errors[0].to_string().contains("subpasses 0 and 2"));

        // Not checking dependencies leaves only the structural checks.
        let mut create_info = three_subpasses(true);
        create_info.dependencies.clear();
        let (_, errors) = RenderPass::new(vk::RenderPass::from_raw(1), create_info, false);
        assert!(errors.is_empty());
    }

    #[test]
    fn readers_need_no_dependency() {
        let input =
            |attachment| color_reference(attachment, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        let create_info = RenderPassCreateInfo {
            attachments: vec![AttachmentDescription::default()],
            subpasses: vec![
                SubpassDescription {
                    input_attachments: vec![input(0)],
                    ..Default::default()
                },
                SubpassDescription {
                    input_attachments: vec![input(0)],
                    ..Default::default()
                },
            ],
            dependencies: Vec::new(),
        };

        let (_, errors) = RenderPass::new(vk::RenderPass::from_raw(1), create_info, true);
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn use_table_errors() {
        let create_info = RenderPassCreateInfo {
            attachments: vec![AttachmentDescription::default(); 2],
            subpasses: vec![SubpassDescription {
                input_attachments: vec![color_reference(
                    0,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                )],
                color_attachments: vec![
                    color_reference(0, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
                    color_reference(7, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
                ],
                depth_stencil_attachment: color_reference(
                    1,
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                ),
                preserve_attachments: vec![1, vk::ATTACHMENT_UNUSED],
                ..Default::default()
            }],
            dependencies: Vec::new(),
        };

        let (_, errors) = RenderPass::new(vk::RenderPass::from_raw(1), create_info, false);
        let vuids: Vec<_> = errors.iter().map(|err| err.rule_id()).collect();
        assert_eq!(
            vuids,
            [
                // Input and color in a layout other than GENERAL.
                "UNASSIGNED-CoreValidation-DrawState-InvalidRenderpass",
                "VUID-VkRenderPassCreateInfo-attachment-00834",
                "VUID-VkSubpassDescription-pPreserveAttachments-00854",
                "VUID-VkSubpassDescription-attachment-00853",
            ],
        );
    }

    #[test]
    fn input_and_color_in_general_layout() {
        let create_info = RenderPassCreateInfo {
            attachments: vec![AttachmentDescription::default()],
            subpasses: vec![SubpassDescription {
                input_attachments: vec![color_reference(0, vk::ImageLayout::GENERAL)],
                color_attachments: vec![color_reference(0, vk::ImageLayout::GENERAL)],
                ..Default::default()
            }],
            dependencies: Vec::new(),
        };

        let (render_pass, errors) =
            RenderPass::new(vk::RenderPass::from_raw(1), create_info, true);
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(
            render_pass.attachment_use(0, 0).map(|u| u.uses),
            Some(AttachmentUses::INPUT | AttachmentUses::COLOR),
        );
    }

    #[test]
    fn layout_mismatch_within_subpass() {
        let create_info = RenderPassCreateInfo {
            attachments: vec![AttachmentDescription::default()],
            subpasses: vec![SubpassDescription {
                input_attachments: vec![
                    color_reference(0, vk::ImageLayout::GENERAL),
                    color_reference(0, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
                ],
                ..Default::default()
            }],
            dependencies: Vec::new(),
        };

        let (_, errors) = RenderPass::new(vk::RenderPass::from_raw(1), create_info, true);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].rule_id(), "VUID-VkSubpassDescription-layout-02519");
    }

    #[test]
    fn stencil_layouts() {
        let reference = AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            extensions: vec![AttachmentReferenceExtension::StencilLayout {
                stencil_layout: vk::ImageLayout::STENCIL_READ_ONLY_OPTIMAL,
            }],
            ..Default::default()
        };
        assert_eq!(
            reference.stencil_layout(),
            Some(vk::ImageLayout::STENCIL_READ_ONLY_OPTIMAL),
        );

        let range = ImageSubresourceRange {
            aspects: vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
            mip_levels: 0..1,
            array_layers: 0..1,
        };
        let parts = split_stencil_layout(&range, reference.layout, reference.stencil_layout());
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].0.aspects, vk::ImageAspectFlags::DEPTH);
        assert_eq!(parts[1].1, vk::ImageLayout::STENCIL_READ_ONLY_OPTIMAL);

        // A depth attachment with a separate read-only stencil layout is still written.
        let attachment_use = AttachmentUse {
            uses: AttachmentUses::DEPTH_STENCIL,
            layout: vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            stencil_layout: Some(vk::ImageLayout::STENCIL_READ_ONLY_OPTIMAL),
        };
        assert!(attachment_use.is_write());
    }
}
