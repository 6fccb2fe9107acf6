//! Parameters of pipeline barrier commands.

use crate::DeviceSize;
use ash::vk;
use smallvec::SmallVec;
use std::ops::Range;

/// Declares in which queue(s) a resource can be used.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Sharing {
    /// The resource is used is only one queue family at a time. Moving it to another queue family
    /// needs an ownership transfer.
    #[default]
    Exclusive,

    /// The resource is used in multiple queue families. Can be slower than `Exclusive`.
    Concurrent(SmallVec<[u32; 4]>),
}

impl Sharing {
    #[inline]
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Sharing::Exclusive)
    }
}

/// Returns whether `queue_family_index` stands for a queue family outside of the device, for which
/// ownership transfers are only half visible.
#[inline]
pub fn is_external_queue_family(queue_family_index: u32) -> bool {
    queue_family_index == vk::QUEUE_FAMILY_EXTERNAL
        || queue_family_index == vk::QUEUE_FAMILY_FOREIGN_EXT
}

/// Dependency info for barriers in a pipeline barrier command.
///
/// A pipeline barrier creates a dependency between commands submitted before the barrier (the
/// source scope) and commands submitted after it (the destination scope). Image barriers can also
/// change the layout of an image, and buffer and image barriers can transfer the ownership of a
/// resource between queue families.
#[derive(Clone, Debug, Default)]
pub struct DependencyInfo<'a> {
    /// Flags to modify how the execution and memory dependencies are formed.
    ///
    /// The default value is empty.
    pub dependency_flags: vk::DependencyFlags,

    /// Memory barriers for individual buffers.
    ///
    /// The default value is empty.
    pub buffer_memory_barriers: &'a [BufferMemoryBarrier],

    /// Memory barriers for individual images.
    ///
    /// The default value is empty.
    pub image_memory_barriers: &'a [ImageMemoryBarrier],
}

impl DependencyInfo<'_> {
    /// Returns `true` if `self` doesn't contain any barriers.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer_memory_barriers.is_empty() && self.image_memory_barriers.is_empty()
    }
}

/// A memory barrier that is applied to a single buffer.
#[derive(Clone, Debug)]
pub struct BufferMemoryBarrier {
    /// The pipeline stages in the source scope to wait for.
    ///
    /// The default value is empty.
    pub src_stages: vk::PipelineStageFlags2,

    /// The memory accesses in the source scope to make available and visible.
    ///
    /// The default value is empty.
    pub src_access: vk::AccessFlags2,

    /// The pipeline stages in the destination scope that must wait for `src_stages`.
    ///
    /// The default value is empty.
    pub dst_stages: vk::PipelineStageFlags2,

    /// The memory accesses in the destination scope that must wait for `src_access` to be made
    /// available and visible.
    ///
    /// The default value is empty.
    pub dst_access: vk::AccessFlags2,

    /// The queue family that releases ownership of the buffer.
    ///
    /// The default value is [`vk::QUEUE_FAMILY_IGNORED`].
    pub src_queue_family_index: u32,

    /// The queue family that acquires ownership of the buffer.
    ///
    /// The default value is [`vk::QUEUE_FAMILY_IGNORED`].
    pub dst_queue_family_index: u32,

    /// The buffer to apply the barrier to.
    ///
    /// The default value is a null handle, which must be overridden.
    pub buffer: vk::Buffer,

    /// The byte range of `buffer` to apply the barrier to.
    ///
    /// The default value is empty, which must be overridden.
    pub range: Range<DeviceSize>,
}

impl Default for BufferMemoryBarrier {
    #[inline]
    fn default() -> Self {
        Self {
            src_stages: vk::PipelineStageFlags2::empty(),
            src_access: vk::AccessFlags2::empty(),
            dst_stages: vk::PipelineStageFlags2::empty(),
            dst_access: vk::AccessFlags2::empty(),
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            buffer: vk::Buffer::null(),
            range: 0..0,
        }
    }
}

/// A memory barrier that is applied to a single image.
#[derive(Clone, Debug)]
pub struct ImageMemoryBarrier {
    /// The pipeline stages in the source scope to wait for.
    ///
    /// The default value is empty.
    pub src_stages: vk::PipelineStageFlags2,

    /// The memory accesses in the source scope to make available and visible.
    ///
    /// The default value is empty.
    pub src_access: vk::AccessFlags2,

    /// The pipeline stages in the destination scope that must wait for `src_stages`.
    ///
    /// The default value is empty.
    pub dst_stages: vk::PipelineStageFlags2,

    /// The memory accesses in the destination scope that must wait for `src_access` to be made
    /// available and visible.
    ///
    /// The default value is empty.
    pub dst_access: vk::AccessFlags2,

    /// The layout that the specified `subresource_range` of `image` is expected to be in when the
    /// source scope completes.
    ///
    /// The default value is [`vk::ImageLayout::UNDEFINED`].
    pub old_layout: vk::ImageLayout,

    /// The layout that the specified `subresource_range` of `image` will be transitioned to before
    /// the destination scope begins.
    ///
    /// The default value is [`vk::ImageLayout::UNDEFINED`].
    pub new_layout: vk::ImageLayout,

    /// The queue family that releases ownership of the image.
    ///
    /// The default value is [`vk::QUEUE_FAMILY_IGNORED`].
    pub src_queue_family_index: u32,

    /// The queue family that acquires ownership of the image.
    ///
    /// The default value is [`vk::QUEUE_FAMILY_IGNORED`].
    pub dst_queue_family_index: u32,

    /// The image to apply the barrier to.
    ///
    /// The default value is a null handle, which must be overridden.
    pub image: vk::Image,

    /// The subresource range of `image` to apply the barrier to.
    ///
    /// The default value is empty, which must be overridden.
    pub subresource_range: vk::ImageSubresourceRange,
}

impl Default for ImageMemoryBarrier {
    #[inline]
    fn default() -> Self {
        Self {
            src_stages: vk::PipelineStageFlags2::empty(),
            src_access: vk::AccessFlags2::empty(),
            dst_stages: vk::PipelineStageFlags2::empty(),
            dst_access: vk::AccessFlags2::empty(),
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::UNDEFINED,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image: vk::Image::null(),
            subresource_range: vk::ImageSubresourceRange::default(),
        }
    }
}
