//! Shadow state of images.
//!
//! The subresources of an image are "flattened" to [`DeviceSize`] indices so that a single
//! [`RangeMap`] can hold a value for each of them. The indices are arranged hierarchically:
//! aspects at the top level, with the mip levels in that aspect, and the array layers in that mip
//! level. A whole image, or a run of whole mip levels, is therefore a single contiguous range.

use crate::{range_map::RangeMap, sync::Sharing, DeviceSize, ErrorKind, ValidationError};
use ash::vk;
use smallvec::SmallVec;
use std::{
    cmp,
    iter::{self, FusedIterator, Peekable},
    ops::Range,
};

/// The aspects that can be tracked separately, in the order they are flattened.
const TRACKED_ASPECTS: [vk::ImageAspectFlags; 6] = [
    vk::ImageAspectFlags::COLOR,
    vk::ImageAspectFlags::DEPTH,
    vk::ImageAspectFlags::STENCIL,
    vk::ImageAspectFlags::PLANE_0,
    vk::ImageAspectFlags::PLANE_1,
    vk::ImageAspectFlags::PLANE_2,
];

/// Returns the aspects that images of the given format have.
pub fn format_aspects(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::G8_B8R8_2PLANE_420_UNORM
        | vk::Format::G8_B8R8_2PLANE_422_UNORM
        | vk::Format::G16_B16R16_2PLANE_420_UNORM
        | vk::Format::G16_B16R16_2PLANE_422_UNORM
        | vk::Format::G10X6_B10X6R10X6_2PLANE_420_UNORM_3PACK16
        | vk::Format::G12X4_B12X4R12X4_2PLANE_420_UNORM_3PACK16 => {
            vk::ImageAspectFlags::PLANE_0 | vk::ImageAspectFlags::PLANE_1
        }
        vk::Format::G8_B8_R8_3PLANE_420_UNORM
        | vk::Format::G8_B8_R8_3PLANE_422_UNORM
        | vk::Format::G8_B8_R8_3PLANE_444_UNORM
        | vk::Format::G16_B16_R16_3PLANE_420_UNORM
        | vk::Format::G16_B16_R16_3PLANE_422_UNORM
        | vk::Format::G16_B16_R16_3PLANE_444_UNORM => {
            vk::ImageAspectFlags::PLANE_0
                | vk::ImageAspectFlags::PLANE_1
                | vk::ImageAspectFlags::PLANE_2
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Splits `aspects` into its individual tracked aspects, in flattening order.
pub fn aspect_list(aspects: vk::ImageAspectFlags) -> SmallVec<[vk::ImageAspectFlags; 4]> {
    TRACKED_ASPECTS
        .into_iter()
        .filter(|&aspect| aspects.contains(aspect))
        .collect()
}

/// Parameters to register a new image.
#[derive(Clone, Debug)]
pub struct ImageCreateInfo {
    /// The format of the image. It determines the aspects that are tracked.
    ///
    /// The default value is [`vk::Format::R8G8B8A8_UNORM`].
    pub format: vk::Format,

    /// The number of mip levels.
    ///
    /// The default value is `1`.
    pub mip_levels: u32,

    /// The number of array layers.
    ///
    /// The default value is `1`.
    pub array_layers: u32,

    /// How the image is going to be used.
    ///
    /// The default value is empty.
    pub usage: vk::ImageUsageFlags,

    /// Whether the image can be shared across multiple queue families, or is limited to one.
    ///
    /// The default value is [`Sharing::Exclusive`].
    pub sharing: Sharing,

    /// The layout that the image has after creation.
    ///
    /// The default value is [`vk::ImageLayout::UNDEFINED`].
    pub initial_layout: vk::ImageLayout,
}

impl Default for ImageCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            format: vk::Format::R8G8B8A8_UNORM,
            mip_levels: 1,
            array_layers: 1,
            usage: vk::ImageUsageFlags::empty(),
            sharing: Sharing::Exclusive,
            initial_layout: vk::ImageLayout::UNDEFINED,
        }
    }
}

/// One or more subresources of an image, with all ranges resolved.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageSubresourceRange {
    /// Selects the aspects that will be included.
    pub aspects: vk::ImageAspectFlags,

    /// Selects the range of the mip levels that will be included.
    pub mip_levels: Range<u32>,

    /// Selects the range of array layers that will be included.
    pub array_layers: Range<u32>,
}

/// A single subresource of an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageSubresource {
    pub aspect: vk::ImageAspectFlags,
    pub mip_level: u32,
    pub array_layer: u32,
}

/// The shadow state of an image.
#[derive(Debug)]
pub struct ImageState {
    handle: vk::Image,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    sharing: Sharing,
    mip_levels: u32,
    array_layers: u32,
    aspects: vk::ImageAspectFlags,
    aspect_list: SmallVec<[vk::ImageAspectFlags; 4]>,
    aspect_size: DeviceSize,
    mip_level_size: DeviceSize,
    range_size: DeviceSize,

    // The layout of each subresource as of the last committed submission.
    layouts: RangeMap<DeviceSize, vk::ImageLayout>,
}

impl ImageState {
    pub fn new(handle: vk::Image, create_info: &ImageCreateInfo) -> Self {
        let &ImageCreateInfo {
            format,
            mip_levels,
            array_layers,
            usage,
            ref sharing,
            initial_layout,
        } = create_info;

        let mip_levels = mip_levels.max(1);
        let array_layers = array_layers.max(1);
        let aspects = format_aspects(format);
        let aspect_list = aspect_list(aspects);
        let mip_level_size = array_layers as DeviceSize;
        let aspect_size = mip_level_size * mip_levels as DeviceSize;
        let range_size = aspect_size * aspect_list.len() as DeviceSize;

        ImageState {
            handle,
            format,
            usage,
            sharing: sharing.clone(),
            mip_levels,
            array_layers,
            aspects,
            aspect_list,
            aspect_size,
            mip_level_size,
            range_size,
            layouts: [(0..range_size, initial_layout)].into_iter().collect(),
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    #[inline]
    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    #[inline]
    pub fn sharing(&self) -> &Sharing {
        &self.sharing
    }

    #[inline]
    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    #[inline]
    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    /// Returns the aspects of the image's format.
    #[inline]
    pub fn aspects(&self) -> vk::ImageAspectFlags {
        self.aspects
    }

    /// Returns the number of flattened subresource indices of the image.
    #[inline]
    pub fn range_size(&self) -> DeviceSize {
        self.range_size
    }

    /// Returns a subresource range covering the whole image.
    #[inline]
    pub fn subresource_range(&self) -> ImageSubresourceRange {
        ImageSubresourceRange {
            aspects: self.aspects,
            mip_levels: 0..self.mip_levels,
            array_layers: 0..self.array_layers,
        }
    }

    /// Returns the authoritative layout map of the image.
    #[inline]
    pub fn layouts(&self) -> &RangeMap<DeviceSize, vk::ImageLayout> {
        &self.layouts
    }

    /// Returns the committed layout of a single subresource.
    pub fn layout(&self, subresource: ImageSubresource) -> Option<vk::ImageLayout> {
        let index = self.subresource_index(subresource)?;
        self.layouts.get(&index).copied()
    }

    /// Folds layouts produced by a submission into the authoritative map.
    pub(crate) fn commit_layouts(&mut self, layouts: &RangeMap<DeviceSize, vk::ImageLayout>) {
        self.layouts.merge_from(layouts, |&layout| layout);
    }

    /// Returns the flattened index of a single subresource.
    pub fn subresource_index(&self, subresource: ImageSubresource) -> Option<DeviceSize> {
        let ImageSubresource {
            aspect,
            mip_level,
            array_layer,
        } = subresource;

        if mip_level >= self.mip_levels || array_layer >= self.array_layers {
            return None;
        }

        let aspect_num = self.aspect_list.iter().position(|&a| a == aspect)?;

        Some(
            aspect_num as DeviceSize * self.aspect_size
                + mip_level as DeviceSize * self.mip_level_size
                + array_layer as DeviceSize,
        )
    }

    /// Resolves a Vulkan subresource range against the image, replacing the `REMAINING_*`
    /// values.
    pub fn resolve_subresource_range(
        &self,
        range: &vk::ImageSubresourceRange,
    ) -> Result<ImageSubresourceRange, Box<ValidationError>> {
        let mut aspects = range.aspect_mask;

        // A color-only view of a multi-planar image covers all planes.
        if aspects == vk::ImageAspectFlags::COLOR
            && self.aspects.intersects(vk::ImageAspectFlags::PLANE_0)
        {
            aspects = self.aspects;
        }

        if aspects.is_empty() || !self.aspects.contains(aspects) {
            return Err(Box::new(ValidationError {
                context: "aspect_mask".into(),
                problem: format!(
                    "{:?} is not a non-empty subset of the image's aspects {:?}",
                    aspects, self.aspects,
                )
                .into(),
                vuids: &["VUID-VkImageMemoryBarrier2-image-01671"],
                objects: [self.handle.into()].into_iter().collect(),
                kind: ErrorKind::StateMismatch,
            }));
        }

        let mip_levels = resolve_range(
            range.base_mip_level,
            range.level_count,
            vk::REMAINING_MIP_LEVELS,
            self.mip_levels,
        )
        .ok_or_else(|| {
            Box::new(ValidationError {
                context: "base_mip_level".into(),
                problem: format!(
                    "the mip levels {} + {} are not within the {} mip levels of the image",
                    range.base_mip_level, range.level_count, self.mip_levels,
                )
                .into(),
                objects: [self.handle.into()].into_iter().collect(),
                kind: ErrorKind::StateMismatch,
                ..Default::default()
            })
            .set_vuids(&[
                "VUID-VkImageMemoryBarrier2-subresourceRange-01486",
                "VUID-VkImageMemoryBarrier2-subresourceRange-01724",
            ])
        })?;

        let array_layers = resolve_range(
            range.base_array_layer,
            range.layer_count,
            vk::REMAINING_ARRAY_LAYERS,
            self.array_layers,
        )
        .ok_or_else(|| {
            Box::new(ValidationError {
                context: "base_array_layer".into(),
                problem: format!(
                    "the array layers {} + {} are not within the {} array layers of the image",
                    range.base_array_layer, range.layer_count, self.array_layers,
                )
                .into(),
                objects: [self.handle.into()].into_iter().collect(),
                kind: ErrorKind::StateMismatch,
                ..Default::default()
            })
            .set_vuids(&[
                "VUID-VkImageMemoryBarrier2-subresourceRange-01488",
                "VUID-VkImageMemoryBarrier2-subresourceRange-01725",
            ])
        })?;

        Ok(ImageSubresourceRange {
            aspects,
            mip_levels,
            array_layers,
        })
    }

    /// Returns an iterator over subresource ranges.
    ///
    /// In ranges, the subresources are "flattened" to `DeviceSize`, where each index in the range
    /// is a single array layer. Aspects of `subresource_range` that the image doesn't have are
    /// ignored.
    pub fn iter_ranges(
        &self,
        subresource_range: &ImageSubresourceRange,
    ) -> SubresourceRangeIterator {
        SubresourceRangeIterator::new(
            subresource_range,
            &self.aspect_list,
            self.aspect_size,
            self.mip_levels,
            self.mip_level_size,
            self.array_layers,
        )
    }

    /// Converts a flattened range back to the subresources it covers. The range must have been
    /// produced by [`iter_ranges`](Self::iter_ranges), or by
    /// [`split_at_mip_levels`](Self::split_at_mip_levels).
    pub fn range_to_subresources(&self, mut range: Range<DeviceSize>) -> ImageSubresourceRange {
        debug_assert!(!range.is_empty());
        debug_assert!(range.end <= self.range_size);

        if range.end - range.start > self.aspect_size {
            let start_aspect_num = (range.start / self.aspect_size) as usize;
            let end_aspect_num = range.end.div_ceil(self.aspect_size) as usize;

            ImageSubresourceRange {
                aspects: self.aspect_list[start_aspect_num..end_aspect_num]
                    .iter()
                    .fold(vk::ImageAspectFlags::empty(), |acc, &a| acc | a),
                mip_levels: 0..self.mip_levels,
                array_layers: 0..self.array_layers,
            }
        } else {
            let aspect_num = (range.start / self.aspect_size) as usize;
            range.start %= self.aspect_size;
            range.end %= self.aspect_size;

            // Wraparound
            if range.end == 0 {
                range.end = self.aspect_size;
            }

            if range.end - range.start > self.mip_level_size {
                let start_mip_level = (range.start / self.mip_level_size) as u32;
                let end_mip_level = range.end.div_ceil(self.mip_level_size) as u32;

                ImageSubresourceRange {
                    aspects: self.aspect_list[aspect_num],
                    mip_levels: start_mip_level..end_mip_level,
                    array_layers: 0..self.array_layers,
                }
            } else {
                let mip_level = (range.start / self.mip_level_size) as u32;
                range.start %= self.mip_level_size;
                range.end %= self.mip_level_size;

                // Wraparound
                if range.end == 0 {
                    range.end = self.mip_level_size;
                }

                ImageSubresourceRange {
                    aspects: self.aspect_list[aspect_num],
                    mip_levels: mip_level..mip_level + 1,
                    array_layers: range.start as u32..range.end as u32,
                }
            }
        }
    }

    /// Splits a flattened range at the boundaries between aspects.
    pub fn split_by_aspect(
        &self,
        range: Range<DeviceSize>,
    ) -> impl Iterator<Item = (vk::ImageAspectFlags, Range<DeviceSize>)> + '_ {
        let aspect_size = self.aspect_size;
        let mut start = range.start;

        iter::from_fn(move || {
            if start >= range.end {
                return None;
            }

            let end = cmp::min(range.end, (start / aspect_size + 1) * aspect_size);
            let piece = start..end;
            start = end;

            Some((self.aspect_of(piece.start), piece))
        })
    }

    /// Splits a flattened range within one aspect into pieces that each convert exactly to a
    /// subresource range: the partial mip levels at either end, and the whole ones in between.
    pub fn split_at_mip_levels(
        &self,
        range: Range<DeviceSize>,
    ) -> SmallVec<[Range<DeviceSize>; 3]> {
        debug_assert!(range.end <= (range.start / self.aspect_size + 1) * self.aspect_size);

        let mip_level_size = self.mip_level_size;
        let mut pieces = SmallVec::new();
        let mut start = range.start;

        if start % mip_level_size != 0 {
            let end = cmp::min(range.end, start.next_multiple_of(mip_level_size));
            pieces.push(start..end);
            start = end;
        }

        let whole_end = range.end - range.end % mip_level_size;

        if whole_end > start {
            pieces.push(start..whole_end);
            start = whole_end;
        }

        if start < range.end {
            pieces.push(start..range.end);
        }

        pieces
    }

    /// Returns the aspect that the flattened index belongs to.
    pub fn aspect_of(&self, index: DeviceSize) -> vk::ImageAspectFlags {
        self.aspect_list
            .get((index / self.aspect_size) as usize)
            .copied()
            .unwrap_or_default()
    }
}

fn resolve_range(base: u32, count: u32, remaining: u32, total: u32) -> Option<Range<u32>> {
    if base >= total {
        return None;
    }

    let end = if count == remaining {
        total
    } else {
        base.checked_add(count).filter(|&end| end <= total && count != 0)?
    };

    Some(base..end)
}

#[derive(Clone)]
pub struct SubresourceRangeIterator {
    next_fn: fn(&mut Self) -> Option<Range<DeviceSize>>,
    image_aspect_size: DeviceSize,
    image_mip_level_size: DeviceSize,
    mip_levels: Range<u32>,
    array_layers: Range<u32>,

    aspect_nums: Peekable<smallvec::IntoIter<[usize; 4]>>,
    current_aspect_num: Option<usize>,
    current_mip_level: u32,
}

impl SubresourceRangeIterator {
    fn new(
        subresource_range: &ImageSubresourceRange,
        image_aspect_list: &[vk::ImageAspectFlags],
        image_aspect_size: DeviceSize,
        image_mip_levels: u32,
        image_mip_level_size: DeviceSize,
        image_array_layers: u32,
    ) -> Self {
        let mip_levels = subresource_range.mip_levels.start
            ..subresource_range.mip_levels.end.min(image_mip_levels);
        let array_layers = subresource_range.array_layers.start
            ..subresource_range.array_layers.end.min(image_array_layers);

        let next_fn = if array_layers.start != 0 || array_layers.end != image_array_layers {
            Self::next_some_layers
        } else if mip_levels.start != 0 || mip_levels.end != image_mip_levels {
            Self::next_some_levels_all_layers
        } else {
            Self::next_all_levels_all_layers
        };

        let mut aspect_nums = if mip_levels.is_empty() || array_layers.is_empty() {
            SmallVec::new()
        } else {
            image_aspect_list
                .iter()
                .enumerate()
                .filter(|&(_, &aspect)| subresource_range.aspects.contains(aspect))
                .map(|(aspect_num, _)| aspect_num)
                .collect::<SmallVec<[usize; 4]>>()
        }
        .into_iter()
        .peekable();
        let current_aspect_num = aspect_nums.next();
        let current_mip_level = mip_levels.start;

        Self {
            next_fn,
            image_aspect_size,
            image_mip_level_size,
            mip_levels,
            array_layers,

            aspect_nums,
            current_aspect_num,
            current_mip_level,
        }
    }

    /// Used when the requested range contains only a subset of the array layers in the image.
    /// The iterator returns one range for each mip level and aspect, each covering the range of
    /// array layers of that mip level and aspect.
    fn next_some_layers(&mut self) -> Option<Range<DeviceSize>> {
        self.current_aspect_num.map(|aspect_num| {
            let mip_level_offset = aspect_num as DeviceSize * self.image_aspect_size
                + self.current_mip_level as DeviceSize * self.image_mip_level_size;
            self.current_mip_level += 1;

            if self.current_mip_level >= self.mip_levels.end {
                self.current_mip_level = self.mip_levels.start;
                self.current_aspect_num = self.aspect_nums.next();
            }

            let start = mip_level_offset + self.array_layers.start as DeviceSize;
            let end = mip_level_offset + self.array_layers.end as DeviceSize;
            start..end
        })
    }

    /// Used when the requested range contains all array layers in the image, but not all mip
    /// levels. The iterator returns one range for each aspect, each covering all layers of the
    /// range of mip levels of that aspect.
    fn next_some_levels_all_layers(&mut self) -> Option<Range<DeviceSize>> {
        self.current_aspect_num.map(|aspect_num| {
            let aspect_offset = aspect_num as DeviceSize * self.image_aspect_size;
            self.current_aspect_num = self.aspect_nums.next();

            let start =
                aspect_offset + self.mip_levels.start as DeviceSize * self.image_mip_level_size;
            let end = aspect_offset + self.mip_levels.end as DeviceSize * self.image_mip_level_size;
            start..end
        })
    }

    /// Used when the requested range contains all array layers and mip levels in the image.
    /// The iterator returns one range for each series of adjacent aspect numbers, each covering
    /// all mip levels and all layers of those aspects. If the range contains the whole image, then
    /// exactly one range is returned since all aspect numbers will be adjacent.
    fn next_all_levels_all_layers(&mut self) -> Option<Range<DeviceSize>> {
        self.current_aspect_num.map(|aspect_num_start| {
            self.current_aspect_num = self.aspect_nums.next();
            let mut aspect_num_end = aspect_num_start + 1;

            while self.current_aspect_num == Some(aspect_num_end) {
                self.current_aspect_num = self.aspect_nums.next();
                aspect_num_end += 1;
            }

            let start = aspect_num_start as DeviceSize * self.image_aspect_size;
            let end = aspect_num_end as DeviceSize * self.image_aspect_size;
            start..end
        })
    }
}

impl Iterator for SubresourceRangeIterator {
    type Item = Range<DeviceSize>;

    fn next(&mut self) -> Option<Self::Item> {
        (self.next_fn)(self)
    }
}

impl FusedIterator for SubresourceRangeIterator {}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn depth_stencil_image() -> ImageState {
        ImageState::new(
            vk::Image::from_raw(1),
            &ImageCreateInfo {
                format: vk::Format::D24_UNORM_S8_UINT,
                mip_levels: 3,
                array_layers: 4,
                ..Default::default()
            },
        )
    }

    #[test]
    fn whole_image_is_one_range() {
        let image = depth_stencil_image();
        assert_eq!(image.range_size(), 24);

        let ranges: Vec<_> = image.iter_ranges(&image.subresource_range()).collect();
        assert_eq!(ranges, vec![0..24]);
        assert_eq!(image.layouts().len(), 1);
    }

    #[test]
    fn some_layers_yield_one_range_per_level_and_aspect() {
        let image = depth_stencil_image();
        let ranges: Vec<_> = image
            .iter_ranges(&ImageSubresourceRange {
                aspects: vk::ImageAspectFlags::STENCIL,
                mip_levels: 1..3,
                array_layers: 1..2,
            })
            .collect();

        // Stencil is the second aspect, so its indices start at 12.
        assert_eq!(ranges, vec![17..18, 21..22]);
    }

    #[test]
    fn some_levels_all_layers() {
        let image = depth_stencil_image();
        let ranges: Vec<_> = image
            .iter_ranges(&ImageSubresourceRange {
                aspects: vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
                mip_levels: 1..2,
                array_layers: 0..4,
            })
            .collect();
        assert_eq!(ranges, vec![4..8, 16..20]);
    }

    #[test]
    fn range_to_subresources_inverts_iter_ranges() {
        let image = depth_stencil_image();
        let subresource_range = ImageSubresourceRange {
            aspects: vk::ImageAspectFlags::DEPTH,
            mip_levels: 2..3,
            array_layers: 1..3,
        };
        let range = image.iter_ranges(&subresource_range).next().unwrap();
        assert_eq!(image.range_to_subresources(range), subresource_range);

        assert_eq!(image.range_to_subresources(0..24), image.subresource_range());
    }

    #[test]
    fn resolve_remaining() {
        let image = depth_stencil_image();
        let resolved = image
            .resolve_subresource_range(&vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::DEPTH,
                base_mip_level: 1,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: 2,
            })
            .unwrap();
        assert_eq!(resolved.mip_levels, 1..3);
        assert_eq!(resolved.array_layers, 0..2);

        let err = image
            .resolve_subresource_range(&vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::DEPTH,
                base_mip_level: 2,
                level_count: 2,
                base_array_layer: 0,
                layer_count: 1,
            })
            .unwrap_err();
        assert_eq!(err.rule_id(), "VUID-VkImageMemoryBarrier2-subresourceRange-01486");

        assert!(image
            .resolve_subresource_range(&vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .is_err());
    }

    #[test]
    fn split_by_aspect() {
        let image = depth_stencil_image();
        let pieces: Vec<_> = image.split_by_aspect(8..14).collect();
        assert_eq!(
            pieces,
            vec![
                (vk::ImageAspectFlags::DEPTH, 8..12),
                (vk::ImageAspectFlags::STENCIL, 12..14),
            ],
        );
    }

    #[test]
    fn split_at_mip_levels() {
        let image = depth_stencil_image();

        assert_eq!(image.split_at_mip_levels(2..11).as_slice(), [2..4, 4..8, 8..11]);
        assert_eq!(image.split_at_mip_levels(5..7).as_slice(), [5..7]);
        assert_eq!(image.split_at_mip_levels(12..20).as_slice(), [12..20]);

        let subresources: Vec<_> = image
            .split_at_mip_levels(2..6)
            .into_iter()
            .map(|piece| image.range_to_subresources(piece))
            .collect();
        assert_eq!(
            subresources,
            vec![
                ImageSubresourceRange {
                    aspects: vk::ImageAspectFlags::DEPTH,
                    mip_levels: 0..1,
                    array_layers: 2..4,
                },
                ImageSubresourceRange {
                    aspects: vk::ImageAspectFlags::DEPTH,
                    mip_levels: 1..2,
                    array_layers: 0..2,
                },
            ],
        );
    }

    #[test]
    fn subresource_index_and_layout() {
        let image = depth_stencil_image();
        let subresource = ImageSubresource {
            aspect: vk::ImageAspectFlags::STENCIL,
            mip_level: 2,
            array_layer: 3,
        };
        assert_eq!(image.subresource_index(subresource), Some(23));
        assert_eq!(image.aspect_of(23), vk::ImageAspectFlags::STENCIL);
        assert_eq!(image.layout(subresource), Some(vk::ImageLayout::UNDEFINED));
        assert_eq!(
            image.subresource_index(ImageSubresource {
                aspect: vk::ImageAspectFlags::COLOR,
                ..subresource
            }),
            None,
        );
    }
}
