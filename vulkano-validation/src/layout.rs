//! Tracking of image layouts across command buffers and submissions.
//!
//! Every command buffer records the transitions it makes into an [`ImageLayoutOverlay`]. Nothing
//! is written to the image itself until the command buffer is submitted: at that point
//! [`SubmitLayouts`] checks that the first use of each range in the overlay agrees with the layout
//! the range will really have, and then folds the overlay into the image's authoritative map.

use crate::{
    image::{ImageState, ImageSubresourceRange},
    range_map::RangeMap,
    DeviceSize, ErrorKind, ValidationError,
};
use ash::vk;
use foldhash::HashMap;
use smallvec::SmallVec;
use std::ops::Range;

/// The layout state of a range of subresources in a command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LayoutEntry {
    /// The layout that the first use of the range in the command buffer expects. `UNDEFINED` means
    /// that the first use discards the contents, so any layout is acceptable.
    pub initial: vk::ImageLayout,

    /// The layout that the range is in after the last transition recorded so far.
    pub current: vk::ImageLayout,
}

/// The image layout transitions recorded into a single command buffer.
#[derive(Clone, Debug, Default)]
pub struct ImageLayoutOverlay {
    images: HashMap<vk::Image, RangeMap<DeviceSize, LayoutEntry>>,
}

impl ImageLayoutOverlay {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.images.clear();
    }

    /// Returns the layout map of `image`, if the command buffer has used it.
    #[inline]
    pub fn get(&self, image: vk::Image) -> Option<&RangeMap<DeviceSize, LayoutEntry>> {
        self.images.get(&image)
    }

    /// Returns whether the command buffer has used `image`.
    #[inline]
    pub fn contains_image(&self, image: vk::Image) -> bool {
        self.images.contains_key(&image)
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (vk::Image, &RangeMap<DeviceSize, LayoutEntry>)> {
        self.images.iter().map(|(&image, map)| (image, map))
    }

    /// Records a transition of `subresource_range` from `old_layout` to `new_layout`.
    ///
    /// Ranges that the command buffer has used before keep their first-use expectation. Ranges
    /// that are new to the command buffer get `old_layout` as their expectation.
    pub fn record_transition(
        &mut self,
        image: &ImageState,
        subresource_range: &ImageSubresourceRange,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        let map = self.images.entry(image.handle()).or_default();

        for range in image.iter_ranges(subresource_range) {
            map.update(range, |prev| LayoutEntry {
                initial: prev.map_or(old_layout, |entry| entry.initial),
                current: new_layout,
            });
        }
    }

    /// Records that `subresource_range` is expected to be in `layout`, without transitioning it.
    #[inline]
    pub fn record_expectation(
        &mut self,
        image: &ImageState,
        subresource_range: &ImageSubresourceRange,
        layout: vk::ImageLayout,
    ) {
        self.record_transition(image, subresource_range, layout, layout);
    }

    /// Appends the transitions of a command buffer executed after the ones recorded so far.
    pub fn merge(&mut self, other: &ImageLayoutOverlay) {
        for (&image, other_map) in &other.images {
            let map = self.images.entry(image).or_default();

            for (range, other_entry) in other_map.iter() {
                map.update(range, |prev| LayoutEntry {
                    initial: prev.map_or(other_entry.initial, |entry| entry.initial),
                    current: other_entry.current,
                });
            }
        }
    }

    /// Returns the layout that `index` of `image` is in after the recorded transitions.
    /// Falls back to the authoritative layout of the image.
    pub fn expected_layout(
        &self,
        image: &ImageState,
        index: DeviceSize,
    ) -> Option<vk::ImageLayout> {
        self.images
            .get(&image.handle())
            .and_then(|map| map.get(&index))
            .map(|entry| entry.current)
            .or_else(|| image.layouts().get(&index).copied())
    }

    /// Removes the ranges of `image`. Used when the image is destroyed.
    #[inline]
    pub(crate) fn remove_image(&mut self, image: vk::Image) -> bool {
        self.images.remove(&image).is_some()
    }
}

/// Checks that `subresource_range` of `image` is in `declared_layout`, after the transitions
/// recorded in `overlay`.
///
/// Every mismatching piece is reported separately.
pub fn validate_layout(
    image: &ImageState,
    overlay: &ImageLayoutOverlay,
    subresource_range: &ImageSubresourceRange,
    declared_layout: vk::ImageLayout,
    vuids: &'static [&'static str],
) -> Vec<Box<ValidationError>> {
    let mut errors = Vec::new();

    if declared_layout == vk::ImageLayout::UNDEFINED {
        return errors;
    }

    let overlay_map = overlay.get(image.handle());

    for range in image.iter_ranges(subresource_range) {
        for (piece, expected_layout) in resolve_layouts(image, overlay_map, |e| e.current, range) {
            check_piece(
                image,
                piece,
                expected_layout,
                declared_layout,
                vuids,
                &mut errors,
            );
        }
    }

    errors
}

/// Returns the pieces of `range` together with their layout. Pieces covered by `layered` take the
/// layout from there, gaps fall back to the authoritative layout of the image.
fn resolve_layouts<V>(
    image: &ImageState,
    layered: Option<&RangeMap<DeviceSize, V>>,
    project: impl Fn(&V) -> vk::ImageLayout,
    range: Range<DeviceSize>,
) -> SmallVec<[(Range<DeviceSize>, vk::ImageLayout); 4]>
where
    V: Eq + Clone,
{
    let mut pieces = SmallVec::new();

    let Some(layered) = layered else {
        pieces.extend(
            image
                .layouts()
                .range(&range)
                .map(|(piece, &layout)| (piece, layout)),
        );
        return pieces;
    };

    pieces.extend(
        layered
            .range(&range)
            .map(|(piece, value)| (piece, project(value))),
    );

    for gap in layered.gaps(&range) {
        pieces.extend(
            image
                .layouts()
                .range(&gap)
                .map(|(piece, &layout)| (piece, layout)),
        );
    }

    pieces
}

fn check_piece(
    image: &ImageState,
    piece: Range<DeviceSize>,
    expected_layout: vk::ImageLayout,
    declared_layout: vk::ImageLayout,
    vuids: &'static [&'static str],
    errors: &mut Vec<Box<ValidationError>>,
) {
    for (aspect, piece) in image.split_by_aspect(piece) {
        if layouts_match(expected_layout, declared_layout, aspect) {
            continue;
        }

        for piece in image.split_at_mip_levels(piece) {
            let subresources = image.range_to_subresources(piece);
            errors.push(Box::new(ValidationError {
                problem: format!(
                    "{:?} of {:?} (mip levels {:?}, array layers {:?}) is in layout {:?}, but the \
                    declared layout is {:?}",
                    subresources.aspects,
                    image.handle(),
                    subresources.mip_levels,
                    subresources.array_layers,
                    expected_layout,
                    declared_layout,
                )
                .into(),
                vuids,
                objects: [image.handle().into()].into_iter().collect(),
                kind: ErrorKind::StateMismatch,
                ..Default::default()
            }));
        }
    }
}

/// Returns whether a range in `expected` layout can be used as if it were in `declared`.
pub fn layouts_match(
    expected: vk::ImageLayout,
    declared: vk::ImageLayout,
    aspect: vk::ImageAspectFlags,
) -> bool {
    expected == declared
        || expected == vk::ImageLayout::UNDEFINED
        || declared == vk::ImageLayout::UNDEFINED
        || normalize_layout(expected, aspect) == normalize_layout(declared, aspect)
}

/// Returns the layout that `layout` means for a single `aspect`.
pub fn normalize_layout(layout: vk::ImageLayout, aspect: vk::ImageAspectFlags) -> vk::ImageLayout {
    let depth = aspect == vk::ImageAspectFlags::DEPTH;
    let stencil = aspect == vk::ImageAspectFlags::STENCIL;

    match layout {
        vk::ImageLayout::ATTACHMENT_OPTIMAL if depth => vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        vk::ImageLayout::ATTACHMENT_OPTIMAL if stencil => {
            vk::ImageLayout::STENCIL_ATTACHMENT_OPTIMAL
        }
        vk::ImageLayout::ATTACHMENT_OPTIMAL => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        vk::ImageLayout::READ_ONLY_OPTIMAL if depth => vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL,
        vk::ImageLayout::READ_ONLY_OPTIMAL if stencil => {
            vk::ImageLayout::STENCIL_READ_ONLY_OPTIMAL
        }
        vk::ImageLayout::READ_ONLY_OPTIMAL => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL
            if depth =>
        {
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
        }
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        | vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL
            if depth =>
        {
            vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL
        }
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL
            if stencil =>
        {
            vk::ImageLayout::STENCIL_ATTACHMENT_OPTIMAL
        }
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        | vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL
            if stencil =>
        {
            vk::ImageLayout::STENCIL_READ_ONLY_OPTIMAL
        }
        _ => layout,
    }
}

/// The command that an image layout is used in, for the purpose of the usage check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayoutUse {
    Barrier,
    RenderPassBegin,
}

/// Returns the usage that an image needs to be put in `layout`, and the rule that requires it.
/// The image needs at least one of the returned usage flags.
pub fn required_usage(
    layout: vk::ImageLayout,
    layout_use: LayoutUse,
) -> Option<(vk::ImageUsageFlags, &'static [&'static str])> {
    let (usage, barrier_vuids, begin_vuids): (
        vk::ImageUsageFlags,
        &'static [&'static str],
        &'static [&'static str],
    ) = match layout {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
            &["VUID-VkImageMemoryBarrier2-oldLayout-01208"],
            &["VUID-vkCmdBeginRenderPass-initialLayout-00895"],
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::STENCIL_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL
        | vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            &["VUID-VkImageMemoryBarrier2-oldLayout-01209"],
            &["VUID-vkCmdBeginRenderPass-initialLayout-01758"],
        ),
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => (
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::INPUT_ATTACHMENT,
            &["VUID-VkImageMemoryBarrier2-oldLayout-01210"],
            &["VUID-vkCmdBeginRenderPass-initialLayout-00896"],
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::INPUT_ATTACHMENT,
            &["VUID-VkImageMemoryBarrier2-oldLayout-01211"],
            &["VUID-vkCmdBeginRenderPass-initialLayout-00897"],
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::ImageUsageFlags::TRANSFER_SRC,
            &["VUID-VkImageMemoryBarrier2-oldLayout-01212"],
            &["VUID-vkCmdBeginRenderPass-initialLayout-00898"],
        ),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::ImageUsageFlags::TRANSFER_DST,
            &["VUID-VkImageMemoryBarrier2-oldLayout-01213"],
            &["VUID-vkCmdBeginRenderPass-initialLayout-00899"],
        ),
        _ => return None,
    };

    match layout_use {
        LayoutUse::Barrier => Some((usage, barrier_vuids)),
        LayoutUse::RenderPassBegin => Some((usage, begin_vuids)),
    }
}

/// Checks that `image` was created with a usage that allows it to be in `layout`.
pub fn validate_layout_usage(
    image: &ImageState,
    layout: vk::ImageLayout,
    layout_use: LayoutUse,
) -> Result<(), Box<ValidationError>> {
    let Some((usage, vuids)) = required_usage(layout, layout_use) else {
        return Ok(());
    };

    if image.usage().intersects(usage) {
        return Ok(());
    }

    Err(Box::new(ValidationError {
        problem: format!(
            "the layout is {:?}, but {:?} was not created with any of the usages {:?}",
            layout,
            image.handle(),
            usage,
        )
        .into(),
        vuids,
        objects: [image.handle().into()].into_iter().collect(),
        kind: ErrorKind::StateMismatch,
        ..Default::default()
    }))
}

/// Checks the first-use expectations of a secondary command buffer's overlay against the layouts
/// that `primary` leaves the images in. Images that are not in `images` are skipped.
pub fn validate_secondary_overlay(
    images: &HashMap<vk::Image, ImageState>,
    primary: &ImageLayoutOverlay,
    secondary: &ImageLayoutOverlay,
    vuids: &'static [&'static str],
) -> Vec<Box<ValidationError>> {
    validate_first_uses(
        images,
        secondary,
        |handle| primary.get(handle),
        |entry: &LayoutEntry| entry.current,
        vuids,
    )
}

fn validate_first_uses<'a, V: Eq + Clone + 'a>(
    images: &HashMap<vk::Image, ImageState>,
    overlay: &ImageLayoutOverlay,
    layered: impl Fn(vk::Image) -> Option<&'a RangeMap<DeviceSize, V>>,
    project: impl Fn(&V) -> vk::ImageLayout + Copy,
    vuids: &'static [&'static str],
) -> Vec<Box<ValidationError>> {
    let mut errors = Vec::new();

    for (handle, map) in overlay.iter() {
        let Some(image) = images.get(&handle) else {
            continue;
        };
        let layered = layered(handle);

        for (range, entry) in map.iter() {
            if entry.initial == vk::ImageLayout::UNDEFINED {
                continue;
            }

            for (piece, layout) in resolve_layouts(image, layered, project, range) {
                check_piece(image, piece, layout, entry.initial, vuids, &mut errors);
            }
        }
    }

    errors
}

/// Folds the overlays of the command buffers of a submission, in submission order, and checks each
/// overlay against the layouts left behind by the ones before it.
#[derive(Debug, Default)]
pub struct SubmitLayouts {
    written: HashMap<vk::Image, RangeMap<DeviceSize, vk::ImageLayout>>,
}

impl SubmitLayouts {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks the first-use expectations of `overlay`. Images that are not in `images` are
    /// skipped.
    pub fn validate_overlay(
        &self,
        images: &HashMap<vk::Image, ImageState>,
        overlay: &ImageLayoutOverlay,
    ) -> Vec<Box<ValidationError>> {
        validate_first_uses(
            images,
            overlay,
            |handle| self.written.get(&handle),
            |&layout: &vk::ImageLayout| layout,
            &["UNASSIGNED-CoreValidation-DrawState-InvalidImageLayout"],
        )
    }

    /// Applies the transitions of `overlay` after the ones folded so far.
    pub fn fold_overlay(&mut self, overlay: &ImageLayoutOverlay) {
        for (handle, map) in overlay.iter() {
            self.written
                .entry(handle)
                .or_default()
                .merge_from(map, |entry| entry.current);
        }
    }

    /// Writes the folded layouts into the authoritative maps of the images.
    pub fn commit(self, images: &mut HashMap<vk::Image, ImageState>) {
        for (handle, written) in self.written {
            match images.get_mut(&handle) {
                Some(image) => image.commit_layouts(&written),
                None => log::trace!("skipping layout commit of destroyed image {:?}", handle),
            }
        }
    }
}
