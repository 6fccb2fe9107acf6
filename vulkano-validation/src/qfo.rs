//! Matching of queue family ownership transfers.
//!
//! Transferring an exclusively shared resource to another queue family takes two barriers: a
//! release, recorded into a command buffer of the source queue family, and an acquire with the
//! same parameters, recorded into a command buffer of the destination queue family. The release
//! must be submitted first.
//!
//! Each command buffer collects its transfer barriers in [`QfoBarrierSets`]. When command buffers
//! are submitted, a [`Scoreboard`] checks their barriers against the device-wide
//! [`PendingReleases`], and the releases and acquires of the submission are committed to it
//! afterwards.

use crate::{
    image::ImageSubresourceRange,
    sync::{is_external_queue_family, Sharing},
    DeviceSize, ErrorKind, ObjectHandle, ValidationError,
};
use ash::vk;
use foldhash::{HashMap, HashSet};
use std::ops::Range;

/// The resource that an ownership transfer applies to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum QfoResource {
    Image {
        image: vk::Image,
        subresource_range: ImageSubresourceRange,
    },
    Buffer {
        buffer: vk::Buffer,
        range: Range<DeviceSize>,
    },
}

impl QfoResource {
    #[inline]
    pub fn object(&self) -> ObjectHandle {
        match self {
            QfoResource::Image { image, .. } => (*image).into(),
            QfoResource::Buffer { buffer, .. } => (*buffer).into(),
        }
    }

    fn vuids(&self, rule: QfoRule) -> &'static [&'static str] {
        match (self, rule) {
            (QfoResource::Image { .. }, QfoRule::DuplicateInCommandBuffer) => {
                &["UNASSIGNED-VkImageMemoryBarrier-image-00001"]
            }
            (QfoResource::Image { .. }, QfoRule::DuplicateInSubmission) => {
                &["UNASSIGNED-VkImageMemoryBarrier-image-00002"]
            }
            (QfoResource::Image { .. }, QfoRule::DuplicateRelease) => {
                &["UNASSIGNED-VkImageMemoryBarrier-image-00003"]
            }
            (QfoResource::Image { .. }, QfoRule::MissingRelease) => {
                &["UNASSIGNED-VkImageMemoryBarrier-image-00004"]
            }
            (QfoResource::Buffer { .. }, QfoRule::DuplicateInCommandBuffer) => {
                &["UNASSIGNED-VkBufferMemoryBarrier-buffer-00001"]
            }
            (QfoResource::Buffer { .. }, QfoRule::DuplicateInSubmission) => {
                &["UNASSIGNED-VkBufferMemoryBarrier-buffer-00002"]
            }
            (QfoResource::Buffer { .. }, QfoRule::DuplicateRelease) => {
                &["UNASSIGNED-VkBufferMemoryBarrier-buffer-00003"]
            }
            (QfoResource::Buffer { .. }, QfoRule::MissingRelease) => {
                &["UNASSIGNED-VkBufferMemoryBarrier-buffer-00004"]
            }
        }
    }
}

#[derive(Clone, Copy)]
enum QfoRule {
    DuplicateInCommandBuffer,
    DuplicateInSubmission,
    DuplicateRelease,
    MissingRelease,
}

/// Identifies an ownership transfer. A release and an acquire with the same key are two halves of
/// the same transfer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QfoTransferKey {
    pub resource: QfoResource,
    pub src_queue_family_index: u32,
    pub dst_queue_family_index: u32,
}

/// One half of an ownership transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QfoTransferBarrier {
    pub key: QfoTransferKey,

    /// For buffers, both layouts are `UNDEFINED`.
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
}

/// Which half of an ownership transfer a barrier is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QfoDirection {
    Release,
    Acquire,
}

/// Determines whether a barrier recorded into a command buffer of `queue_family_index` is part of
/// an ownership transfer, and if so, which half.
pub fn classify_transfer(
    src_queue_family_index: u32,
    dst_queue_family_index: u32,
    sharing: &Sharing,
    queue_family_index: u32,
) -> Result<Option<QfoDirection>, Box<ValidationError>> {
    if !sharing.is_exclusive()
        || src_queue_family_index == dst_queue_family_index
        || src_queue_family_index == vk::QUEUE_FAMILY_IGNORED
        || dst_queue_family_index == vk::QUEUE_FAMILY_IGNORED
    {
        return Ok(None);
    }

    if src_queue_family_index == queue_family_index {
        Ok(Some(QfoDirection::Release))
    } else if dst_queue_family_index == queue_family_index {
        Ok(Some(QfoDirection::Acquire))
    } else {
        Err(Box::new(ValidationError {
            problem: format!(
                "the barrier transfers ownership from queue family {} to queue family {}, but \
                the command buffer belongs to queue family {}",
                src_queue_family_index, dst_queue_family_index, queue_family_index,
            )
            .into(),
            vuids: &["UNASSIGNED-CoreValidation-Barrier-QueueFamilyNotInvolved"],
            kind: ErrorKind::Protocol,
            ..Default::default()
        }))
    }
}

/// The ownership transfer barriers recorded into a single command buffer.
#[derive(Clone, Debug, Default)]
pub struct QfoBarrierSets {
    releases: HashMap<QfoTransferKey, QfoTransferBarrier>,
    acquires: HashMap<QfoTransferKey, QfoTransferBarrier>,
}

impl QfoBarrierSets {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.releases.is_empty() && self.acquires.is_empty()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.releases.clear();
        self.acquires.clear();
    }

    #[inline]
    pub fn releases(&self) -> impl ExactSizeIterator<Item = &QfoTransferBarrier> {
        self.releases.values()
    }

    #[inline]
    pub fn acquires(&self) -> impl ExactSizeIterator<Item = &QfoTransferBarrier> {
        self.acquires.values()
    }

    fn set(&self, direction: QfoDirection) -> &HashMap<QfoTransferKey, QfoTransferBarrier> {
        match direction {
            QfoDirection::Release => &self.releases,
            QfoDirection::Acquire => &self.acquires,
        }
    }

    /// Checks that none of `barriers` is already in the sets, and that none of them appears twice.
    pub fn validate_new<'a>(
        &self,
        barriers: impl IntoIterator<Item = (QfoDirection, &'a QfoTransferBarrier)>,
    ) -> Vec<Box<ValidationError>> {
        let mut errors = Vec::new();
        let mut seen = HashSet::default();

        for (direction, barrier) in barriers {
            if self.set(direction).contains_key(&barrier.key)
                || !seen.insert((direction, &barrier.key))
            {
                errors.push(duplicate_error(
                    barrier,
                    direction,
                    QfoRule::DuplicateInCommandBuffer,
                    "command buffer",
                ));
            }
        }

        errors
    }

    /// Adds a barrier to the sets. Returns `false` if the same transfer was already recorded in the
    /// same direction, in which case the set is left unchanged.
    pub fn insert(&mut self, direction: QfoDirection, barrier: QfoTransferBarrier) -> bool {
        let set = match direction {
            QfoDirection::Release => &mut self.releases,
            QfoDirection::Acquire => &mut self.acquires,
        };

        if set.contains_key(&barrier.key) {
            return false;
        }

        set.insert(barrier.key.clone(), barrier);
        true
    }

    /// Checks that the barriers of `other` can be added to the sets.
    pub fn validate_merge(&self, other: &QfoBarrierSets) -> Vec<Box<ValidationError>> {
        self.validate_new(
            other
                .releases()
                .map(|barrier| (QfoDirection::Release, barrier))
                .chain(
                    other
                        .acquires()
                        .map(|barrier| (QfoDirection::Acquire, barrier)),
                ),
        )
    }

    /// Adds the barriers of a secondary command buffer that is executed in this one.
    pub fn merge(&mut self, other: &QfoBarrierSets) {
        for barrier in other.releases() {
            self.insert(QfoDirection::Release, barrier.clone());
        }

        for barrier in other.acquires() {
            self.insert(QfoDirection::Acquire, barrier.clone());
        }
    }
}

fn duplicate_error(
    barrier: &QfoTransferBarrier,
    direction: QfoDirection,
    rule: QfoRule,
    scope: &str,
) -> Box<ValidationError> {
    let key = &barrier.key;

    Box::new(ValidationError {
        problem: format!(
            "the {} of {:?} from queue family {} to queue family {} is duplicated in the same {}",
            direction_name(direction),
            key.resource,
            key.src_queue_family_index,
            key.dst_queue_family_index,
            scope,
        )
        .into(),
        vuids: key.resource.vuids(rule),
        objects: [key.resource.object()].into_iter().collect(),
        kind: ErrorKind::Uniqueness,
        ..Default::default()
    })
}

fn direction_name(direction: QfoDirection) -> &'static str {
    match direction {
        QfoDirection::Release => "release",
        QfoDirection::Acquire => "acquire",
    }
}

/// A release that has been submitted, and not yet acquired.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingRelease {
    pub barrier: QfoTransferBarrier,
    pub command_buffer: vk::CommandBuffer,
}

/// The releases that have been submitted on the device, and not yet acquired.
#[derive(Debug, Default)]
pub struct PendingReleases {
    releases: HashMap<QfoTransferKey, PendingRelease>,
}

impl PendingReleases {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.releases.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.releases.is_empty()
    }

    #[inline]
    pub fn get(&self, key: &QfoTransferKey) -> Option<&PendingRelease> {
        self.releases.get(key)
    }

    #[inline]
    pub fn contains(&self, key: &QfoTransferKey) -> bool {
        self.releases.contains_key(key)
    }

    #[inline]
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &PendingRelease> {
        self.releases.values()
    }

    /// Applies a validated submission. Acquired transfers are removed first, then the releases of
    /// the submission are added.
    pub fn commit(&mut self, submission: QfoSubmission) {
        let QfoSubmission { acquired, released } = submission;

        for key in acquired {
            if self.releases.remove(&key).is_some() {
                log::trace!("ownership transfer of {:?} completed", key.resource);
            }
        }

        for release in released {
            if is_external_queue_family(release.barrier.key.dst_queue_family_index) {
                continue;
            }

            self.releases
                .insert(release.barrier.key.clone(), release);
        }
    }
}

/// The ownership transfers of one submission, to be committed to [`PendingReleases`].
#[derive(Clone, Debug, Default)]
pub struct QfoSubmission {
    acquired: Vec<QfoTransferKey>,
    released: Vec<PendingRelease>,
}

impl QfoSubmission {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.acquired.is_empty() && self.released.is_empty()
    }
}

/// Tracks the transfers released and acquired so far in a submission that is being validated.
#[derive(Debug)]
pub struct Scoreboard<'a> {
    pending: &'a PendingReleases,
    released: HashMap<QfoTransferKey, vk::CommandBuffer>,
    acquired: HashMap<QfoTransferKey, vk::CommandBuffer>,
    submission: QfoSubmission,
}

impl<'a> Scoreboard<'a> {
    #[inline]
    pub fn new(pending: &'a PendingReleases) -> Self {
        Scoreboard {
            pending,
            released: HashMap::default(),
            acquired: HashMap::default(),
            submission: QfoSubmission::default(),
        }
    }

    /// Checks the transfer barriers of the next command buffer of the submission.
    pub fn validate_command_buffer(
        &mut self,
        command_buffer: vk::CommandBuffer,
        sets: &QfoBarrierSets,
    ) -> Vec<Box<ValidationError>> {
        let mut errors = Vec::new();

        for barrier in sets.releases() {
            let key = &barrier.key;

            if let Some(pending) = self.pending.get(key) {
                let mut err = duplicate_error(
                    barrier,
                    QfoDirection::Release,
                    QfoRule::DuplicateRelease,
                    "device",
                );
                err.problem = format!(
                    "{}; it was released by {:?}, and has not been acquired yet",
                    err.problem, pending.command_buffer,
                )
                .into();
                err.objects.push(pending.command_buffer.into());
                errors.push(err);
            } else if let Some(&other) = self.released.get(key) {
                let mut err = duplicate_error(
                    barrier,
                    QfoDirection::Release,
                    QfoRule::DuplicateInSubmission,
                    "submission",
                );
                err.objects.push(other.into());
                errors.push(err);
            } else {
                self.released.insert(key.clone(), command_buffer);
                self.submission.released.push(PendingRelease {
                    barrier: barrier.clone(),
                    command_buffer,
                });
            }
        }

        for barrier in sets.acquires() {
            let key = &barrier.key;

            if let Some(&other) = self.acquired.get(key) {
                let mut err = duplicate_error(
                    barrier,
                    QfoDirection::Acquire,
                    QfoRule::DuplicateInSubmission,
                    "submission",
                );
                err.problem = format!("{}, which is a double-acquire", err.problem).into();
                err.objects.push(other.into());
                errors.push(err);
                continue;
            }

            if !is_external_queue_family(key.src_queue_family_index) && !self.pending.contains(key)
            {
                errors.push(Box::new(ValidationError {
                    problem: format!(
                        "{:?} is acquired from queue family {} by queue family {}, without a \
                        prior release",
                        key.resource, key.src_queue_family_index, key.dst_queue_family_index,
                    )
                    .into(),
                    vuids: key.resource.vuids(QfoRule::MissingRelease),
                    objects: [key.resource.object(), command_buffer.into()]
                        .into_iter()
                        .collect(),
                    kind: ErrorKind::StateMismatch,
                    ..Default::default()
                }));
            }

            self.acquired.insert(key.clone(), command_buffer);
            self.submission.acquired.push(key.clone());
        }

        errors
    }

    /// Finishes the submission, returning what is to be committed if it passes validation.
    #[inline]
    pub fn finish(self) -> QfoSubmission {
        self.submission
    }
}
