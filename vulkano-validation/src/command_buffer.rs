//! Shadow state of command pools and command buffers.
//!
//! A command buffer moves through the states of [`CommandBufferLifecycle`]. The checks in this
//! module only look at a single command buffer and its pool; everything that needs the rest of the
//! device lives in [`device`](crate::device).

use crate::{
    image::ImageSubresourceRange, layout::ImageLayoutOverlay, qfo::QfoBarrierSets,
    render_pass::RenderPass, ErrorKind, ObjectHandle, ValidationError,
};
use ash::vk;
use smallvec::SmallVec;
use std::sync::Arc;

/// The state of a command buffer, as defined by the command buffer lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CommandBufferLifecycle {
    /// Freshly allocated, or reset. Can only be begun.
    #[default]
    Initial,

    /// Between begin and end. Commands can be recorded.
    Recording,

    /// Ended, and ready to be submitted or executed.
    Executable,

    /// Submitted, and not yet known to be finished executing.
    Pending,

    /// An object that a recorded command uses was destroyed, or a one-time-submit command buffer
    /// finished executing.
    Invalid,
}

/// The shadow state of a command pool.
#[derive(Debug)]
pub struct CommandPoolState {
    handle: vk::CommandPool,
    queue_family_index: u32,
    flags: vk::CommandPoolCreateFlags,
    pub(crate) command_buffers: SmallVec<[vk::CommandBuffer; 8]>,
}

impl CommandPoolState {
    pub fn new(
        handle: vk::CommandPool,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Self {
        CommandPoolState {
            handle,
            queue_family_index,
            flags,
            command_buffers: SmallVec::new(),
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.handle
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    #[inline]
    pub fn flags(&self) -> vk::CommandPoolCreateFlags {
        self.flags
    }

    /// Returns the command buffers that are allocated from the pool.
    #[inline]
    pub fn command_buffers(&self) -> &[vk::CommandBuffer] {
        &self.command_buffers
    }

    /// Returns whether command buffers allocated from the pool can be reset individually.
    #[inline]
    pub fn allows_individual_reset(&self) -> bool {
        self.flags
            .contains(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
    }
}

/// Parameters to begin a new render pass.
#[derive(Clone, Debug)]
pub struct RenderPassBeginInfo<'a> {
    /// The render pass to begin.
    ///
    /// There is no default value.
    pub render_pass: vk::RenderPass,

    /// The images to use as attachments, one per attachment description of the render pass.
    ///
    /// The default value is empty.
    pub attachments: &'a [RenderPassAttachment],
}

impl<'a> RenderPassBeginInfo<'a> {
    #[inline]
    pub fn new(render_pass: vk::RenderPass, attachments: &'a [RenderPassAttachment]) -> Self {
        Self {
            render_pass,
            attachments,
        }
    }
}

/// The image that an attachment is bound to when a render pass begins.
#[derive(Clone, Debug)]
pub struct RenderPassAttachment {
    pub image: vk::Image,

    /// The part of the image that the attachment covers. `REMAINING_*` values are resolved
    /// against the image.
    pub subresource_range: vk::ImageSubresourceRange,
}

/// The command buffers of one batch of a queue submission.
#[derive(Clone, Debug, Default)]
pub struct SubmitInfo<'a> {
    /// The command buffers to execute, in order.
    ///
    /// The default value is empty.
    pub command_buffers: &'a [vk::CommandBuffer],
}

/// A render pass instance that has begun in a command buffer, and has not ended yet.
#[derive(Clone, Debug)]
pub struct RenderPassInstance {
    pub render_pass: Arc<RenderPass>,
    pub subpass: u32,

    /// The image and subresource range that each attachment is bound to.
    pub attachments: Vec<(vk::Image, ImageSubresourceRange)>,
}

/// The shadow state of a command buffer.
#[derive(Debug)]
pub struct CommandBufferState {
    handle: vk::CommandBuffer,
    pool: vk::CommandPool,
    level: vk::CommandBufferLevel,
    queue_family_index: u32,
    lifecycle: CommandBufferLifecycle,
    usage: vk::CommandBufferUsageFlags,
    pending_submits: u32,

    pub(crate) layouts: ImageLayoutOverlay,
    pub(crate) qfo_barriers: QfoBarrierSets,
    pub(crate) render_pass: Option<RenderPassInstance>,
    pub(crate) render_passes_used: SmallVec<[vk::RenderPass; 2]>,
    pub(crate) secondaries: SmallVec<[vk::CommandBuffer; 4]>,
}

impl CommandBufferState {
    pub fn new(
        handle: vk::CommandBuffer,
        pool: &CommandPoolState,
        level: vk::CommandBufferLevel,
    ) -> Self {
        CommandBufferState {
            handle,
            pool: pool.handle(),
            level,
            queue_family_index: pool.queue_family_index(),
            lifecycle: CommandBufferLifecycle::Initial,
            usage: vk::CommandBufferUsageFlags::empty(),
            pending_submits: 0,
            layouts: ImageLayoutOverlay::new(),
            qfo_barriers: QfoBarrierSets::new(),
            render_pass: None,
            render_passes_used: SmallVec::new(),
            secondaries: SmallVec::new(),
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    #[inline]
    pub fn pool(&self) -> vk::CommandPool {
        self.pool
    }

    #[inline]
    pub fn level(&self) -> vk::CommandBufferLevel {
        self.level
    }

    #[inline]
    pub fn is_primary(&self) -> bool {
        self.level == vk::CommandBufferLevel::PRIMARY
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    #[inline]
    pub fn lifecycle(&self) -> CommandBufferLifecycle {
        self.lifecycle
    }

    #[inline]
    pub fn usage(&self) -> vk::CommandBufferUsageFlags {
        self.usage
    }

    /// Returns the image layout transitions recorded so far.
    #[inline]
    pub fn layouts(&self) -> &ImageLayoutOverlay {
        &self.layouts
    }

    /// Returns the ownership transfer barriers recorded so far.
    #[inline]
    pub fn qfo_barriers(&self) -> &QfoBarrierSets {
        &self.qfo_barriers
    }

    /// Returns the active render pass instance.
    #[inline]
    pub fn render_pass(&self) -> Option<&RenderPassInstance> {
        self.render_pass.as_ref()
    }

    /// Returns the secondary command buffers executed in this one.
    #[inline]
    pub fn secondaries(&self) -> &[vk::CommandBuffer] {
        &self.secondaries
    }

    #[inline]
    pub fn is_submit_pending(&self) -> bool {
        self.pending_submits != 0
    }

    /// Returns whether a command recorded so far refers to `object`.
    pub fn uses_object(&self, object: ObjectHandle) -> bool {
        match object {
            ObjectHandle::Image(image) => {
                self.layouts.contains_image(image)
                    || self.render_pass.as_ref().is_some_and(|instance| {
                        instance.attachments.iter().any(|&(i, _)| i == image)
                    })
                    || self.qfo_uses(object)
            }
            ObjectHandle::Buffer(_) => self.qfo_uses(object),
            ObjectHandle::RenderPass(render_pass) => {
                self.render_passes_used.contains(&render_pass)
            }
            ObjectHandle::CommandBuffer(command_buffer) => {
                self.secondaries.contains(&command_buffer)
            }
            ObjectHandle::CommandPool(_) | ObjectHandle::Queue(_) => false,
        }
    }

    fn qfo_uses(&self, object: ObjectHandle) -> bool {
        self.qfo_barriers
            .releases()
            .chain(self.qfo_barriers.acquires())
            .any(|barrier| barrier.key.resource.object() == object)
    }

    fn error(
        &self,
        problem: String,
        vuids: &'static [&'static str],
    ) -> Box<ValidationError> {
        Box::new(ValidationError {
            context: "command_buffer".into(),
            problem: problem.into(),
            vuids,
            objects: [self.handle.into()].into_iter().collect(),
            kind: ErrorKind::Protocol,
        })
    }

    pub fn validate_begin(&self, pool: &CommandPoolState) -> Result<(), Box<ValidationError>> {
        match self.lifecycle {
            CommandBufferLifecycle::Initial => Ok(()),
            CommandBufferLifecycle::Recording | CommandBufferLifecycle::Pending => Err(self.error(
                format!("is in the {:?} state", self.lifecycle),
                &["VUID-vkBeginCommandBuffer-commandBuffer-00049"],
            )),
            CommandBufferLifecycle::Executable | CommandBufferLifecycle::Invalid => {
                if pool.allows_individual_reset() {
                    Ok(())
                } else {
                    Err(self.error(
                        format!(
                            "is in the {:?} state, and its pool was not created with \
                            `RESET_COMMAND_BUFFER`, so it can't be reset implicitly",
                            self.lifecycle,
                        ),
                        &["VUID-vkBeginCommandBuffer-commandBuffer-00050"],
                    ))
                }
            }
        }
    }

    /// Begins recording, resetting the command buffer first if needed.
    pub(crate) fn begin(&mut self, usage: vk::CommandBufferUsageFlags) {
        self.reset();
        self.usage = usage;
        self.lifecycle = CommandBufferLifecycle::Recording;
    }

    pub fn validate_end(&self) -> Result<(), Box<ValidationError>> {
        self.validate_recording(&["VUID-vkEndCommandBuffer-commandBuffer-00059"])?;

        if self.is_primary() && self.render_pass.is_some() {
            return Err(self.error(
                "has an active render pass instance".into(),
                &["VUID-vkEndCommandBuffer-commandBuffer-00060"],
            ));
        }

        Ok(())
    }

    pub(crate) fn end(&mut self) {
        self.lifecycle = CommandBufferLifecycle::Executable;
    }

    pub fn validate_reset(&self, pool: &CommandPoolState) -> Result<(), Box<ValidationError>> {
        if self.lifecycle == CommandBufferLifecycle::Pending {
            return Err(self.error(
                "is in the pending state".into(),
                &["VUID-vkResetCommandBuffer-commandBuffer-00045"],
            ));
        }

        if !pool.allows_individual_reset() {
            return Err(self.error(
                "was allocated from a pool that was not created with `RESET_COMMAND_BUFFER`"
                    .into(),
                &["VUID-vkResetCommandBuffer-commandBuffer-00046"],
            ));
        }

        Ok(())
    }

    /// Returns the command buffer to the initial state, dropping everything that was recorded.
    pub(crate) fn reset(&mut self) {
        self.lifecycle = CommandBufferLifecycle::Initial;
        self.usage = vk::CommandBufferUsageFlags::empty();
        self.layouts.clear();
        self.qfo_barriers.clear();
        self.render_pass = None;
        self.render_passes_used.clear();
        self.secondaries.clear();
    }

    /// Checks that commands can be recorded.
    pub fn validate_recording(
        &self,
        vuids: &'static [&'static str],
    ) -> Result<(), Box<ValidationError>> {
        if self.lifecycle != CommandBufferLifecycle::Recording {
            return Err(self.error(
                format!("is in the {:?} state, not the recording state", self.lifecycle),
                vuids,
            ));
        }

        Ok(())
    }

    /// Checks that the command buffer can be submitted to a queue of `queue_family_index`.
    pub fn validate_submit(&self, queue_family_index: u32) -> Vec<Box<ValidationError>> {
        let mut errors = Vec::new();

        if !self.is_primary() {
            errors.push(self.error(
                "is a secondary command buffer".into(),
                &["VUID-VkSubmitInfo-pCommandBuffers-00075"],
            ));
        }

        if self.queue_family_index != queue_family_index {
            errors.push(self.error(
                format!(
                    "belongs to queue family {}, but the queue belongs to queue family {}",
                    self.queue_family_index, queue_family_index,
                ),
                &["VUID-vkQueueSubmit-pCommandBuffers-00074"],
            ));
        }

        errors.extend(self.validate_executable(
            &["VUID-vkQueueSubmit-pCommandBuffers-00070"],
            &["VUID-vkQueueSubmit-pCommandBuffers-00071"],
        ));

        errors
    }

    /// Checks that the command buffer is ready to be executed, either by a submission or by a
    /// primary command buffer.
    pub fn validate_executable(
        &self,
        state_vuids: &'static [&'static str],
        simultaneous_vuids: &'static [&'static str],
    ) -> Option<Box<ValidationError>> {
        match self.lifecycle {
            CommandBufferLifecycle::Executable => None,
            CommandBufferLifecycle::Pending => (!self
                .usage
                .contains(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE))
            .then(|| {
                self.error(
                    "is in the pending state, and was not begun with `SIMULTANEOUS_USE`".into(),
                    simultaneous_vuids,
                )
            }),
            CommandBufferLifecycle::Initial
            | CommandBufferLifecycle::Recording
            | CommandBufferLifecycle::Invalid => Some(self.error(
                format!(
                    "is in the {:?} state, not the executable or pending state",
                    self.lifecycle,
                ),
                state_vuids,
            )),
        }
    }

    pub(crate) fn add_submit(&mut self) {
        self.pending_submits += 1;
        self.lifecycle = CommandBufferLifecycle::Pending;
    }

    /// Marks one submission of the command buffer as finished. Returns `true` if it was the last
    /// pending one.
    pub(crate) fn set_submit_finished(&mut self) -> bool {
        if self.pending_submits == 0 {
            return false;
        }

        self.pending_submits -= 1;

        if self.pending_submits != 0 {
            return false;
        }

        if self.lifecycle == CommandBufferLifecycle::Pending {
            self.lifecycle = if self
                .usage
                .contains(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            {
                CommandBufferLifecycle::Invalid
            } else {
                CommandBufferLifecycle::Executable
            };
        }

        true
    }

    /// Moves the command buffer to the invalid state, because something it uses was destroyed.
    pub(crate) fn invalidate(&mut self) {
        match self.lifecycle {
            CommandBufferLifecycle::Recording | CommandBufferLifecycle::Executable => {
                self.lifecycle = CommandBufferLifecycle::Invalid;
            }
            CommandBufferLifecycle::Initial
            | CommandBufferLifecycle::Pending
            | CommandBufferLifecycle::Invalid => (),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn pool(flags: vk::CommandPoolCreateFlags) -> CommandPoolState {
        CommandPoolState::new(vk::CommandPool::from_raw(1), 0, flags)
    }

    fn primary(pool: &CommandPoolState) -> CommandBufferState {
        CommandBufferState::new(
            vk::CommandBuffer::from_raw(2),
            pool,
            vk::CommandBufferLevel::PRIMARY,
        )
    }

    #[test]
    fn lifecycle() {
        let pool = pool(vk::CommandPoolCreateFlags::empty());
        let mut cb = primary(&pool);
        assert_eq!(cb.lifecycle(), CommandBufferLifecycle::Initial);
        assert!(cb.validate_end().is_err());

        assert!(cb.validate_begin(&pool).is_ok());
        cb.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        assert_eq!(
            cb.validate_begin(&pool).unwrap_err().rule_id(),
            "VUID-vkBeginCommandBuffer-commandBuffer-00049",
        );
        assert!(cb.validate_recording(&["VUID-test"]).is_ok());

        assert!(cb.validate_end().is_ok());
        cb.end();
        assert!(cb.validate_submit(0).is_empty());

        // The pool doesn't allow an implicit reset.
        assert_eq!(
            cb.validate_begin(&pool).unwrap_err().rule_id(),
            "VUID-vkBeginCommandBuffer-commandBuffer-00050",
        );

        cb.add_submit();
        assert_eq!(
            cb.validate_submit(0)[0].rule_id(),
            "VUID-vkQueueSubmit-pCommandBuffers-00071",
        );
        assert!(cb.set_submit_finished());
        assert_eq!(cb.lifecycle(), CommandBufferLifecycle::Invalid);
    }

    #[test]
    fn simultaneous_use() {
        let pool = pool(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let mut cb = primary(&pool);
        cb.begin(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);
        cb.end();
        cb.add_submit();
        assert!(cb.validate_submit(0).is_empty());
        cb.add_submit();

        assert!(!cb.set_submit_finished());
        assert_eq!(cb.lifecycle(), CommandBufferLifecycle::Pending);
        assert!(cb.set_submit_finished());
        assert_eq!(cb.lifecycle(), CommandBufferLifecycle::Executable);

        // Implicit reset is allowed by the pool.
        assert!(cb.validate_begin(&pool).is_ok());
    }

    #[test]
    fn submit_checks() {
        let pool = pool(vk::CommandPoolCreateFlags::empty());
        let secondary = CommandBufferState::new(
            vk::CommandBuffer::from_raw(3),
            &pool,
            vk::CommandBufferLevel::SECONDARY,
        );
        let vuids: Vec<_> = secondary
            .validate_submit(1)
            .iter()
            .map(|err| err.rule_id())
            .collect();
        assert_eq!(
            vuids,
            [
                "VUID-VkSubmitInfo-pCommandBuffers-00075",
                "VUID-vkQueueSubmit-pCommandBuffers-00074",
                "VUID-vkQueueSubmit-pCommandBuffers-00070",
            ],
        );
    }

    #[test]
    fn reset_clears_recorded_state() {
        let pool = pool(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let mut cb = primary(&pool);
        cb.begin(vk::CommandBufferUsageFlags::empty());
        cb.secondaries.push(vk::CommandBuffer::from_raw(9));
        cb.end();

        cb.invalidate();
        assert_eq!(cb.lifecycle(), CommandBufferLifecycle::Invalid);
        assert!(cb.validate_reset(&pool).is_ok());
        cb.reset();
        assert_eq!(cb.lifecycle(), CommandBufferLifecycle::Initial);
        assert!(cb.secondaries().is_empty());
        assert!(cb.layouts().is_empty());
        assert!(cb.qfo_barriers().is_empty());
    }
}
