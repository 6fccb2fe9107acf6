//! The validation context of a logical device, and the entry points of the intercepted calls.
//!
//! All state of a device lives in a [`DeviceValidator`], behind a single [`RwLock`]. Validation
//! takes it for reading, and so does recording into a command buffer, whose own state sits behind
//! a [`Mutex`] that is uncontended as long as the application honors external synchronization.
//! Creating and destroying objects and committing submissions take it for writing.
//!
//! The state lock is always taken before a command buffer mutex, and at most one command buffer
//! mutex is held at a time.

use crate::{
    command_buffer::{
        CommandBufferLifecycle, CommandBufferState, CommandPoolState, RenderPassBeginInfo,
        RenderPassInstance, SubmitInfo,
    },
    image::{ImageCreateInfo, ImageState, ImageSubresource, ImageSubresourceRange},
    layout::{self, ImageLayoutOverlay, LayoutUse, SubmitLayouts},
    qfo::{
        self, PendingRelease, PendingReleases, QfoBarrierSets, QfoDirection, QfoResource,
        QfoSubmission, QfoTransferBarrier, QfoTransferKey, Scoreboard,
    },
    render_pass::{split_stencil_layout, RenderPass, RenderPassCreateInfo},
    report::{MessageSink, Reporter},
    settings::ValidationSettings,
    sync::{BufferMemoryBarrier, DependencyInfo, ImageMemoryBarrier, Sharing},
    DeviceSize, ErrorKind, ObjectHandle, ValidationError,
};
use ash::vk;
use foldhash::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::{
    borrow::Cow,
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
    mem,
    sync::Arc,
};

/// Proof that a call passed validation. Only the matching `record_*` method accepts it.
#[must_use = "a validated call must be passed to the matching `record_*` method"]
#[derive(Debug)]
pub struct Checked<T> {
    value: T,
}

/// Returned when a call failed validation. The call must not be passed on to the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SkipCall;

impl Display for SkipCall {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.write_str("the call failed validation and must be skipped")
    }
}

impl Error for SkipCall {}

/// A validated `vkBeginCommandBuffer`.
#[derive(Debug)]
pub struct BeginCommandBuffer {
    command_buffer: vk::CommandBuffer,
    usage: vk::CommandBufferUsageFlags,
}

/// A validated `vkEndCommandBuffer`.
#[derive(Debug)]
pub struct EndCommandBuffer {
    command_buffer: vk::CommandBuffer,
}

/// A validated `vkResetCommandBuffer`.
#[derive(Debug)]
pub struct ResetCommandBuffer {
    command_buffer: vk::CommandBuffer,
}

/// A validated `vkCmdPipelineBarrier2`.
#[derive(Debug)]
pub struct PipelineBarrier {
    command_buffer: vk::CommandBuffer,
    image_barriers: Vec<ResolvedImageBarrier>,
    transfers: Vec<(QfoDirection, QfoTransferBarrier)>,
}

#[derive(Debug)]
struct ResolvedImageBarrier {
    image: vk::Image,
    subresource_range: ImageSubresourceRange,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    release: bool,
}

/// A validated `vkCmdBeginRenderPass`.
#[derive(Debug)]
pub struct BeginRenderPass {
    command_buffer: vk::CommandBuffer,
    instance: Option<RenderPassInstance>,
}

/// A validated `vkCmdNextSubpass`.
#[derive(Debug)]
pub struct NextSubpass {
    command_buffer: vk::CommandBuffer,
}

/// A validated `vkCmdEndRenderPass`.
#[derive(Debug)]
pub struct EndRenderPass {
    command_buffer: vk::CommandBuffer,
}

/// A validated `vkCmdExecuteCommands`.
#[derive(Debug)]
pub struct ExecuteCommands {
    command_buffer: vk::CommandBuffer,
    secondaries: Vec<SecondarySnapshot>,
}

#[derive(Debug)]
struct SecondarySnapshot {
    index: usize,
    handle: vk::CommandBuffer,
    layouts: ImageLayoutOverlay,
    qfo_barriers: QfoBarrierSets,
}

/// A validated `vkQueueSubmit`.
#[derive(Debug)]
pub struct QueueSubmit {
    queue: vk::Queue,
    command_buffers: Vec<vk::CommandBuffer>,
    layouts: SubmitLayouts,
    transfers: QfoSubmission,
}

#[derive(Debug)]
struct BufferState {
    size: DeviceSize,
    sharing: Sharing,
}

#[derive(Debug)]
struct QueueState {
    queue_family_index: u32,

    // Primary command buffers that were submitted and haven't been retired, with repetitions.
    in_flight: Vec<vk::CommandBuffer>,
}

#[derive(Debug, Default)]
struct DeviceState {
    images: HashMap<vk::Image, ImageState>,
    buffers: HashMap<vk::Buffer, BufferState>,
    render_passes: HashMap<vk::RenderPass, Arc<RenderPass>>,
    command_pools: HashMap<vk::CommandPool, CommandPoolState>,
    command_buffers: HashMap<vk::CommandBuffer, Mutex<CommandBufferState>>,
    queues: HashMap<vk::Queue, QueueState>,
    pending_releases: PendingReleases,
}

impl DeviceState {
    fn command_buffer(
        &self,
        handle: vk::CommandBuffer,
        vuids: &'static [&'static str],
    ) -> Result<&Mutex<CommandBufferState>, Box<ValidationError>> {
        self.command_buffers
            .get(&handle)
            .ok_or_else(|| unknown_object("command_buffer", handle, vuids))
    }

    fn command_pool(
        &self,
        handle: vk::CommandPool,
        vuids: &'static [&'static str],
    ) -> Result<&CommandPoolState, Box<ValidationError>> {
        self.command_pools
            .get(&handle)
            .ok_or_else(|| unknown_object("command_pool", handle, vuids))
    }

    fn image(
        &self,
        handle: vk::Image,
        vuids: &'static [&'static str],
    ) -> Result<&ImageState, Box<ValidationError>> {
        self.images
            .get(&handle)
            .ok_or_else(|| unknown_object("image", handle, vuids))
    }

    fn buffer(
        &self,
        handle: vk::Buffer,
        vuids: &'static [&'static str],
    ) -> Result<&BufferState, Box<ValidationError>> {
        self.buffers
            .get(&handle)
            .ok_or_else(|| unknown_object("buffer", handle, vuids))
    }

    fn render_pass(
        &self,
        handle: vk::RenderPass,
        vuids: &'static [&'static str],
    ) -> Result<&Arc<RenderPass>, Box<ValidationError>> {
        self.render_passes
            .get(&handle)
            .ok_or_else(|| unknown_object("render_pass", handle, vuids))
    }

    /// Reports every command buffer in `command_buffers` that has a submission in flight.
    fn pending_errors(
        &self,
        command_buffers: &[vk::CommandBuffer],
        vuids: &'static [&'static str],
    ) -> Vec<Box<ValidationError>> {
        command_buffers
            .iter()
            .filter(|&handle| {
                self.command_buffers
                    .get(handle)
                    .is_some_and(|command_buffer| command_buffer.lock().is_submit_pending())
            })
            .map(|&handle| {
                Box::new(ValidationError {
                    context: "command_buffers".into(),
                    problem: format!("{:?} is in the pending state", handle).into(),
                    vuids,
                    objects: [handle.into()].into_iter().collect(),
                    kind: ErrorKind::Protocol,
                })
            })
            .collect()
    }

    /// Moves every command buffer that refers to `object` to the invalid state.
    fn invalidate_users(&mut self, object: ObjectHandle) {
        for command_buffer in self.command_buffers.values_mut() {
            let command_buffer = command_buffer.get_mut();

            if command_buffer.uses_object(object) {
                if let ObjectHandle::Image(image) = object {
                    command_buffer.layouts.remove_image(image);
                }

                command_buffer.invalidate();
                log::debug!(
                    "{:?} is invalid because {} was destroyed",
                    command_buffer.handle(),
                    object,
                );
            }
        }
    }

    /// Marks one submission of `handle`, and of the secondaries executed in it, as finished.
    fn retire(&mut self, handle: vk::CommandBuffer) {
        let Some(command_buffer) = self.command_buffers.get_mut(&handle) else {
            log::trace!("{:?} was freed while in flight", handle);
            return;
        };
        let command_buffer = command_buffer.get_mut();

        if command_buffer.set_submit_finished() {
            log::trace!(
                "{:?} finished executing, now {:?}",
                handle,
                command_buffer.lifecycle(),
            );
        }

        let secondaries = command_buffer.secondaries.clone();

        for secondary in secondaries {
            if let Some(secondary) = self.command_buffers.get_mut(&secondary) {
                secondary.get_mut().set_submit_finished();
            }
        }
    }
}

fn unknown_object(
    context: &'static str,
    object: impl Into<ObjectHandle>,
    vuids: &'static [&'static str],
) -> Box<ValidationError> {
    let object = object.into();

    Box::new(ValidationError {
        context: context.into(),
        problem: format!("{} is not a known object", object).into(),
        vuids,
        objects: [object].into_iter().collect(),
        kind: ErrorKind::Protocol,
    })
}

fn protocol_error(
    command_buffer: vk::CommandBuffer,
    problem: &'static str,
    vuids: &'static [&'static str],
) -> Box<ValidationError> {
    Box::new(ValidationError {
        context: "command_buffer".into(),
        problem: problem.into(),
        vuids,
        objects: [command_buffer.into()].into_iter().collect(),
        kind: ErrorKind::Protocol,
    })
}

/// Runs the validation and, if it passes, the recording of a call. Returns whether the call must
/// be skipped.
fn run<T>(validated: Result<Checked<T>, SkipCall>, record: impl FnOnce(Checked<T>)) -> bool {
    match validated {
        Ok(checked) => {
            record(checked);
            false
        }
        Err(SkipCall) => true,
    }
}

/// The resource-state validator of a single logical device.
///
/// Objects are registered with the validator as the application creates them. Each command comes
/// in three flavors: `validate_*` checks the call and returns a [`Checked`] token, `record_*`
/// applies the call to the tracked state, and the method without prefix does both and returns
/// whether the driver call must be skipped.
#[derive(Debug)]
pub struct DeviceValidator {
    settings: ValidationSettings,
    reporter: Reporter,
    state: RwLock<DeviceState>,
}

impl DeviceValidator {
    /// Creates a new validator that reports to `sink`.
    pub fn new(settings: ValidationSettings, sink: Arc<dyn MessageSink>) -> Self {
        let reporter = Reporter::new(
            sink,
            settings.duplicate_message_limit,
            &settings.message_id_filter,
        );

        DeviceValidator {
            settings,
            reporter,
            state: RwLock::new(DeviceState::default()),
        }
    }

    #[inline]
    pub fn settings(&self) -> &ValidationSettings {
        &self.settings
    }

    fn check<T>(
        &self,
        errors: Vec<Box<ValidationError>>,
        value: T,
    ) -> Result<Checked<T>, SkipCall> {
        if self.reporter.report_all(errors) {
            Err(SkipCall)
        } else {
            Ok(Checked { value })
        }
    }

    /// Runs `f` on a command buffer for recording. Command buffers that were freed since the call
    /// was validated are skipped.
    fn record_into(
        &self,
        handle: vk::CommandBuffer,
        f: impl FnOnce(&DeviceState, &mut CommandBufferState),
    ) {
        let state = self.state.read();

        match state.command_buffers.get(&handle) {
            Some(command_buffer) => f(&state, &mut command_buffer.lock()),
            None => log::trace!("{:?} was freed before the command was recorded", handle),
        }
    }

    /// Registers a queue of the device.
    pub fn register_queue(&self, queue: vk::Queue, queue_family_index: u32) {
        self.state.write().queues.insert(
            queue,
            QueueState {
                queue_family_index,
                in_flight: Vec::new(),
            },
        );
    }

    /// Registers a newly created image. Its layout map starts out in the initial layout.
    pub fn create_image(&self, handle: vk::Image, create_info: &ImageCreateInfo) {
        let image = ImageState::new(handle, create_info);
        log::debug!(
            "tracking {:?} with {} subresources in {:?}",
            handle,
            image.range_size(),
            create_info.initial_layout,
        );
        self.state.write().images.insert(handle, image);
    }

    /// Forgets an image. Command buffers that use it become invalid.
    pub fn destroy_image(&self, handle: vk::Image) {
        let mut state = self.state.write();

        if state.images.remove(&handle).is_none() {
            log::trace!("destroying unknown {:?}", handle);
            return;
        }

        state.invalidate_users(handle.into());
    }

    /// Registers a newly created buffer.
    pub fn create_buffer(&self, handle: vk::Buffer, size: DeviceSize, sharing: Sharing) {
        log::debug!("tracking {:?} of {} bytes", handle, size);
        self.state
            .write()
            .buffers
            .insert(handle, BufferState { size, sharing });
    }

    /// Forgets a buffer. Command buffers that transfer its ownership become invalid.
    pub fn destroy_buffer(&self, handle: vk::Buffer) {
        let mut state = self.state.write();

        if state.buffers.remove(&handle).is_some() {
            state.invalidate_users(handle.into());
        }
    }

    /// Registers a newly created command pool.
    pub fn create_command_pool(
        &self,
        handle: vk::CommandPool,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) {
        self.state.write().command_pools.insert(
            handle,
            CommandPoolState::new(handle, queue_family_index, flags),
        );
    }

    /// Destroys a command pool, freeing its command buffers. Returns whether the call must be
    /// skipped.
    pub fn destroy_command_pool(&self, handle: vk::CommandPool) -> bool {
        let mut state = self.state.write();

        let errors =
            match state.command_pool(handle, &["VUID-vkDestroyCommandPool-commandPool-parameter"]) {
                Ok(pool) => state.pending_errors(
                    pool.command_buffers(),
                    &["VUID-vkDestroyCommandPool-commandPool-00041"],
                ),
                Err(err) => vec![err],
            };

        if self.reporter.report_all(errors) {
            return true;
        }

        if let Some(pool) = state.command_pools.remove(&handle) {
            for command_buffer in pool.command_buffers() {
                state.command_buffers.remove(command_buffer);
            }

            log::debug!(
                "destroyed {:?} and {} command buffers",
                handle,
                pool.command_buffers().len(),
            );
        }

        false
    }

    /// Resets every command buffer of a command pool. Returns whether the call must be skipped.
    pub fn reset_command_pool(&self, handle: vk::CommandPool) -> bool {
        let mut state = self.state.write();

        let errors =
            match state.command_pool(handle, &["VUID-vkResetCommandPool-commandPool-parameter"]) {
                Ok(pool) => state.pending_errors(
                    pool.command_buffers(),
                    &["VUID-vkResetCommandPool-commandPool-00040"],
                ),
                Err(err) => vec![err],
            };

        if self.reporter.report_all(errors) {
            return true;
        }

        let state = &mut *state;

        if let Some(pool) = state.command_pools.get(&handle) {
            for command_buffer in pool.command_buffers() {
                if let Some(command_buffer) = state.command_buffers.get_mut(command_buffer) {
                    command_buffer.get_mut().reset();
                }
            }
        }

        false
    }

    /// Registers command buffers allocated from `pool`. Returns whether the call must be skipped.
    pub fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        command_buffers: &[vk::CommandBuffer],
    ) -> bool {
        let result = {
            let mut state = self.state.write();
            let state = &mut *state;

            match state.command_pools.get_mut(&pool) {
                Some(pool_state) => {
                    for &handle in command_buffers {
                        let command_buffer = CommandBufferState::new(handle, pool_state, level);
                        state
                            .command_buffers
                            .insert(handle, Mutex::new(command_buffer));
                        pool_state.command_buffers.push(handle);
                    }

                    Ok(())
                }
                None => Err(unknown_object(
                    "allocate_info.command_pool",
                    pool,
                    &["VUID-VkCommandBufferAllocateInfo-commandPool-parameter"],
                )),
            }
        };

        match result {
            Ok(()) => false,
            Err(err) => self.reporter.report(&err),
        }
    }

    /// Frees command buffers of `pool`. Returns whether the call must be skipped.
    pub fn free_command_buffers(
        &self,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    ) -> bool {
        let mut state = self.state.write();

        let errors =
            match state.command_pool(pool, &["VUID-vkFreeCommandBuffers-commandPool-parameter"]) {
                Ok(_) => state.pending_errors(
                    command_buffers,
                    &["VUID-vkFreeCommandBuffers-pCommandBuffers-00047"],
                ),
                Err(err) => vec![err],
            };

        if self.reporter.report_all(errors) {
            return true;
        }

        for handle in command_buffers {
            state.command_buffers.remove(handle);
        }

        if let Some(pool) = state.command_pools.get_mut(&pool) {
            pool.command_buffers
                .retain(|handle| !command_buffers.contains(handle));
        }

        false
    }

    /// Builds, checks and registers a render pass. Returns whether the call must be skipped, in
    /// which case the render pass is not registered.
    ///
    /// Everything happens under one write lock, so the render pass is built exactly once even if
    /// the application races two creations against each other.
    pub fn create_render_pass(
        &self,
        handle: vk::RenderPass,
        create_info: RenderPassCreateInfo,
    ) -> bool {
        let mut state = self.state.write();

        let (render_pass, errors) = RenderPass::new(
            handle,
            create_info,
            self.settings.render_pass_dependencies,
        );

        if self.reporter.report_all(errors) {
            return true;
        }

        log::debug!(
            "tracking {:?} with {} subpasses and {} dependency edges",
            handle,
            render_pass.subpasses().len(),
            render_pass.graph().edges().len(),
        );
        state.render_passes.insert(handle, Arc::new(render_pass));

        false
    }

    /// Forgets a render pass. Command buffers that used it become invalid.
    pub fn destroy_render_pass(&self, handle: vk::RenderPass) {
        let mut state = self.state.write();

        if state.render_passes.remove(&handle).is_some() {
            state.invalidate_users(handle.into());
        }
    }

    pub fn validate_begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> Result<Checked<BeginCommandBuffer>, SkipCall> {
        let errors = {
            let state = self.state.read();
            let result = (|| {
                const VUIDS: &[&str] = &["VUID-vkBeginCommandBuffer-commandBuffer-parameter"];
                let command_buffer = state.command_buffer(command_buffer, VUIDS)?.lock();
                let pool = state.command_pool(command_buffer.pool(), VUIDS)?;

                command_buffer.validate_begin(pool)
            })();

            result.err().into_iter().collect()
        };

        self.check(
            errors,
            BeginCommandBuffer {
                command_buffer,
                usage,
            },
        )
    }

    pub fn record_begin_command_buffer(&self, checked: Checked<BeginCommandBuffer>) {
        let BeginCommandBuffer {
            command_buffer,
            usage,
        } = checked.value;

        self.record_into(command_buffer, |_, command_buffer| {
            command_buffer.begin(usage);
        });
    }

    /// Begins recording a command buffer. Returns whether the call must be skipped.
    pub fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> bool {
        run(
            self.validate_begin_command_buffer(command_buffer, usage),
            |checked| self.record_begin_command_buffer(checked),
        )
    }

    pub fn validate_end_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<Checked<EndCommandBuffer>, SkipCall> {
        let errors = {
            let state = self.state.read();
            let result = state
                .command_buffer(
                    command_buffer,
                    &["VUID-vkEndCommandBuffer-commandBuffer-parameter"],
                )
                .and_then(|command_buffer| command_buffer.lock().validate_end());

            result.err().into_iter().collect()
        };

        self.check(errors, EndCommandBuffer { command_buffer })
    }

    pub fn record_end_command_buffer(&self, checked: Checked<EndCommandBuffer>) {
        self.record_into(checked.value.command_buffer, |_, command_buffer| {
            command_buffer.end();
        });
    }

    /// Ends recording a command buffer. Returns whether the call must be skipped.
    pub fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> bool {
        run(self.validate_end_command_buffer(command_buffer), |checked| {
            self.record_end_command_buffer(checked)
        })
    }

    pub fn validate_reset_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<Checked<ResetCommandBuffer>, SkipCall> {
        let errors = {
            let state = self.state.read();
            let result = (|| {
                const VUIDS: &[&str] = &["VUID-vkResetCommandBuffer-commandBuffer-parameter"];
                let command_buffer = state.command_buffer(command_buffer, VUIDS)?.lock();
                let pool = state.command_pool(command_buffer.pool(), VUIDS)?;

                command_buffer.validate_reset(pool)
            })();

            result.err().into_iter().collect()
        };

        self.check(errors, ResetCommandBuffer { command_buffer })
    }

    pub fn record_reset_command_buffer(&self, checked: Checked<ResetCommandBuffer>) {
        self.record_into(checked.value.command_buffer, |_, command_buffer| {
            command_buffer.reset();
        });
    }

    /// Resets a command buffer to the initial state. Returns whether the call must be skipped.
    pub fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> bool {
        run(self.validate_reset_command_buffer(command_buffer), |checked| {
            self.record_reset_command_buffer(checked)
        })
    }

    pub fn validate_cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency_info: &DependencyInfo<'_>,
    ) -> Result<Checked<PipelineBarrier>, SkipCall> {
        let mut record = PipelineBarrier {
            command_buffer,
            image_barriers: Vec::new(),
            transfers: Vec::new(),
        };
        let errors = self.pipeline_barrier_errors(&self.state.read(), dependency_info, &mut record);

        self.check(errors, record)
    }

    fn pipeline_barrier_errors(
        &self,
        state: &DeviceState,
        dependency_info: &DependencyInfo<'_>,
        record: &mut PipelineBarrier,
    ) -> Vec<Box<ValidationError>> {
        let mut errors = Vec::new();

        let command_buffer = match state.command_buffer(
            record.command_buffer,
            &["VUID-vkCmdPipelineBarrier2-commandBuffer-parameter"],
        ) {
            Ok(command_buffer) => command_buffer.lock(),
            Err(err) => {
                errors.push(err);
                return errors;
            }
        };

        if let Err(err) = command_buffer
            .validate_recording(&["VUID-vkCmdPipelineBarrier2-commandBuffer-recording"])
        {
            errors.push(err);
        }

        let queue_family_index = command_buffer.queue_family_index();
        let image_barrier_count = dependency_info.image_memory_barriers.len();

        // Later barriers of the same call see the transitions of earlier ones.
        let mut layouts = Cow::Borrowed(&command_buffer.layouts);

        for (barrier_index, barrier) in dependency_info.image_memory_barriers.iter().enumerate() {
            let context = || format!("dependency_info.image_memory_barriers[{}]", barrier_index);
            let &ImageMemoryBarrier {
                old_layout,
                new_layout,
                src_queue_family_index,
                dst_queue_family_index,
                image,
                ref subresource_range,
                ..
            } = barrier;

            let image = match state.image(image, &["VUID-VkImageMemoryBarrier2-image-parameter"]) {
                Ok(image) => image,
                Err(err) => {
                    errors.push(err.add_context(context()));
                    continue;
                }
            };

            let subresource_range = match image.resolve_subresource_range(subresource_range) {
                Ok(subresource_range) => subresource_range,
                Err(err) => {
                    errors.push(err.add_context(format!("{}.subresource_range", context())));
                    continue;
                }
            };

            let direction = if self.settings.queue_family_ownership {
                qfo::classify_transfer(
                    src_queue_family_index,
                    dst_queue_family_index,
                    image.sharing(),
                    queue_family_index,
                )
                .unwrap_or_else(|err| {
                    errors.push(err.add_context(context()));
                    None
                })
            } else {
                None
            };
            let release = direction == Some(QfoDirection::Release);

            if self.settings.image_layouts {
                if old_layout != new_layout
                    && matches!(
                        new_layout,
                        vk::ImageLayout::UNDEFINED | vk::ImageLayout::PREINITIALIZED
                    )
                {
                    errors.push(
                        Box::new(ValidationError {
                            context: "new_layout".into(),
                            problem: format!("is {:?}, which can't be transitioned to", new_layout)
                                .into(),
                            vuids: &["VUID-VkImageMemoryBarrier2-newLayout-01198"],
                            objects: [image.handle().into()].into_iter().collect(),
                            kind: ErrorKind::StateMismatch,
                        })
                        .add_context(context()),
                    );
                }

                let used_layouts = [
                    Some(old_layout),
                    (new_layout != old_layout).then_some(new_layout),
                ];

                for layout in used_layouts.into_iter().flatten() {
                    if let Err(err) =
                        layout::validate_layout_usage(image, layout, LayoutUse::Barrier)
                    {
                        errors.push(err.add_context(context()));
                    }
                }

                errors.extend(
                    layout::validate_layout(
                        image,
                        &layouts,
                        &subresource_range,
                        old_layout,
                        &["VUID-VkImageMemoryBarrier2-oldLayout-01197"],
                    )
                    .into_iter()
                    .map(|err| err.add_context(context())),
                );

                if barrier_index + 1 < image_barrier_count {
                    apply_image_barrier(
                        layouts.to_mut(),
                        image,
                        &subresource_range,
                        old_layout,
                        new_layout,
                        release,
                    );
                }
            }

            if let Some(direction) = direction {
                record.transfers.push((
                    direction,
                    QfoTransferBarrier {
                        key: QfoTransferKey {
                            resource: QfoResource::Image {
                                image: image.handle(),
                                subresource_range: subresource_range.clone(),
                            },
                            src_queue_family_index,
                            dst_queue_family_index,
                        },
                        old_layout,
                        new_layout,
                    },
                ));
            }

            record.image_barriers.push(ResolvedImageBarrier {
                image: image.handle(),
                subresource_range,
                old_layout,
                new_layout,
                release,
            });
        }

        for (barrier_index, barrier) in dependency_info.buffer_memory_barriers.iter().enumerate() {
            let context = || format!("dependency_info.buffer_memory_barriers[{}]", barrier_index);
            let &BufferMemoryBarrier {
                src_queue_family_index,
                dst_queue_family_index,
                buffer,
                ref range,
                ..
            } = barrier;

            let buffer_state =
                match state.buffer(buffer, &["VUID-VkBufferMemoryBarrier2-buffer-parameter"]) {
                    Ok(buffer_state) => buffer_state,
                    Err(err) => {
                        errors.push(err.add_context(context()));
                        continue;
                    }
                };

            if range.is_empty() || range.end > buffer_state.size {
                errors.push(
                    Box::new(ValidationError {
                        context: "range".into(),
                        problem: format!(
                            "{:?} is empty, or exceeds the size of the buffer ({})",
                            range, buffer_state.size,
                        )
                        .into(),
                        vuids: &[
                            "VUID-VkBufferMemoryBarrier2-offset-01187",
                            "VUID-VkBufferMemoryBarrier2-size-01189",
                        ],
                        objects: [buffer.into()].into_iter().collect(),
                        kind: ErrorKind::Protocol,
                    })
                    .add_context(context()),
                );
                continue;
            }

            if !self.settings.queue_family_ownership {
                continue;
            }

            match qfo::classify_transfer(
                src_queue_family_index,
                dst_queue_family_index,
                &buffer_state.sharing,
                queue_family_index,
            ) {
                Ok(Some(direction)) => record.transfers.push((
                    direction,
                    QfoTransferBarrier {
                        key: QfoTransferKey {
                            resource: QfoResource::Buffer {
                                buffer,
                                range: range.clone(),
                            },
                            src_queue_family_index,
                            dst_queue_family_index,
                        },
                        old_layout: vk::ImageLayout::UNDEFINED,
                        new_layout: vk::ImageLayout::UNDEFINED,
                    },
                )),
                Ok(None) => (),
                Err(err) => errors.push(err.add_context(context())),
            }
        }

        errors.extend(
            command_buffer.qfo_barriers.validate_new(
                record
                    .transfers
                    .iter()
                    .map(|(direction, barrier)| (*direction, barrier)),
            ),
        );

        errors
    }

    pub fn record_cmd_pipeline_barrier(&self, checked: Checked<PipelineBarrier>) {
        let PipelineBarrier {
            command_buffer,
            image_barriers,
            transfers,
        } = checked.value;

        self.record_into(command_buffer, |state, command_buffer| {
            if self.settings.image_layouts {
                for barrier in &image_barriers {
                    let Some(image) = state.images.get(&barrier.image) else {
                        continue;
                    };

                    apply_image_barrier(
                        &mut command_buffer.layouts,
                        image,
                        &barrier.subresource_range,
                        barrier.old_layout,
                        barrier.new_layout,
                        barrier.release,
                    );
                }
            }

            for (direction, barrier) in transfers {
                command_buffer.qfo_barriers.insert(direction, barrier);
            }
        });
    }

    /// Records a pipeline barrier. Returns whether the call must be skipped.
    pub fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency_info: &DependencyInfo<'_>,
    ) -> bool {
        run(
            self.validate_cmd_pipeline_barrier(command_buffer, dependency_info),
            |checked| self.record_cmd_pipeline_barrier(checked),
        )
    }

    pub fn validate_cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        render_pass_begin_info: &RenderPassBeginInfo<'_>,
    ) -> Result<Checked<BeginRenderPass>, SkipCall> {
        let (errors, instance) = self.begin_render_pass_errors(
            &self.state.read(),
            command_buffer,
            render_pass_begin_info,
        );

        self.check(
            errors,
            BeginRenderPass {
                command_buffer,
                instance,
            },
        )
    }

    fn begin_render_pass_errors(
        &self,
        state: &DeviceState,
        command_buffer: vk::CommandBuffer,
        render_pass_begin_info: &RenderPassBeginInfo<'_>,
    ) -> (Vec<Box<ValidationError>>, Option<RenderPassInstance>) {
        let mut errors = Vec::new();

        let command_buffer_state = match state.command_buffer(
            command_buffer,
            &["VUID-vkCmdBeginRenderPass-commandBuffer-parameter"],
        ) {
            Ok(command_buffer_state) => command_buffer_state.lock(),
            Err(err) => return (vec![err], None),
        };

        if let Err(err) = command_buffer_state
            .validate_recording(&["VUID-vkCmdBeginRenderPass-commandBuffer-recording"])
        {
            errors.push(err);
        }

        if !command_buffer_state.is_primary() {
            errors.push(protocol_error(
                command_buffer,
                "is a secondary command buffer",
                &["VUID-vkCmdBeginRenderPass-bufferlevel"],
            ));
        }

        if command_buffer_state.render_pass().is_some() {
            errors.push(protocol_error(
                command_buffer,
                "already has an active render pass instance",
                &["VUID-vkCmdBeginRenderPass-renderpass"],
            ));
        }

        let &RenderPassBeginInfo {
            render_pass,
            attachments,
        } = render_pass_begin_info;

        let render_pass = match state.render_pass(
            render_pass,
            &["VUID-VkRenderPassBeginInfo-renderPass-parameter"],
        ) {
            Ok(render_pass) => render_pass,
            Err(err) => {
                errors.push(err.add_context("render_pass_begin_info"));
                return (errors, None);
            }
        };

        if attachments.len() != render_pass.attachments().len() {
            errors.push(Box::new(ValidationError {
                context: "render_pass_begin_info.attachments".into(),
                problem: format!(
                    "has {} elements, but the render pass has {} attachments",
                    attachments.len(),
                    render_pass.attachments().len(),
                )
                .into(),
                vuids: &["VUID-VkRenderPassBeginInfo-framebuffer-03207"],
                objects: [render_pass.handle().into()].into_iter().collect(),
                kind: ErrorKind::Protocol,
            }));
            return (errors, None);
        }

        let mut resolved = Vec::with_capacity(attachments.len());

        for (attachment_index, (attachment, description)) in
            attachments.iter().zip(render_pass.attachments()).enumerate()
        {
            let context = || format!("render_pass_begin_info.attachments[{}]", attachment_index);

            let image = match state.image(
                attachment.image,
                &["VUID-VkRenderPassAttachmentBeginInfo-pAttachments-parameter"],
            ) {
                Ok(image) => image,
                Err(err) => {
                    errors.push(err.add_context(context()));
                    continue;
                }
            };

            let subresource_range =
                match image.resolve_subresource_range(&attachment.subresource_range) {
                    Ok(subresource_range) => subresource_range,
                    Err(err) => {
                        errors.push(err.add_context(format!("{}.subresource_range", context())));
                        continue;
                    }
                };

            if self.settings.image_layouts {
                let stencil_initial_layout = description
                    .stencil_layouts()
                    .map(|(stencil_initial_layout, _)| stencil_initial_layout);

                for (part, layout) in split_stencil_layout(
                    &subresource_range,
                    description.initial_layout,
                    stencil_initial_layout,
                ) {
                    if let Err(err) =
                        layout::validate_layout_usage(image, layout, LayoutUse::RenderPassBegin)
                    {
                        errors.push(err.add_context(context()));
                    }

                    errors.extend(
                        layout::validate_layout(
                            image,
                            &command_buffer_state.layouts,
                            &part,
                            layout,
                            &["VUID-vkCmdBeginRenderPass-initialLayout-00900"],
                        )
                        .into_iter()
                        .map(|err| err.add_context(context())),
                    );
                }
            }

            resolved.push((image.handle(), subresource_range));
        }

        // Only a complete set of attachments can be tracked through the render pass.
        let instance = (resolved.len() == attachments.len()).then(|| RenderPassInstance {
            render_pass: render_pass.clone(),
            subpass: 0,
            attachments: resolved,
        });

        (errors, instance)
    }

    pub fn record_cmd_begin_render_pass(&self, checked: Checked<BeginRenderPass>) {
        let BeginRenderPass {
            command_buffer,
            instance,
        } = checked.value;

        let Some(instance) = instance else {
            return;
        };

        self.record_into(command_buffer, |state, command_buffer| {
            if self.settings.image_layouts {
                for ((image, subresource_range), description) in instance
                    .attachments
                    .iter()
                    .zip(instance.render_pass.attachments())
                {
                    let Some(image) = state.images.get(image) else {
                        continue;
                    };
                    let stencil_initial_layout = description
                        .stencil_layouts()
                        .map(|(stencil_initial_layout, _)| stencil_initial_layout);

                    for (part, layout) in split_stencil_layout(
                        subresource_range,
                        description.initial_layout,
                        stencil_initial_layout,
                    ) {
                        command_buffer
                            .layouts
                            .record_expectation(image, &part, layout);
                    }
                }

                enter_subpass(&mut command_buffer.layouts, &state.images, &instance);
            }

            let handle = instance.render_pass.handle();

            if !command_buffer.render_passes_used.contains(&handle) {
                command_buffer.render_passes_used.push(handle);
            }

            command_buffer.render_pass = Some(instance);
        });
    }

    /// Begins a render pass instance. Returns whether the call must be skipped.
    pub fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        render_pass_begin_info: &RenderPassBeginInfo<'_>,
    ) -> bool {
        run(
            self.validate_cmd_begin_render_pass(command_buffer, render_pass_begin_info),
            |checked| self.record_cmd_begin_render_pass(checked),
        )
    }

    /// Checks a command that must be recorded inside a render pass instance. `is_valid_subpass` is
    /// given the current subpass and the subpass count.
    fn render_pass_command_errors(
        &self,
        command_buffer: vk::CommandBuffer,
        vuids: [&'static [&'static str]; 5],
        subpass_problem: &'static str,
        is_valid_subpass: impl FnOnce(u32, u32) -> bool,
    ) -> Vec<Box<ValidationError>> {
        let [parameter_vuids, recording_vuids, level_vuids, render_pass_vuids, subpass_vuids] =
            vuids;
        let state = self.state.read();

        let command_buffer_state = match state.command_buffer(command_buffer, parameter_vuids) {
            Ok(command_buffer_state) => command_buffer_state.lock(),
            Err(err) => return vec![err],
        };

        let mut errors = Vec::new();

        if let Err(err) = command_buffer_state.validate_recording(recording_vuids) {
            errors.push(err);
        }

        if !command_buffer_state.is_primary() {
            errors.push(protocol_error(
                command_buffer,
                "is a secondary command buffer",
                level_vuids,
            ));
        }

        match command_buffer_state.render_pass() {
            None => errors.push(protocol_error(
                command_buffer,
                "has no active render pass instance",
                render_pass_vuids,
            )),
            Some(instance) => {
                let subpass_count = instance.render_pass.subpasses().len() as u32;

                if !is_valid_subpass(instance.subpass, subpass_count) {
                    errors.push(protocol_error(command_buffer, subpass_problem, subpass_vuids));
                }
            }
        }

        errors
    }

    pub fn validate_cmd_next_subpass(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<Checked<NextSubpass>, SkipCall> {
        let errors = self.render_pass_command_errors(
            command_buffer,
            [
                &["VUID-vkCmdNextSubpass-commandBuffer-parameter"],
                &["VUID-vkCmdNextSubpass-commandBuffer-recording"],
                &["VUID-vkCmdNextSubpass-bufferlevel"],
                &["VUID-vkCmdNextSubpass-renderpass"],
                &["VUID-vkCmdNextSubpass-None-00909"],
            ],
            "is already in the last subpass of the render pass",
            |subpass, subpass_count| subpass + 1 < subpass_count,
        );

        self.check(errors, NextSubpass { command_buffer })
    }

    pub fn record_cmd_next_subpass(&self, checked: Checked<NextSubpass>) {
        self.record_into(checked.value.command_buffer, |state, command_buffer| {
            let Some(instance) = command_buffer.render_pass.as_mut() else {
                return;
            };

            if instance.subpass + 1 >= instance.render_pass.subpasses().len() as u32 {
                return;
            }

            instance.subpass += 1;

            if self.settings.image_layouts {
                enter_subpass(&mut command_buffer.layouts, &state.images, instance);
            }
        });
    }

    /// Advances to the next subpass. Returns whether the call must be skipped.
    pub fn cmd_next_subpass(&self, command_buffer: vk::CommandBuffer) -> bool {
        run(self.validate_cmd_next_subpass(command_buffer), |checked| {
            self.record_cmd_next_subpass(checked)
        })
    }

    pub fn validate_cmd_end_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<Checked<EndRenderPass>, SkipCall> {
        let errors = self.render_pass_command_errors(
            command_buffer,
            [
                &["VUID-vkCmdEndRenderPass-commandBuffer-parameter"],
                &["VUID-vkCmdEndRenderPass-commandBuffer-recording"],
                &["VUID-vkCmdEndRenderPass-bufferlevel"],
                &["VUID-vkCmdEndRenderPass-renderpass"],
                &["VUID-vkCmdEndRenderPass-None-00910"],
            ],
            "is not in the last subpass of the render pass",
            |subpass, subpass_count| subpass + 1 == subpass_count,
        );

        self.check(errors, EndRenderPass { command_buffer })
    }

    pub fn record_cmd_end_render_pass(&self, checked: Checked<EndRenderPass>) {
        self.record_into(checked.value.command_buffer, |state, command_buffer| {
            let Some(instance) = command_buffer.render_pass.take() else {
                return;
            };

            if !self.settings.image_layouts {
                return;
            }

            for ((image, subresource_range), description) in instance
                .attachments
                .iter()
                .zip(instance.render_pass.attachments())
            {
                let Some(image) = state.images.get(image) else {
                    continue;
                };
                let stencil_final_layout = description
                    .stencil_layouts()
                    .map(|(_, stencil_final_layout)| stencil_final_layout);

                for (part, layout) in split_stencil_layout(
                    subresource_range,
                    description.final_layout,
                    stencil_final_layout,
                ) {
                    command_buffer.layouts.record_transition(
                        image,
                        &part,
                        vk::ImageLayout::UNDEFINED,
                        layout,
                    );
                }
            }
        });
    }

    /// Ends the render pass instance. Returns whether the call must be skipped.
    pub fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) -> bool {
        run(self.validate_cmd_end_render_pass(command_buffer), |checked| {
            self.record_cmd_end_render_pass(checked)
        })
    }

    pub fn validate_cmd_execute_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        command_buffers: &[vk::CommandBuffer],
    ) -> Result<Checked<ExecuteCommands>, SkipCall> {
        let mut secondaries = Vec::with_capacity(command_buffers.len());
        let errors = self.execute_commands_errors(
            &self.state.read(),
            command_buffer,
            command_buffers,
            &mut secondaries,
        );

        self.check(
            errors,
            ExecuteCommands {
                command_buffer,
                secondaries,
            },
        )
    }

    fn execute_commands_errors(
        &self,
        state: &DeviceState,
        command_buffer: vk::CommandBuffer,
        command_buffers: &[vk::CommandBuffer],
        secondaries: &mut Vec<SecondarySnapshot>,
    ) -> Vec<Box<ValidationError>> {
        let mut errors = Vec::new();

        // The secondaries are locked and copied one by one, before the primary is locked.
        for (index, &handle) in command_buffers.iter().enumerate() {
            let context = || format!("command_buffers[{}]", index);

            if handle == command_buffer {
                errors.push(
                    protocol_error(
                        handle,
                        "is the command buffer that it is executed in",
                        &["VUID-vkCmdExecuteCommands-pCommandBuffers-00088"],
                    )
                    .add_context(context()),
                );
                continue;
            }

            let secondary = match state.command_buffer(
                handle,
                &["VUID-vkCmdExecuteCommands-pCommandBuffers-parameter"],
            ) {
                Ok(secondary) => secondary.lock(),
                Err(err) => {
                    errors.push(err.add_context(context()));
                    continue;
                }
            };

            if secondary.is_primary() {
                errors.push(
                    protocol_error(
                        handle,
                        "is a primary command buffer",
                        &["VUID-vkCmdExecuteCommands-pCommandBuffers-00088"],
                    )
                    .add_context(context()),
                );
            }

            if let Some(err) = secondary.validate_executable(
                &["VUID-vkCmdExecuteCommands-pCommandBuffers-00089"],
                &["VUID-vkCmdExecuteCommands-pCommandBuffers-00091"],
            ) {
                errors.push(err.add_context(context()));
            }

            secondaries.push(SecondarySnapshot {
                index,
                handle,
                layouts: secondary.layouts.clone(),
                qfo_barriers: secondary.qfo_barriers.clone(),
            });
        }

        let primary = match state.command_buffer(
            command_buffer,
            &["VUID-vkCmdExecuteCommands-commandBuffer-parameter"],
        ) {
            Ok(primary) => primary.lock(),
            Err(err) => {
                errors.push(err);
                return errors;
            }
        };

        if let Err(err) =
            primary.validate_recording(&["VUID-vkCmdExecuteCommands-commandBuffer-recording"])
        {
            errors.push(err);
        }

        if !primary.is_primary() {
            errors.push(protocol_error(
                command_buffer,
                "is a secondary command buffer",
                &["VUID-vkCmdExecuteCommands-bufferlevel"],
            ));
        }

        let mut layouts = Cow::Borrowed(&primary.layouts);
        let mut qfo_barriers = Cow::Borrowed(&primary.qfo_barriers);

        for (i, secondary) in secondaries.iter().enumerate() {
            let context = || format!("command_buffers[{}]", secondary.index);

            if self.settings.image_layouts {
                errors.extend(
                    layout::validate_secondary_overlay(
                        &state.images,
                        &layouts,
                        &secondary.layouts,
                        &["UNASSIGNED-vkCmdExecuteCommands-commandBuffer-00001"],
                    )
                    .into_iter()
                    .map(|err| err.add_context(context())),
                );
            }

            if self.settings.queue_family_ownership {
                errors.extend(
                    qfo_barriers
                        .validate_merge(&secondary.qfo_barriers)
                        .into_iter()
                        .map(|err| err.add_context(context())),
                );
            }

            if i + 1 < secondaries.len() {
                layouts.to_mut().merge(&secondary.layouts);
                qfo_barriers.to_mut().merge(&secondary.qfo_barriers);
            }
        }

        errors
    }

    pub fn record_cmd_execute_commands(&self, checked: Checked<ExecuteCommands>) {
        let ExecuteCommands {
            command_buffer,
            secondaries,
        } = checked.value;

        self.record_into(command_buffer, |_, command_buffer| {
            for secondary in secondaries {
                command_buffer.layouts.merge(&secondary.layouts);
                command_buffer.qfo_barriers.merge(&secondary.qfo_barriers);
                command_buffer.secondaries.push(secondary.handle);
            }
        });
    }

    /// Executes secondary command buffers in a primary one. Returns whether the call must be
    /// skipped.
    pub fn cmd_execute_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        command_buffers: &[vk::CommandBuffer],
    ) -> bool {
        run(
            self.validate_cmd_execute_commands(command_buffer, command_buffers),
            |checked| self.record_cmd_execute_commands(checked),
        )
    }

    pub fn validate_queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[SubmitInfo<'_>],
    ) -> Result<Checked<QueueSubmit>, SkipCall> {
        let (errors, record) = self.queue_submit_errors(&self.state.read(), queue, submits);

        self.check(errors, record)
    }

    fn queue_submit_errors(
        &self,
        state: &DeviceState,
        queue: vk::Queue,
        submits: &[SubmitInfo<'_>],
    ) -> (Vec<Box<ValidationError>>, QueueSubmit) {
        let mut errors = Vec::new();
        let mut layouts = SubmitLayouts::new();
        let mut scoreboard = Scoreboard::new(&state.pending_releases);
        let mut command_buffers = Vec::new();
        let mut seen = HashSet::default();

        let queue_family_index = match state.queues.get(&queue) {
            Some(queue_state) => Some(queue_state.queue_family_index),
            None => {
                errors.push(unknown_object(
                    "queue",
                    queue,
                    &["VUID-vkQueueSubmit-queue-parameter"],
                ));
                None
            }
        };

        for (submit_index, submit) in submits.iter().enumerate() {
            for (index, &handle) in submit.command_buffers.iter().enumerate() {
                let context =
                    || format!("submits[{}].command_buffers[{}]", submit_index, index);

                let command_buffer = match state.command_buffer(
                    handle,
                    &["VUID-VkSubmitInfo-pCommandBuffers-parameter"],
                ) {
                    Ok(command_buffer) => command_buffer.lock(),
                    Err(err) => {
                        errors.push(err.add_context(context()));
                        continue;
                    }
                };

                if let Some(queue_family_index) = queue_family_index {
                    errors.extend(
                        command_buffer
                            .validate_submit(queue_family_index)
                            .into_iter()
                            .map(|err| err.add_context(context())),
                    );
                }

                if !seen.insert(handle)
                    && !command_buffer
                        .usage()
                        .contains(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE)
                {
                    errors.push(
                        protocol_error(
                            handle,
                            "is submitted more than once, and was not begun with \
                            `SIMULTANEOUS_USE`",
                            &["VUID-vkQueueSubmit-pCommandBuffers-00071"],
                        )
                        .add_context(context()),
                    );
                }

                if self.settings.image_layouts {
                    errors.extend(
                        layouts
                            .validate_overlay(&state.images, &command_buffer.layouts)
                            .into_iter()
                            .map(|err| err.add_context(context())),
                    );
                    layouts.fold_overlay(&command_buffer.layouts);
                }

                if self.settings.queue_family_ownership {
                    errors.extend(
                        scoreboard
                            .validate_command_buffer(handle, &command_buffer.qfo_barriers)
                            .into_iter()
                            .map(|err| err.add_context(context())),
                    );
                }

                command_buffers.push(handle);
            }
        }

        let record = QueueSubmit {
            queue,
            command_buffers,
            layouts,
            transfers: scoreboard.finish(),
        };

        (errors, record)
    }

    /// Commits a validated submission: the image layouts and ownership transfers of its command
    /// buffers become the device-wide state, and the command buffers become pending.
    pub fn record_queue_submit(&self, checked: Checked<QueueSubmit>) {
        let QueueSubmit {
            queue,
            command_buffers,
            layouts,
            transfers,
        } = checked.value;

        let mut state = self.state.write();
        let state = &mut *state;

        layouts.commit(&mut state.images);
        state.pending_releases.commit(transfers);

        for handle in &command_buffers {
            let Some(command_buffer) = state.command_buffers.get_mut(handle) else {
                log::trace!("{:?} was freed before its submission was committed", handle);
                continue;
            };
            let command_buffer = command_buffer.get_mut();
            command_buffer.add_submit();
            let secondaries = command_buffer.secondaries.clone();

            for secondary in secondaries {
                if let Some(secondary) = state.command_buffers.get_mut(&secondary) {
                    secondary.get_mut().add_submit();
                }
            }
        }

        log::debug!(
            "committed {} command buffers submitted to {:?}, {} releases pending",
            command_buffers.len(),
            queue,
            state.pending_releases.len(),
        );

        if let Some(queue_state) = state.queues.get_mut(&queue) {
            queue_state.in_flight.extend(command_buffers);
        }
    }

    /// Submits command buffers to a queue. Returns whether the call must be skipped.
    pub fn queue_submit(&self, queue: vk::Queue, submits: &[SubmitInfo<'_>]) -> bool {
        run(self.validate_queue_submit(queue, submits), |checked| {
            self.record_queue_submit(checked)
        })
    }

    /// Retires one in-flight submission of each of `command_buffers`, as when the fence of the
    /// submission was signaled.
    pub fn command_buffers_completed(&self, command_buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.write();

        for &handle in command_buffers {
            let found = state.queues.values_mut().any(|queue_state| {
                let position = queue_state.in_flight.iter().position(|&h| h == handle);

                if let Some(position) = position {
                    queue_state.in_flight.remove(position);
                }

                position.is_some()
            });

            if found {
                state.retire(handle);
            } else {
                log::trace!("{:?} has no submission in flight", handle);
            }
        }
    }

    /// Retires every submission to `queue`.
    pub fn queue_wait_idle(&self, queue: vk::Queue) {
        let mut state = self.state.write();
        let in_flight = state
            .queues
            .get_mut(&queue)
            .map(|queue_state| mem::take(&mut queue_state.in_flight))
            .unwrap_or_default();

        for handle in in_flight {
            state.retire(handle);
        }
    }

    /// Retires every submission on the device.
    pub fn device_wait_idle(&self) {
        let mut state = self.state.write();
        let in_flight: Vec<_> = state
            .queues
            .values_mut()
            .flat_map(|queue_state| mem::take(&mut queue_state.in_flight))
            .collect();

        for handle in in_flight {
            state.retire(handle);
        }
    }

    /// Returns the layout that a subresource is in after the commands recorded so far into
    /// `command_buffer`, assuming the command buffer is the next one to execute.
    pub fn expected_layout(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        subresource: ImageSubresource,
    ) -> Option<vk::ImageLayout> {
        let state = self.state.read();
        let image = state.images.get(&image)?;
        let index = image.subresource_index(subresource)?;
        let command_buffer = state.command_buffers.get(&command_buffer)?.lock();

        command_buffer.layouts.expected_layout(image, index)
    }

    /// Returns the layout that a subresource is in as of the last committed submission.
    pub fn image_layout(
        &self,
        image: vk::Image,
        subresource: ImageSubresource,
    ) -> Option<vk::ImageLayout> {
        let state = self.state.read();

        state.images.get(&image)?.layout(subresource)
    }

    /// Returns the submitted release of a transfer, if it has not been acquired yet.
    pub fn pending_release(&self, key: &QfoTransferKey) -> Option<PendingRelease> {
        self.state.read().pending_releases.get(key).cloned()
    }

    /// Returns every submitted release that has not been acquired yet.
    pub fn pending_releases(&self) -> Vec<PendingRelease> {
        self.state.read().pending_releases.iter().cloned().collect()
    }

    pub fn pending_release_count(&self) -> usize {
        self.state.read().pending_releases.len()
    }

    pub fn command_buffer_lifecycle(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Option<CommandBufferLifecycle> {
        let state = self.state.read();
        let lifecycle = state
            .command_buffers
            .get(&command_buffer)?
            .lock()
            .lifecycle();

        Some(lifecycle)
    }
}

fn apply_image_barrier(
    layouts: &mut ImageLayoutOverlay,
    image: &ImageState,
    subresource_range: &ImageSubresourceRange,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    release: bool,
) {
    // The acquire performs the transition.
    if release {
        layouts.record_expectation(image, subresource_range, old_layout);
    } else {
        layouts.record_transition(image, subresource_range, old_layout, new_layout);
    }
}

/// Transitions the attachments of the current subpass of `instance` to the layouts the subpass
/// uses them in.
fn enter_subpass(
    layouts: &mut ImageLayoutOverlay,
    images: &HashMap<vk::Image, ImageState>,
    instance: &RenderPassInstance,
) {
    for (attachment, attachment_use) in instance.render_pass.subpass_layouts(instance.subpass) {
        let Some((image, subresource_range)) = instance.attachments.get(attachment as usize)
        else {
            continue;
        };
        let Some(image) = images.get(image) else {
            continue;
        };

        let parts: SmallVec<[_; 2]> = split_stencil_layout(
            subresource_range,
            attachment_use.layout,
            attachment_use.stencil_layout,
        );

        for (part, layout) in parts {
            layouts.record_transition(image, &part, vk::ImageLayout::UNDEFINED, layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command_buffer::RenderPassAttachment,
        render_pass::{
            AttachmentDescription, AttachmentReference, SubpassDependency, SubpassDescription,
        },
        CollectingSink,
    };
    use ash::vk::Handle;
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc,
        },
        thread,
        time::Duration,
    };

    const GRAPHICS: u32 = 0;
    const TRANSFER: u32 = 1;

    fn validator_with(settings: ValidationSettings) -> (DeviceValidator, Arc<CollectingSink>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let sink = Arc::new(CollectingSink::new());

        (DeviceValidator::new(settings, sink.clone()), sink)
    }

    fn validator() -> (DeviceValidator, Arc<CollectingSink>) {
        validator_with(ValidationSettings::default())
    }

    fn color_image(
        validator: &DeviceValidator,
        raw: u64,
        initial_layout: vk::ImageLayout,
    ) -> vk::Image {
        let image = vk::Image::from_raw(raw);
        validator.create_image(
            image,
            &ImageCreateInfo {
                format: vk::Format::R8G8B8A8_UNORM,
                usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_DST,
                initial_layout,
                ..Default::default()
            },
        );

        image
    }

    fn whole_color() -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        }
    }

    const COLOR_0: ImageSubresource = ImageSubresource {
        aspect: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        array_layer: 0,
    };

    /// Creates a pool with a single command buffer of `level` in the recording state.
    fn recording(
        validator: &DeviceValidator,
        raw: u64,
        queue_family_index: u32,
        level: vk::CommandBufferLevel,
    ) -> vk::CommandBuffer {
        let pool = vk::CommandPool::from_raw(raw);
        let command_buffer = vk::CommandBuffer::from_raw(raw + 1);
        validator.create_command_pool(
            pool,
            queue_family_index,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        );
        assert!(!validator.allocate_command_buffers(pool, level, &[command_buffer]));
        assert!(!validator
            .begin_command_buffer(command_buffer, vk::CommandBufferUsageFlags::empty()));

        command_buffer
    }

    fn primary(
        validator: &DeviceValidator,
        raw: u64,
        queue_family_index: u32,
    ) -> vk::CommandBuffer {
        recording(validator, raw, queue_family_index, vk::CommandBufferLevel::PRIMARY)
    }

    fn transition(
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> ImageMemoryBarrier {
        ImageMemoryBarrier {
            old_layout,
            new_layout,
            image,
            subresource_range: whole_color(),
            ..Default::default()
        }
    }

    fn image_barriers(
        validator: &DeviceValidator,
        command_buffer: vk::CommandBuffer,
        barriers: &[ImageMemoryBarrier],
    ) -> bool {
        validator.cmd_pipeline_barrier(
            command_buffer,
            &DependencyInfo {
                image_memory_barriers: barriers,
                ..Default::default()
            },
        )
    }

    fn buffer_barriers(
        validator: &DeviceValidator,
        command_buffer: vk::CommandBuffer,
        barriers: &[BufferMemoryBarrier],
    ) -> bool {
        validator.cmd_pipeline_barrier(
            command_buffer,
            &DependencyInfo {
                buffer_memory_barriers: barriers,
                ..Default::default()
            },
        )
    }

    fn submit(
        validator: &DeviceValidator,
        queue: vk::Queue,
        command_buffers: &[vk::CommandBuffer],
    ) -> bool {
        validator.queue_submit(queue, &[SubmitInfo { command_buffers }])
    }

    #[test]
    fn layout_example() {
        let (validator, sink) = validator();
        let queue = vk::Queue::from_raw(100);
        validator.register_queue(queue, GRAPHICS);
        let image = color_image(&validator, 1, vk::ImageLayout::UNDEFINED);
        let cb = primary(&validator, 10, GRAPHICS);

        assert!(!image_barriers(
            &validator,
            cb,
            &[transition(
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            )],
        ));
        assert!(!image_barriers(
            &validator,
            cb,
            &[transition(
                image,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )],
        ));
        assert!(sink.is_empty());

        assert!(image_barriers(
            &validator,
            cb,
            &[transition(
                image,
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            )],
        ));

        let messages = sink.take();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].vuid, "VUID-VkImageMemoryBarrier2-oldLayout-01197");
        assert_eq!(messages[0].kind, ErrorKind::StateMismatch);
        assert!(messages[0].text.contains("SHADER_READ_ONLY_OPTIMAL"), "{}", messages[0].text);
        assert!(messages[0].objects.contains(&ObjectHandle::Image(image)));

        // The skipped barrier left no trace.
        assert_eq!(
            validator.expected_layout(cb, image, COLOR_0),
            Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
        );
        assert_eq!(
            validator.image_layout(image, COLOR_0),
            Some(vk::ImageLayout::UNDEFINED),
        );

        assert!(!validator.end_command_buffer(cb));
        assert!(!submit(&validator, queue, &[cb]));
        assert_eq!(
            validator.image_layout(image, COLOR_0),
            Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
        );
        assert_eq!(
            validator.command_buffer_lifecycle(cb),
            Some(CommandBufferLifecycle::Pending),
        );
    }

    #[test]
    fn barriers_in_one_call_apply_in_order() {
        let (validator, sink) = validator();
        let image = color_image(&validator, 1, vk::ImageLayout::UNDEFINED);
        let cb = primary(&validator, 10, GRAPHICS);

        assert!(!image_barriers(
            &validator,
            cb,
            &[
                transition(
                    image,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                ),
                transition(
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                ),
            ],
        ));
        assert!(sink.is_empty(), "{:?}", sink.messages());
        assert_eq!(
            validator.expected_layout(cb, image, COLOR_0),
            Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
        );
    }

    #[test]
    fn barrier_usage_and_new_layout() {
        let (validator, sink) = validator();
        let image = vk::Image::from_raw(1);
        validator.create_image(
            image,
            &ImageCreateInfo {
                format: vk::Format::R8G8B8A8_UNORM,
                usage: vk::ImageUsageFlags::SAMPLED,
                ..Default::default()
            },
        );
        let cb = primary(&validator, 10, GRAPHICS);

        assert!(image_barriers(
            &validator,
            cb,
            &[transition(
                image,
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::PREINITIALIZED,
            )],
        ));
        assert!(image_barriers(
            &validator,
            cb,
            &[transition(
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            )],
        ));

        assert_eq!(
            sink.vuids(),
            [
                "VUID-VkImageMemoryBarrier2-newLayout-01198",
                "VUID-VkImageMemoryBarrier2-oldLayout-01212",
            ],
        );
    }

    #[test]
    fn first_use_checked_at_submit() {
        let (validator, sink) = validator();
        let queue = vk::Queue::from_raw(100);
        validator.register_queue(queue, GRAPHICS);
        let image = color_image(&validator, 1, vk::ImageLayout::UNDEFINED);

        // While the image is undefined, any first use is accepted during recording.
        let uses_general = primary(&validator, 10, GRAPHICS);
        assert!(!image_barriers(
            &validator,
            uses_general,
            &[transition(
                image,
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )],
        ));
        assert!(!validator.end_command_buffer(uses_general));

        let to_transfer = primary(&validator, 20, GRAPHICS);
        assert!(!image_barriers(
            &validator,
            to_transfer,
            &[transition(
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )],
        ));
        assert!(!validator.end_command_buffer(to_transfer));
        assert!(sink.is_empty(), "{:?}", sink.messages());

        assert!(submit(&validator, queue, &[to_transfer, uses_general]));
        let messages = sink.take();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].vuid,
            "UNASSIGNED-CoreValidation-DrawState-InvalidImageLayout",
        );
        assert!(messages[0].text.contains("submits[0].command_buffers[1]"));

        // Nothing of the failed submission was committed.
        assert_eq!(
            validator.image_layout(image, COLOR_0),
            Some(vk::ImageLayout::UNDEFINED),
        );
        for command_buffer in [to_transfer, uses_general] {
            assert_eq!(
                validator.command_buffer_lifecycle(command_buffer),
                Some(CommandBufferLifecycle::Executable),
            );
        }

        let to_general = primary(&validator, 30, GRAPHICS);
        assert!(!image_barriers(
            &validator,
            to_general,
            &[transition(
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::GENERAL,
            )],
        ));
        assert!(!validator.end_command_buffer(to_general));

        assert!(!submit(&validator, queue, &[to_transfer, to_general, uses_general]));
        assert!(sink.is_empty(), "{:?}", sink.messages());
        assert_eq!(
            validator.image_layout(image, COLOR_0),
            Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
        );
    }

    fn release_acquire_pair(buffer: vk::Buffer) -> BufferMemoryBarrier {
        BufferMemoryBarrier {
            src_queue_family_index: TRANSFER,
            dst_queue_family_index: GRAPHICS,
            buffer,
            range: 0..1024,
            ..Default::default()
        }
    }

    #[test]
    fn ownership_transfer_across_submissions() {
        let (validator, sink) = validator();
        let transfer_queue = vk::Queue::from_raw(100);
        let graphics_queue = vk::Queue::from_raw(101);
        validator.register_queue(transfer_queue, TRANSFER);
        validator.register_queue(graphics_queue, GRAPHICS);
        let buffer = vk::Buffer::from_raw(1);
        validator.create_buffer(buffer, 1024, Sharing::Exclusive);

        let release = primary(&validator, 10, TRANSFER);
        assert!(!buffer_barriers(&validator, release, &[release_acquire_pair(buffer)]));
        assert!(!validator.end_command_buffer(release));

        let acquire = primary(&validator, 20, GRAPHICS);
        assert!(!buffer_barriers(&validator, acquire, &[release_acquire_pair(buffer)]));
        assert!(!validator.end_command_buffer(acquire));

        // Acquiring before the release is submitted.
        assert!(submit(&validator, graphics_queue, &[acquire]));
        assert_eq!(sink.vuids(), ["UNASSIGNED-VkBufferMemoryBarrier-buffer-00004"]);
        sink.take();

        assert!(!submit(&validator, transfer_queue, &[release]));
        assert_eq!(validator.pending_release_count(), 1);

        let key = QfoTransferKey {
            resource: QfoResource::Buffer {
                buffer,
                range: 0..1024,
            },
            src_queue_family_index: TRANSFER,
            dst_queue_family_index: GRAPHICS,
        };
        assert_eq!(
            validator.pending_release(&key).map(|pending| pending.command_buffer),
            Some(release),
        );

        // Releasing the same transfer again while it's pending.
        validator.command_buffers_completed(&[release]);
        assert!(submit(&validator, transfer_queue, &[release]));
        assert_eq!(sink.vuids(), ["UNASSIGNED-VkBufferMemoryBarrier-buffer-00003"]);
        sink.take();

        assert!(!submit(&validator, graphics_queue, &[acquire]));
        assert!(sink.is_empty(), "{:?}", sink.messages());
        assert_eq!(validator.pending_release_count(), 0);
    }

    #[test]
    fn double_acquire_in_one_submission() {
        let (validator, sink) = validator();
        let transfer_queue = vk::Queue::from_raw(100);
        let graphics_queue = vk::Queue::from_raw(101);
        validator.register_queue(transfer_queue, TRANSFER);
        validator.register_queue(graphics_queue, GRAPHICS);
        let buffer = vk::Buffer::from_raw(1);
        validator.create_buffer(buffer, 1024, Sharing::Exclusive);

        let release = primary(&validator, 10, TRANSFER);
        assert!(!buffer_barriers(&validator, release, &[release_acquire_pair(buffer)]));
        assert!(!validator.end_command_buffer(release));
        assert!(!submit(&validator, transfer_queue, &[release]));

        let acquires: Vec<_> = [20, 30]
            .into_iter()
            .map(|raw| {
                let acquire = primary(&validator, raw, GRAPHICS);
                assert!(!buffer_barriers(&validator, acquire, &[release_acquire_pair(buffer)]));
                assert!(!validator.end_command_buffer(acquire));
                acquire
            })
            .collect();

        assert!(submit(&validator, graphics_queue, &acquires));
        let messages = sink.take();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].vuid, "UNASSIGNED-VkBufferMemoryBarrier-buffer-00002");
        assert_eq!(messages[0].kind, ErrorKind::Uniqueness);
        assert!(messages[0].text.contains("double-acquire"));
        assert!(messages[0].text.contains("command_buffers[1]"));

        // Nothing was committed.
        assert_eq!(validator.pending_release_count(), 1);
    }

    #[test]
    fn duplicate_release_in_one_command_buffer() {
        let (validator, sink) = validator();
        let buffer = vk::Buffer::from_raw(1);
        validator.create_buffer(buffer, 1024, Sharing::Exclusive);
        let release = primary(&validator, 10, TRANSFER);

        assert!(buffer_barriers(
            &validator,
            release,
            &[release_acquire_pair(buffer), release_acquire_pair(buffer)],
        ));
        assert_eq!(sink.vuids(), ["UNASSIGNED-VkBufferMemoryBarrier-buffer-00001"]);
        sink.take();

        assert!(!buffer_barriers(&validator, release, &[release_acquire_pair(buffer)]));
        assert!(buffer_barriers(&validator, release, &[release_acquire_pair(buffer)]));
        assert_eq!(sink.vuids(), ["UNASSIGNED-VkBufferMemoryBarrier-buffer-00001"]);
    }

    #[test]
    fn image_release_records_only_the_expectation() {
        let (validator, sink) = validator();
        let image = color_image(&validator, 1, vk::ImageLayout::UNDEFINED);
        let release = primary(&validator, 10, TRANSFER);

        assert!(!image_barriers(
            &validator,
            release,
            &[ImageMemoryBarrier {
                src_queue_family_index: TRANSFER,
                dst_queue_family_index: GRAPHICS,
                ..transition(
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )
            }],
        ));
        assert!(sink.is_empty(), "{:?}", sink.messages());
        assert_eq!(
            validator.expected_layout(release, image, COLOR_0),
            Some(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
        );

        // The command buffer belongs to neither family.
        let other = primary(&validator, 20, 2);
        assert!(image_barriers(
            &validator,
            other,
            &[ImageMemoryBarrier {
                src_queue_family_index: TRANSFER,
                dst_queue_family_index: GRAPHICS,
                ..transition(
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )
            }],
        ));
        assert_eq!(
            sink.vuids(),
            ["UNASSIGNED-CoreValidation-Barrier-QueueFamilyNotInvolved"],
        );
    }

    fn three_subpasses(preserve_in_middle: bool) -> RenderPassCreateInfo {
        let color = |attachment| {
            Some(AttachmentReference {
                attachment,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                ..Default::default()
            })
        };
        let dependency = |src, dst| SubpassDependency {
            src_subpass: Some(src),
            dst_subpass: Some(dst),
            ..Default::default()
        };

        RenderPassCreateInfo {
            attachments: vec![
                AttachmentDescription {
                    format: vk::Format::R8G8B8A8_UNORM,
                    final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    ..Default::default()
                };
                2
            ],
            subpasses: vec![
                SubpassDescription {
                    color_attachments: vec![color(0)],
                    ..Default::default()
                },
                SubpassDescription {
                    color_attachments: vec![color(1)],
                    preserve_attachments: if preserve_in_middle { vec![0] } else { vec![] },
                    ..Default::default()
                },
                SubpassDescription {
                    color_attachments: vec![color(0)],
                    ..Default::default()
                },
            ],
            dependencies: vec![dependency(0, 1), dependency(1, 2)],
        }
    }

    #[test]
    fn render_pass_needs_preserve() {
        let (validator, sink) = validator();
        let render_pass = vk::RenderPass::from_raw(1);

        assert!(validator.create_render_pass(render_pass, three_subpasses(false)));
        assert_eq!(
            sink.vuids(),
            ["UNASSIGNED-CoreValidation-DrawState-InvalidRenderpass"],
        );
        sink.take();

        // The failed creation was not registered.
        let cb = primary(&validator, 10, GRAPHICS);
        assert!(validator.cmd_begin_render_pass(cb, &RenderPassBeginInfo::new(render_pass, &[])));
        assert_eq!(sink.vuids(), ["VUID-VkRenderPassBeginInfo-renderPass-parameter"]);
        sink.take();

        assert!(!validator.create_render_pass(render_pass, three_subpasses(true)));
        assert!(sink.is_empty(), "{:?}", sink.messages());
    }

    #[test]
    fn render_pass_transitions() {
        let (validator, sink) = validator();
        let queue = vk::Queue::from_raw(100);
        validator.register_queue(queue, GRAPHICS);
        let render_pass = vk::RenderPass::from_raw(1);
        assert!(!validator.create_render_pass(render_pass, three_subpasses(true)));

        let images = [
            color_image(&validator, 2, vk::ImageLayout::UNDEFINED),
            color_image(&validator, 3, vk::ImageLayout::UNDEFINED),
        ];
        let attachments = images.map(|image| RenderPassAttachment {
            image,
            subresource_range: whole_color(),
        });
        let cb = primary(&validator, 10, GRAPHICS);

        // Ending before the last subpass.
        let begin_info = RenderPassBeginInfo::new(render_pass, &attachments);
        assert!(!validator.cmd_begin_render_pass(cb, &begin_info));
        assert!(validator.cmd_end_render_pass(cb));
        assert_eq!(sink.vuids(), ["VUID-vkCmdEndRenderPass-None-00910"]);
        sink.take();

        assert_eq!(
            validator.expected_layout(cb, images[0], COLOR_0),
            Some(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        );
        assert_eq!(
            validator.expected_layout(cb, images[1], COLOR_0),
            Some(vk::ImageLayout::UNDEFINED),
        );

        assert!(!validator.cmd_next_subpass(cb));
        assert!(!validator.cmd_next_subpass(cb));
        assert!(validator.cmd_next_subpass(cb));
        assert!(!validator.cmd_end_render_pass(cb));
        assert_eq!(sink.vuids(), ["VUID-vkCmdNextSubpass-None-00909"]);

        for image in images {
            assert_eq!(
                validator.expected_layout(cb, image, COLOR_0),
                Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            );
        }

        assert!(validator.cmd_end_render_pass(cb));
        assert!(!validator.end_command_buffer(cb));
        assert!(!submit(&validator, queue, &[cb]));
        assert_eq!(
            validator.image_layout(images[1], COLOR_0),
            Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
        );

        // The render pass is gone, so the command buffer can't be submitted again.
        validator.queue_wait_idle(queue);
        validator.destroy_render_pass(render_pass);
        assert_eq!(
            validator.command_buffer_lifecycle(cb),
            Some(CommandBufferLifecycle::Invalid),
        );
    }

    #[test]
    fn secondary_expectations_checked_on_execute() {
        let (validator, sink) = validator();
        let image = color_image(&validator, 1, vk::ImageLayout::UNDEFINED);

        let secondary = recording(&validator, 20, GRAPHICS, vk::CommandBufferLevel::SECONDARY);
        assert!(!image_barriers(
            &validator,
            secondary,
            &[transition(
                image,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )],
        ));

        let cb = primary(&validator, 10, GRAPHICS);

        // Still recording.
        assert!(validator.cmd_execute_commands(cb, &[secondary]));
        assert_eq!(sink.vuids(), ["VUID-vkCmdExecuteCommands-pCommandBuffers-00089"]);
        sink.take();
        assert!(!validator.end_command_buffer(secondary));

        assert!(!image_barriers(
            &validator,
            cb,
            &[transition(
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )],
        ));
        assert!(validator.cmd_execute_commands(cb, &[secondary]));
        assert_eq!(
            sink.vuids(),
            ["UNASSIGNED-vkCmdExecuteCommands-commandBuffer-00001"],
        );
        sink.take();

        assert!(!image_barriers(
            &validator,
            cb,
            &[transition(
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            )],
        ));
        assert!(!validator.cmd_execute_commands(cb, &[secondary]));
        assert_eq!(
            validator.expected_layout(cb, image, COLOR_0),
            Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
        );

        // Executing a command buffer inside itself is refused.
        assert!(validator.cmd_execute_commands(cb, &[cb]));
        assert_eq!(sink.vuids(), ["VUID-vkCmdExecuteCommands-pCommandBuffers-00088"]);
    }

    #[test]
    fn lifecycle_through_submission() {
        let (validator, sink) = validator();
        let queue = vk::Queue::from_raw(100);
        validator.register_queue(queue, GRAPHICS);
        let image = color_image(&validator, 1, vk::ImageLayout::UNDEFINED);
        let pool = vk::CommandPool::from_raw(10);
        let cb = vk::CommandBuffer::from_raw(11);
        validator.create_command_pool(pool, GRAPHICS, vk::CommandPoolCreateFlags::empty());
        assert!(!validator.allocate_command_buffers(
            pool,
            vk::CommandBufferLevel::PRIMARY,
            &[cb],
        ));

        assert!(!validator.begin_command_buffer(cb, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT));
        assert!(!image_barriers(
            &validator,
            cb,
            &[transition(
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::GENERAL,
            )],
        ));
        assert!(!validator.end_command_buffer(cb));
        assert!(!submit(&validator, queue, &[cb]));

        assert!(validator.free_command_buffers(pool, &[cb]));
        assert!(validator.reset_command_pool(pool));
        assert_eq!(
            sink.vuids(),
            [
                "VUID-vkFreeCommandBuffers-pCommandBuffers-00047",
                "VUID-vkResetCommandPool-commandPool-00040",
            ],
        );
        sink.take();

        validator.command_buffers_completed(&[cb]);
        assert_eq!(
            validator.command_buffer_lifecycle(cb),
            Some(CommandBufferLifecycle::Invalid),
        );
        assert!(submit(&validator, queue, &[cb]));
        assert_eq!(sink.vuids(), ["VUID-vkQueueSubmit-pCommandBuffers-00070"]);
        sink.take();

        assert!(!validator.reset_command_pool(pool));
        assert_eq!(
            validator.command_buffer_lifecycle(cb),
            Some(CommandBufferLifecycle::Initial),
        );
        assert!(!validator.destroy_command_pool(pool));
        assert_eq!(validator.command_buffer_lifecycle(cb), None);
        assert!(sink.is_empty());
    }

    #[test]
    fn pending_command_buffers_keep_their_pool() {
        let (validator, sink) = validator();
        let queue = vk::Queue::from_raw(100);
        validator.register_queue(queue, GRAPHICS);
        let pool = vk::CommandPool::from_raw(10);
        let cb = vk::CommandBuffer::from_raw(11);
        validator.create_command_pool(pool, GRAPHICS, vk::CommandPoolCreateFlags::empty());
        assert!(!validator.allocate_command_buffers(
            pool,
            vk::CommandBufferLevel::PRIMARY,
            &[cb],
        ));
        assert!(!validator.begin_command_buffer(cb, vk::CommandBufferUsageFlags::empty()));
        assert!(!validator.end_command_buffer(cb));
        assert!(!submit(&validator, queue, &[cb]));

        assert!(validator.destroy_command_pool(pool));
        assert!(validator.free_command_buffers(pool, &[cb]));
        assert_eq!(
            sink.vuids(),
            [
                "VUID-vkDestroyCommandPool-commandPool-00041",
                "VUID-vkFreeCommandBuffers-pCommandBuffers-00047",
            ],
        );
        assert_eq!(
            validator.command_buffer_lifecycle(cb),
            Some(CommandBufferLifecycle::Pending),
        );
        sink.take();

        validator.queue_wait_idle(queue);
        assert!(!validator.free_command_buffers(pool, &[cb]));
        assert_eq!(validator.command_buffer_lifecycle(cb), None);
        assert!(!validator.destroy_command_pool(pool));
        assert!(validator.destroy_command_pool(pool));
        assert_eq!(sink.vuids(), ["VUID-vkDestroyCommandPool-commandPool-parameter"]);
    }

    #[test]
    fn destroying_an_image_invalidates_users() {
        let (validator, sink) = validator();
        let image = color_image(&validator, 1, vk::ImageLayout::UNDEFINED);
        let cb = primary(&validator, 10, GRAPHICS);
        assert!(!image_barriers(
            &validator,
            cb,
            &[transition(
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::GENERAL,
            )],
        ));

        validator.destroy_image(image);
        assert_eq!(
            validator.command_buffer_lifecycle(cb),
            Some(CommandBufferLifecycle::Invalid),
        );

        assert!(image_barriers(
            &validator,
            cb,
            &[transition(
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::GENERAL,
            )],
        ));
        assert_eq!(
            sink.vuids(),
            [
                "VUID-vkCmdPipelineBarrier2-commandBuffer-recording",
                "VUID-VkImageMemoryBarrier2-image-parameter",
            ],
        );
    }

    #[test]
    fn muted_messages_do_not_skip() {
        let (validator, sink) = validator_with(ValidationSettings {
            message_id_filter: vec!["VUID-VkImageMemoryBarrier2-oldLayout-01197".to_owned()],
            ..Default::default()
        });
        let image = color_image(&validator, 1, vk::ImageLayout::PREINITIALIZED);
        let cb = primary(&validator, 10, GRAPHICS);

        assert!(!image_barriers(
            &validator,
            cb,
            &[transition(
                image,
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )],
        ));
        assert!(sink.is_empty());

        // With layout tracking disabled, nothing is recorded.
        let (validator, _) = validator_with(ValidationSettings {
            image_layouts: false,
            ..Default::default()
        });
        let image = color_image(&validator, 1, vk::ImageLayout::PREINITIALIZED);
        let cb = primary(&validator, 10, GRAPHICS);
        assert!(!image_barriers(
            &validator,
            cb,
            &[transition(
                image,
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )],
        ));
        assert_eq!(
            validator.expected_layout(cb, image, COLOR_0),
            Some(vk::ImageLayout::PREINITIALIZED),
        );
    }

    #[test]
    fn validation_and_commit_exclude_each_other() {
        let (validator, _) = validator();
        let validator = &validator;
        let image = color_image(validator, 1, vk::ImageLayout::UNDEFINED);
        let a = primary(validator, 10, GRAPHICS);
        let b = primary(validator, 20, GRAPHICS);
        let barrier = &[transition(
            image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
        )];
        let writer_done = &AtomicBool::new(false);
        let reader_done = &AtomicBool::new(false);

        thread::scope(|scope| {
            let state = validator.state.read();
            let guard = state.command_buffers[&a].lock();

            // Recording into another command buffer doesn't block.
            let (sender, receiver) = mpsc::channel();
            scope.spawn(move || {
                let skip = image_barriers(validator, b, barrier);
                let _ = sender.send(skip);
            });
            assert_eq!(receiver.recv_timeout(Duration::from_secs(10)), Ok(false));

            // A commit waits for validation to finish.
            let writer = scope.spawn(move || {
                validator.create_image(vk::Image::from_raw(2), &ImageCreateInfo::default());
                writer_done.store(true, Ordering::SeqCst);
            });
            thread::sleep(Duration::from_millis(50));
            assert!(!writer_done.load(Ordering::SeqCst));

            drop(guard);
            drop(state);
            writer.join().unwrap();
            assert!(writer_done.load(Ordering::SeqCst));

            // And validation waits for a commit to finish.
            let state = validator.state.write();
            let reader = scope.spawn(move || {
                image_barriers(validator, a, barrier);
                reader_done.store(true, Ordering::SeqCst);
            });
            thread::sleep(Duration::from_millis(50));
            assert!(!reader_done.load(Ordering::SeqCst));

            drop(state);
            reader.join().unwrap();
            assert!(reader_done.load(Ordering::SeqCst));
        });
    }
}
