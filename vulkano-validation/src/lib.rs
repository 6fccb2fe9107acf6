//! Resource-state validation for Vulkan command recording and submission.
//!
//! This crate is the part of a validation layer that keeps a shadow model of GPU resource state
//! and checks every intercepted call against it. It does not talk to a driver itself: whoever
//! intercepts the API calls forwards them here first, and only calls the driver if the engine
//! didn't ask for the call to be skipped.
//!
//! # Overview
//!
//! - A [`DeviceValidator`] is created per logical device. It owns all state, so several devices
//!   can be validated in the same process.
//! - Images, buffers, command pools, command buffers, render passes and queues are registered
//!   with it as they are created by the application.
//! - Every command entry point comes in two phases. `validate_*` takes a shared lock and never
//!   mutates shared state; it returns a [`Checked`] token on success. `record_*` consumes that
//!   token and applies the mutations. The convenience methods without a prefix do both and
//!   return whether the driver call must be skipped.
//! - Problems are reported as [`ValidationError`]s to a [`MessageSink`]. No problem is fatal to
//!   the process.
//!
//! # Tracked state
//!
//! - Image layouts, per subresource, with [`RangeMap`](range_map::RangeMap)s. Each command buffer
//!   holds an overlay of the transitions it recorded; overlays are folded into the authoritative
//!   per-image map when the command buffer is submitted.
//! - Render pass subpass dependency graphs, built when the render pass is created.
//! - Queue family ownership transfers, matched release-to-acquire across submissions.

pub use self::{
    device::{Checked, DeviceValidator, SkipCall},
    report::{CollectingSink, LogSink, Message, MessageSink},
    settings::ValidationSettings,
};
pub use ash::vk;
use ash::vk::Handle;
use smallvec::SmallVec;
use std::{
    borrow::Cow,
    error::Error,
    fmt::{Debug, Display, Error as FmtError, Formatter},
};

pub mod command_buffer;
pub mod device;
pub mod image;
pub mod layout;
pub mod qfo;
pub mod range_map;
pub mod render_pass;
pub mod report;
pub mod settings;
pub mod sync;

/// Represents memory size and offset values, and flattened subresource indices.
pub type DeviceSize = u64;

/// A Vulkan object that a diagnostic refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectHandle {
    Image(vk::Image),
    Buffer(vk::Buffer),
    CommandPool(vk::CommandPool),
    CommandBuffer(vk::CommandBuffer),
    RenderPass(vk::RenderPass),
    Queue(vk::Queue),
}

impl ObjectHandle {
    /// Returns the Vulkan object type of the handle.
    #[inline]
    pub fn object_type(self) -> vk::ObjectType {
        match self {
            Self::Image(_) => vk::ObjectType::IMAGE,
            Self::Buffer(_) => vk::ObjectType::BUFFER,
            Self::CommandPool(_) => vk::ObjectType::COMMAND_POOL,
            Self::CommandBuffer(_) => vk::ObjectType::COMMAND_BUFFER,
            Self::RenderPass(_) => vk::ObjectType::RENDER_PASS,
            Self::Queue(_) => vk::ObjectType::QUEUE,
        }
    }

    /// Returns the raw value of the handle.
    #[inline]
    pub fn as_raw(self) -> u64 {
        match self {
            Self::Image(handle) => handle.as_raw(),
            Self::Buffer(handle) => handle.as_raw(),
            Self::CommandPool(handle) => handle.as_raw(),
            Self::CommandBuffer(handle) => handle.as_raw(),
            Self::RenderPass(handle) => handle.as_raw(),
            Self::Queue(handle) => handle.as_raw(),
        }
    }
}

impl Display for ObjectHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{:?} {:#x}", self.object_type(), self.as_raw())
    }
}

macro_rules! impl_from_handle {
    ($($ty:ident),+ $(,)?) => {
        $(
            impl From<vk::$ty> for ObjectHandle {
                #[inline]
                fn from(handle: vk::$ty) -> Self {
                    Self::$ty(handle)
                }
            }
        )+
    };
}

impl_from_handle!(Image, Buffer, CommandPool, CommandBuffer, RenderPass, Queue);

/// The class of rule that a [`ValidationError`] was raised for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A declared layout or barrier does not match the tracked state.
    #[default]
    StateMismatch,

    /// Something that must be unique was declared twice.
    Uniqueness,

    /// A render pass is missing a dependency or a preserve attachment.
    GraphIncomplete,

    /// An object was used in the wrong lifecycle state, or does not exist.
    Protocol,
}

/// A usage rule that was violated.
#[derive(Clone, Default)]
pub struct ValidationError {
    /// The context in which the problem exists (e.g. a specific parameter).
    pub context: Cow<'static, str>,

    /// A description of the problem.
    pub problem: Cow<'static, str>,

    /// The rule ids of the violated rules. The first one is used as the message id.
    pub vuids: &'static [&'static str],

    /// The objects involved in the problem.
    pub objects: SmallVec<[ObjectHandle; 2]>,

    /// The class of the violated rule.
    pub kind: ErrorKind,
}

impl ValidationError {
    pub(crate) fn add_context(mut self: Box<Self>, context: impl Into<String>) -> Box<Self> {
        if self.context.is_empty() {
            self.context = context.into().into();
        } else {
            self.context = format!("{}.{}", context.into(), self.context).into();
        }

        self
    }

    pub(crate) fn set_vuids(mut self: Box<Self>, vuids: &'static [&'static str]) -> Box<Self> {
        self.vuids = vuids;
        self
    }

    /// Returns the rule id that is used as the message id when reporting this error.
    #[inline]
    pub fn rule_id(&self) -> &'static str {
        self.vuids.first().copied().unwrap_or("UNASSIGNED")
    }
}

impl Debug for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "[{:?}] {}", self.kind, self)
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        if self.context.is_empty() {
            write!(f, "{}", self.problem)?;
        } else {
            write!(f, "{}: {}", self.context, self.problem)?;
        }

        if !self.vuids.is_empty() {
            write!(f, " (Vulkan VUIDs: {}", self.vuids[0])?;

            for vuid in &self.vuids[1..] {
                write!(f, ", {}", vuid)?;
            }

            write!(f, ")")?;
        }

        Ok(())
    }
}

impl Error for ValidationError {}
