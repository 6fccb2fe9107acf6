//! Delivery of validation messages.

use crate::{ErrorKind, ObjectHandle, ValidationError};
use foldhash::{HashMap, HashSet};
use parking_lot::Mutex;
use std::{fmt::Write, sync::Arc};

/// A single validation message, as handed to a [`MessageSink`].
#[derive(Clone, Copy, Debug)]
pub struct Message<'a> {
    /// The rule id of the violated rule.
    pub vuid: &'static str,

    /// The objects that the message is about.
    pub objects: &'a [ObjectHandle],

    /// The formatted message.
    pub text: &'a str,

    pub kind: ErrorKind,
}

/// Receives validation messages.
///
/// Messages can be emitted from any thread that calls into the validator, so implementations
/// must be thread-safe. A sink must not call back into the validator that emitted the message.
pub trait MessageSink: Send + Sync {
    fn emit(&self, message: &Message<'_>);
}

/// A sink that forwards messages to the [`log`] crate, at the error level.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl MessageSink for LogSink {
    fn emit(&self, message: &Message<'_>) {
        let mut objects = String::new();

        for (i, object) in message.objects.iter().enumerate() {
            if i != 0 {
                objects.push_str(", ");
            }

            let _ = write!(objects, "{}", object);
        }

        log::error!(
            target: "vulkano_validation",
            "[{}] {} [objects: {}]",
            message.vuid,
            message.text,
            objects,
        );
    }
}

/// An owned copy of a [`Message`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectedMessage {
    pub vuid: &'static str,
    pub objects: Vec<ObjectHandle>,
    pub text: String,
    pub kind: ErrorKind,
}

/// A sink that stores every message it receives.
#[derive(Debug, Default)]
pub struct CollectingSink {
    messages: Mutex<Vec<CollectedMessage>>,
}

impl CollectingSink {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the messages received so far.
    pub fn messages(&self) -> Vec<CollectedMessage> {
        self.messages.lock().clone()
    }

    /// Returns the rule ids of the messages received so far.
    pub fn vuids(&self) -> Vec<&'static str> {
        self.messages.lock().iter().map(|m| m.vuid).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Removes and returns the messages received so far.
    pub fn take(&self) -> Vec<CollectedMessage> {
        std::mem::take(&mut *self.messages.lock())
    }
}

impl MessageSink for CollectingSink {
    fn emit(&self, message: &Message<'_>) {
        self.messages.lock().push(CollectedMessage {
            vuid: message.vuid,
            objects: message.objects.to_vec(),
            text: message.text.to_owned(),
            kind: message.kind,
        });
    }
}

/// Hands errors to the sink, applying the message filter and the duplicate limit.
pub(crate) struct Reporter {
    sink: Arc<dyn MessageSink>,
    duplicate_message_limit: Option<u32>,
    muted: HashSet<String>,
    counts: Mutex<HashMap<&'static str, u32>>,
}

impl Reporter {
    pub(crate) fn new(
        sink: Arc<dyn MessageSink>,
        duplicate_message_limit: Option<u32>,
        message_id_filter: &[String],
    ) -> Self {
        Reporter {
            sink,
            duplicate_message_limit,
            muted: message_id_filter.iter().cloned().collect(),
            counts: Mutex::new(HashMap::default()),
        }
    }

    /// Reports a single error. Returns whether the call that caused it must be skipped.
    pub(crate) fn report(&self, error: &ValidationError) -> bool {
        let vuid = error.rule_id();

        if self.muted.contains(vuid) {
            return false;
        }

        let count = {
            let mut counts = self.counts.lock();
            let count = counts.entry(vuid).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };

        if self.duplicate_message_limit.is_some_and(|limit| count > limit) {
            return true;
        }

        let text = error.to_string();
        self.sink.emit(&Message {
            vuid,
            objects: &error.objects,
            text: &text,
            kind: error.kind,
        });

        true
    }

    /// Reports every error. Returns whether the call that caused them must be skipped.
    pub(crate) fn report_all(
        &self,
        errors: impl IntoIterator<Item = Box<ValidationError>>,
    ) -> bool {
        errors
            .into_iter()
            .fold(false, |skip, error| self.report(&error) | skip)
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("duplicate_message_limit", &self.duplicate_message_limit)
            .field("muted", &self.muted)
            .finish_non_exhaustive()
    }
}
