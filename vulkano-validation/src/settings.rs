//! Configuration of the validator.

use std::env;

/// Which checks are enabled, and how messages are reported.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ValidationSettings {
    /// Track image layouts and check the layouts declared by barriers, render passes and
    /// submissions against them.
    ///
    /// The default value is `true`.
    pub image_layouts: bool,

    /// Match queue family ownership transfer barriers across command buffers and submissions.
    ///
    /// The default value is `true`.
    pub queue_family_ownership: bool,

    /// Check that render passes have the dependencies and preserve attachments that their
    /// attachment usage needs.
    ///
    /// The default value is `true`.
    pub render_pass_dependencies: bool,

    /// The number of times a message with the same rule id is emitted. Later occurrences are
    /// dropped, but the calls that caused them are still skipped. `None` means no limit.
    ///
    /// The default value is `Some(10)`.
    pub duplicate_message_limit: Option<u32>,

    /// Rule ids of messages that are never emitted, and that never cause a call to be skipped.
    ///
    /// The default value is empty.
    pub message_id_filter: Vec<String>,
}

impl Default for ValidationSettings {
    #[inline]
    fn default() -> Self {
        Self {
            image_layouts: true,
            queue_family_ownership: true,
            render_pass_dependencies: true,
            duplicate_message_limit: Some(10),
            message_id_filter: Vec::new(),
        }
    }
}

impl ValidationSettings {
    /// Reads the settings from the environment variables used by the Vulkan validation layers:
    ///
    /// - `VK_LAYER_DUPLICATE_MESSAGE_LIMIT`: the duplicate message limit, where `0` means no
    ///   limit.
    /// - `VK_LAYER_MESSAGE_ID_FILTER`: a comma-separated list of rule ids to mute.
    /// - `VK_LAYER_DISABLES`: a comma-separated list of checks to disable, out of `image_layouts`,
    ///   `queue_family_ownership` and `render_pass_dependencies`.
    ///
    /// Variables that are not set keep their default value.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), but reads the variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();

        if let Some(value) = lookup("VK_LAYER_DUPLICATE_MESSAGE_LIMIT") {
            match value.trim().parse::<u32>() {
                Ok(0) => settings.duplicate_message_limit = None,
                Ok(limit) => settings.duplicate_message_limit = Some(limit),
                Err(err) => log::warn!(
                    "ignoring invalid VK_LAYER_DUPLICATE_MESSAGE_LIMIT {:?}: {}",
                    value,
                    err,
                ),
            }
        }

        if let Some(value) = lookup("VK_LAYER_MESSAGE_ID_FILTER") {
            settings.message_id_filter = split_list(&value).map(str::to_owned).collect();
        }

        if let Some(value) = lookup("VK_LAYER_DISABLES") {
            for check in split_list(&value) {
                match check {
                    "image_layouts" => settings.image_layouts = false,
                    "queue_family_ownership" => settings.queue_family_ownership = false,
                    "render_pass_dependencies" => settings.render_pass_dependencies = false,
                    _ => log::warn!("ignoring unknown entry {:?} in VK_LAYER_DISABLES", check),
                }
            }
        }

        log::debug!("validation settings: {:?}", settings);

        settings
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
}
