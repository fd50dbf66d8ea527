// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use log::warn;

use crate::error::GfxstreamError;
use crate::error::GfxstreamResult;

/// How long a color buffer whose refcount reached zero is kept around. Long enough to ride out a
/// guest free/re-register pair that straddles a second boundary, short enough not to matter for
/// memory.
pub const DEFAULT_CLOSE_GRACE_PERIOD_US: u64 = 1_000_000;

pub const DEFAULT_DISPLAY_WIDTH: u32 = 1280;
pub const DEFAULT_DISPLAY_HEIGHT: u32 = 1024;
pub const DEFAULT_DISPLAY_DPI: u32 = 160;

/// Guest-visible behaviors that change how the registry counts references.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RendererFeatures {
    /// The guest kernel tracks color buffer lifetime through a pipe. Guest open/close calls are
    /// ignored and destruction arrives through `on_last_color_buffer_ref`.
    pub refcount_pipe: bool,
    /// A zero refcount destroys a color buffer right away instead of scheduling a delayed close.
    pub no_delay_close_color_buffer: bool,
    /// The guest manages color buffer lifetime itself; window surface bindings and process
    /// cleanup do not touch color buffer refcounts.
    pub guest_managed_color_buffer_lifetime: bool,
    /// Pre-O guests expect new color buffers to start with one reference owned by the creating
    /// process.
    pub legacy_refcount_init: bool,
}

impl RendererFeatures {
    /// Parses a `Name:enabled,Name:disabled` list as handed over by the VMM.
    pub fn parse(renderer_features: &str) -> GfxstreamResult<RendererFeatures> {
        RendererFeatures::default().apply(renderer_features)
    }

    /// Like `parse`, but features the list does not name keep their current value.
    pub fn apply(self, renderer_features: &str) -> GfxstreamResult<RendererFeatures> {
        let mut features = self;
        for entry in renderer_features.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }

            let (name, state) = entry
                .split_once(':')
                .ok_or(GfxstreamError::Unsupported("renderer feature without a state"))?;
            let enabled = match state {
                "enabled" => true,
                "disabled" => false,
                _ => return Err(GfxstreamError::Unsupported("renderer feature state")),
            };

            match name {
                "RefCountPipe" => features.refcount_pipe = enabled,
                // Minigbm ties every color buffer to a guest kernel object.
                "NoDelayCloseColorBuffer" | "Minigbm" => {
                    features.no_delay_close_color_buffer |= enabled
                }
                "GuestManagedColorBufferLifetime" => {
                    features.guest_managed_color_buffer_lifetime = enabled
                }
                "LegacyRefcountInit" => features.legacy_refcount_init = enabled,
                _ => warn!("ignoring unknown renderer feature {}", name),
            }
        }

        Ok(features)
    }
}

/// Scalars describing the default display, persisted in snapshots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    pub dpi_x: u32,
    pub dpi_y: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        DisplayConfig {
            width: DEFAULT_DISPLAY_WIDTH,
            height: DEFAULT_DISPLAY_HEIGHT,
            dpi_x: DEFAULT_DISPLAY_DPI,
            dpi_y: DEFAULT_DISPLAY_DPI,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistryConfig {
    pub features: RendererFeatures,
    pub close_grace_period_us: u64,
    pub display: DisplayConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            features: Default::default(),
            close_grace_period_us: DEFAULT_CLOSE_GRACE_PERIOD_US,
            display: Default::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_feature_list() {
        let features = RendererFeatures::parse(
            "RefCountPipe:disabled, Minigbm:enabled,GuestManagedColorBufferLifetime:enabled",
        )
        .unwrap();
        assert!(!features.refcount_pipe);
        assert!(features.no_delay_close_color_buffer);
        assert!(features.guest_managed_color_buffer_lifetime);
        assert!(!features.legacy_refcount_init);
    }

    #[test]
    fn minigbm_disabled_does_not_clear_no_delay() {
        let features =
            RendererFeatures::parse("NoDelayCloseColorBuffer:enabled,Minigbm:disabled").unwrap();
        assert!(features.no_delay_close_color_buffer);
    }

    #[test]
    fn unknown_features_are_ignored() {
        let features = RendererFeatures::parse("VulkanSnapshots:enabled").unwrap();
        assert_eq!(features, RendererFeatures::default());
    }

    #[test]
    fn malformed_entries_are_rejected() {
        assert!(RendererFeatures::parse("RefCountPipe").is_err());
        assert!(RendererFeatures::parse("RefCountPipe:on").is_err());
        assert!(RendererFeatures::parse("").is_ok());
    }
}
