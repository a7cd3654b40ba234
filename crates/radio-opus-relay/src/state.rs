//! Shared, read-only server state.

use anyhow::Result;

use crate::config::AppConfig;
use crate::metadata::MetadataResolver;
use crate::transcode::EncoderConfig;

/// State handed to every handler. Nothing in here changes after startup.
pub struct AppState {
    /// Path prefix that routes to the stream handler.
    pub output_path: String,
    /// Bitrate used when a request does not carry a usable one.
    pub default_bitrate: u32,
    pub resolver: MetadataResolver,
    pub encoder: EncoderConfig,
}

impl AppState {
    pub fn new(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            output_path: config.output_path.clone(),
            default_bitrate: config.default_bitrate,
            resolver: MetadataResolver::new(config.metadata_timeout)?,
            encoder: EncoderConfig {
                program: config.encoder.clone(),
                timezone: config.timezone.clone(),
            },
        })
    }
}
