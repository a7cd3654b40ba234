use std::path::PathBuf;

use clap::{Parser, ValueEnum};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug, Default)]
#[command(name = "radio-opus-relay", version = VERSION)]
pub struct Args {
    /// Optional server config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// TCP port to listen on
    #[arg(long, env = "HTTP_PORT")]
    pub port: Option<u16>,

    /// Path prefix that serves transcoded streams, e.g. /stream
    #[arg(long, env = "OUTPUT_PATH")]
    pub output_path: Option<String>,

    /// Opus bitrate in kbps when the request carries no usable `_bitrate`
    #[arg(long, env = "DEFAULT_BITRATE")]
    pub default_bitrate: Option<u32>,

    /// Timezone handed to the encoder process
    #[arg(long, env = "TZ")]
    pub timezone: Option<String>,

    /// Log verbosity (RUST_LOG overrides)
    #[arg(long, env = "LOG_LEVEL", value_enum, ignore_case = true)]
    pub log_level: Option<LogLevel>,

    /// Encoder program (an ffmpeg-compatible binary)
    #[arg(long, env = "ENCODER_PATH")]
    pub encoder: Option<PathBuf>,

    /// Connect/response timeout for upstream metadata requests
    #[arg(long, env = "METADATA_TIMEOUT_SECS")]
    pub metadata_timeout_secs: Option<u64>,

    /// HTTP worker threads (defaults to one per core)
    #[arg(long, env = "HTTP_WORKERS")]
    pub workers: Option<usize>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[serde(alias = "DEBUG")]
    Debug,
    #[default]
    #[serde(alias = "INFO")]
    Info,
}

impl LogLevel {
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}
