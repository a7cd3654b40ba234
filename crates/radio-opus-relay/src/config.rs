//! Configuration loading and parsing.
//!
//! Merges CLI flags (and their environment fallbacks), an optional TOML file,
//! and built-in defaults into one immutable [`AppConfig`].

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::{Args, LogLevel};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_OUTPUT_PATH: &str = "/";
const DEFAULT_BITRATE_KBPS: u32 = 128;
const DEFAULT_TIMEZONE: &str = "UTC";
const DEFAULT_ENCODER: &str = "ffmpeg";
const DEFAULT_METADATA_TIMEOUT_SECS: u64 = 5;

/// Optional server configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct ServerConfig {
    /// TCP port to listen on.
    pub port: Option<u16>,
    /// Path prefix for stream requests.
    pub output_path: Option<String>,
    /// Bitrate (kbps) used when a request does not specify one.
    pub default_bitrate: Option<u32>,
    /// Timezone handed to encoder processes.
    pub timezone: Option<String>,
    /// `debug` or `info`.
    pub log_level: Option<LogLevel>,
    /// Encoder program path.
    pub encoder: Option<String>,
    /// Upstream metadata timeout in seconds.
    pub metadata_timeout_secs: Option<u64>,
    /// HTTP worker count.
    pub workers: Option<usize>,
}

impl ServerConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<ServerConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }
}

/// Fully resolved settings, read-only after startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub output_path: String,
    pub default_bitrate: u32,
    pub timezone: String,
    pub log_level: LogLevel,
    pub encoder: PathBuf,
    pub metadata_timeout: Duration,
    pub workers: Option<usize>,
    /// Keys that fell back to their built-in default.
    pub defaulted: Vec<&'static str>,
}

impl AppConfig {
    /// Resolve settings from CLI/env first, then the config file, then defaults.
    pub fn resolve(args: &Args, file: &ServerConfig) -> Result<Self> {
        let mut defaulted = Vec::new();

        let port = pick(args.port, file.port, DEFAULT_PORT, "HTTP_PORT", &mut defaulted);
        let output_path = normalize_output_path(&pick(
            args.output_path.clone(),
            file.output_path.clone(),
            DEFAULT_OUTPUT_PATH.to_string(),
            "OUTPUT_PATH",
            &mut defaulted,
        ));
        let default_bitrate = pick(
            args.default_bitrate,
            file.default_bitrate,
            DEFAULT_BITRATE_KBPS,
            "DEFAULT_BITRATE",
            &mut defaulted,
        );
        if default_bitrate == 0 {
            return Err(anyhow::anyhow!("default bitrate must be greater than zero"));
        }
        let timezone = pick(
            args.timezone.clone().filter(|tz| !tz.trim().is_empty()),
            file.timezone.clone(),
            DEFAULT_TIMEZONE.to_string(),
            "TZ",
            &mut defaulted,
        );
        let log_level = pick(
            args.log_level,
            file.log_level,
            LogLevel::default(),
            "LOG_LEVEL",
            &mut defaulted,
        );
        let encoder = pick(
            args.encoder.clone(),
            file.encoder.as_deref().map(PathBuf::from),
            PathBuf::from(DEFAULT_ENCODER),
            "ENCODER_PATH",
            &mut defaulted,
        );
        let timeout_secs = pick(
            args.metadata_timeout_secs,
            file.metadata_timeout_secs,
            DEFAULT_METADATA_TIMEOUT_SECS,
            "METADATA_TIMEOUT_SECS",
            &mut defaulted,
        );
        if timeout_secs == 0 {
            return Err(anyhow::anyhow!("metadata timeout must be at least one second"));
        }
        let workers = args.workers.or(file.workers).filter(|n| *n > 0);

        Ok(Self {
            port,
            output_path,
            default_bitrate,
            timezone,
            log_level,
            encoder,
            metadata_timeout: Duration::from_secs(timeout_secs),
            workers,
            defaulted,
        })
    }

    /// Address the HTTP server binds to.
    pub fn bind(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }
}

fn pick<T>(
    arg: Option<T>,
    file: Option<T>,
    default: T,
    key: &'static str,
    defaulted: &mut Vec<&'static str>,
) -> T {
    match arg.or(file) {
        Some(value) => value,
        None => {
            defaulted.push(key);
            default
        }
    }
}

/// Ensure the stream prefix is rooted; an empty value means `/`.
pub fn normalize_output_path(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Load the config file when one was given on the command line.
pub fn load_optional(path: Option<&PathBuf>) -> Result<ServerConfig> {
    match path {
        Some(path) => ServerConfig::load(path),
        None => Ok(ServerConfig::default()),
    }
}
