//! Request types for the stream endpoint.

use actix_web::HttpResponse;
use reqwest::Url;
use serde::Deserialize;

/// Raw query parameters of a stream request.
#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Source radio URL.
    #[serde(rename = "_radio")]
    pub radio: Option<String>,
    /// Target bitrate in kbps; kept as text so garbage falls back to the default.
    #[serde(rename = "_bitrate")]
    pub bitrate: Option<String>,
}

/// A validated stream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub source: Url,
    pub bitrate_kbps: u32,
}

#[derive(Debug)]
pub enum StreamRequestError {
    MissingRadio,
    InvalidRadio { raw: String, reason: String },
    UnsupportedScheme { scheme: String },
}

impl StreamRequestError {
    pub fn into_response(self) -> HttpResponse {
        match self {
            StreamRequestError::MissingRadio => {
                HttpResponse::BadRequest().body("missing _radio parameter")
            }
            StreamRequestError::InvalidRadio { raw, reason } => {
                HttpResponse::BadRequest().body(format!("invalid _radio url {raw:?}: {reason}"))
            }
            StreamRequestError::UnsupportedScheme { scheme } => HttpResponse::BadRequest()
                .body(format!("unsupported _radio scheme: {scheme}")),
        }
    }
}

impl StreamRequest {
    pub fn from_query(
        query: &StreamQuery,
        default_bitrate: u32,
    ) -> Result<Self, StreamRequestError> {
        let raw = query
            .radio
            .as_deref()
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .ok_or(StreamRequestError::MissingRadio)?;
        let source = Url::parse(raw).map_err(|e| StreamRequestError::InvalidRadio {
            raw: raw.to_string(),
            reason: e.to_string(),
        })?;
        match source.scheme() {
            "http" | "https" => {}
            other => {
                return Err(StreamRequestError::UnsupportedScheme {
                    scheme: other.to_string(),
                });
            }
        }

        let bitrate_kbps = query
            .bitrate
            .as_deref()
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .filter(|kbps| *kbps > 0)
            .unwrap_or(default_bitrate);

        Ok(Self {
            source,
            bitrate_kbps,
        })
    }
}
