//! Upstream ICY metadata lookup.
//!
//! Issues a GET against the radio URL, follows a bounded number of redirects,
//! and keeps only the allow-listed ICY headers. The response body (live audio)
//! is never read; dropping the response closes the connection.

use std::time::Duration;

use actix_web::http::header as actix_header;
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, LOCATION};
use reqwest::{Client, Url, redirect};

/// Redirects followed before giving up on metadata.
pub const MAX_REDIRECTS: usize = 5;

/// ICY headers copied from the upstream response to the client.
pub const ICY_HEADERS: [&str; 5] = [
    "icy-description",
    "icy-name",
    "icy-genre",
    "icy-pub",
    "icy-url",
];

/// Allow-listed ICY headers captured from an upstream response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IcyHeaders {
    entries: Vec<(&'static str, Vec<u8>)>,
}

impl IcyHeaders {
    /// Keep only allow-listed, non-empty headers. Values stay as raw bytes
    /// since station names are frequently Latin-1.
    pub fn from_upstream(headers: &HeaderMap) -> Self {
        let entries = ICY_HEADERS
            .iter()
            .filter_map(|name| {
                let value = headers.get(*name)?;
                if value.is_empty() {
                    return None;
                }
                Some((*name, value.as_bytes().to_vec()))
            })
            .collect();
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &[u8])> {
        self.entries
            .iter()
            .map(|(name, value)| (*name, value.as_slice()))
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.iter()
            .find(|(entry, _)| entry.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Fetches response headers from radio servers.
#[derive(Clone)]
pub struct MetadataResolver {
    client: Client,
}

impl MetadataResolver {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .context("build metadata http client")?;
        Ok(Self { client })
    }

    /// Resolve ICY headers for `source`, forwarding the client's own request
    /// headers. Returns `None` on any transport failure or when the redirect
    /// chain is longer than [`MAX_REDIRECTS`].
    pub async fn resolve(
        &self,
        source: &Url,
        inbound: &actix_header::HeaderMap,
    ) -> Option<IcyHeaders> {
        let headers = upstream_headers(inbound);
        let mut current = source.clone();

        for hop in 0..=MAX_REDIRECTS {
            let resp = match self
                .client
                .get(current.clone())
                .headers(headers.clone())
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::debug!(url = %current, error = %e, "metadata request failed");
                    return None;
                }
            };

            if resp.status().is_redirection() {
                if let Some(location) = resp.headers().get(LOCATION) {
                    let next = match redirect_target(&current, location) {
                        Some(next) => next,
                        None => {
                            tracing::debug!(url = %current, "unusable redirect location");
                            return None;
                        }
                    };
                    tracing::debug!(hop = hop + 1, from = %current, to = %next, "following redirect");
                    current = next;
                    continue;
                }
            }

            tracing::debug!(url = %current, status = %resp.status(), "metadata resolved");
            return Some(IcyHeaders::from_upstream(resp.headers()));
        }

        tracing::debug!(url = %source, max = MAX_REDIRECTS, "too many redirects; skipping metadata");
        None
    }
}

/// Copy the client's request headers for the upstream request, minus `host`.
pub fn upstream_headers(inbound: &actix_header::HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound.iter() {
        if *name == actix_header::HOST {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(name.as_str().as_bytes()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_bytes(value.as_bytes()) else {
            continue;
        };
        headers.append(name, value);
    }
    headers
}

fn redirect_target(current: &Url, location: &HeaderValue) -> Option<Url> {
    let location = location.to_str().ok()?;
    current.join(location).ok()
}
