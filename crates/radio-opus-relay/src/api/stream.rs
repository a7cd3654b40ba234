//! Transcoded stream endpoint.

use std::time::Instant;

use actix_web::http::header::{self, HeaderValue};
use actix_web::{HttpRequest, HttpResponse, HttpResponseBuilder, web};

use crate::metadata::IcyHeaders;
use crate::models::{StreamQuery, StreamRequest};
use crate::state::AppState;
use crate::transcode::{OUTPUT_CONTENT_TYPE, TranscodeSession};

/// Resolve upstream metadata, spawn an encoder, and stream its output.
pub async fn stream_radio(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let query = match web::Query::<StreamQuery>::from_query(req.query_string()) {
        Ok(query) => query.into_inner(),
        Err(e) => {
            tracing::info!(query = %req.query_string(), error = %e, "malformed stream query");
            return HttpResponse::BadRequest().body("malformed query string");
        }
    };
    let request = match StreamRequest::from_query(&query, state.default_bitrate) {
        Ok(request) => request,
        Err(e) => {
            tracing::info!(error = ?e, "rejected stream request");
            return e.into_response();
        }
    };
    tracing::info!(
        url = %request.source,
        bitrate_kbps = request.bitrate_kbps,
        "stream requested"
    );
    tracing::debug!(headers = ?req.headers(), "incoming request headers");

    let icy = state.resolver.resolve(&request.source, req.headers()).await;
    match icy.as_ref().filter(|icy| !icy.is_empty()) {
        Some(icy) => tracing::info!(
            station = %icy.get("icy-name").map(String::from_utf8_lossy).unwrap_or_default(),
            headers = icy.iter().count(),
            "radio metadata resolved"
        ),
        None => tracing::info!(url = %request.source, "no radio metadata; streaming without it"),
    }

    let (body, session) = match TranscodeSession::start(&state.encoder, &request) {
        Ok(started) => started,
        Err(e) => {
            tracing::warn!(url = %request.source, error = %e, "encoder unavailable");
            return e.into_response();
        }
    };
    let pid = session.pid();
    let started = Instant::now();
    actix_web::rt::spawn(async move {
        let end = session.wait().await;
        tracing::debug!(
            pid = ?pid,
            outcome = ?end,
            streamed_secs = started.elapsed().as_secs(),
            "stream closed"
        );
    });

    stream_response(icy.as_ref()).streaming(body)
}

/// Response head for a stream: the fixed output type plus any ICY headers.
pub fn stream_response(icy: Option<&IcyHeaders>) -> HttpResponseBuilder {
    let mut resp = HttpResponse::Ok();
    resp.insert_header((header::CONTENT_TYPE, OUTPUT_CONTENT_TYPE));
    for (name, value) in icy.into_iter().flat_map(|icy| icy.iter()) {
        match HeaderValue::from_bytes(value) {
            Ok(value) => {
                resp.insert_header((name, value));
            }
            Err(_) => tracing::debug!(header = name, "skipping unrepresentable icy header"),
        }
    }
    resp
}
