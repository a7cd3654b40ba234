//! Actix server startup + lifecycle.
//!
//! Resolves configuration, wires routes and middleware, and owns the
//! signal-driven graceful shutdown.

use std::time::{Duration, Instant};

use actix_web::dev::{Service, ServiceRequest, ServiceResponse, ServerHandle};
use actix_web::http::{Method, StatusCode, header};
use actix_web::{App, Error, HttpServer, web};
use anyhow::{Context as _, Result};
use futures_util::future::{LocalBoxFuture, Ready, ok};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::api;
use crate::cli::Args;
use crate::config::{self, AppConfig};
use crate::state::AppState;

/// How long in-flight responses get to finish after a termination signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Build server state and run the Actix HTTP server until shutdown.
pub(crate) async fn run(args: Args) -> Result<()> {
    let file = config::load_optional(args.config.as_ref())?;
    let cfg = AppConfig::resolve(&args, &file)?;
    init_tracing(&cfg);
    log_defaults(&cfg);

    let bind = cfg.bind();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        git_sha = env!("GIT_SHA"),
        bind = %bind,
        output_path = %cfg.output_path,
        default_bitrate = cfg.default_bitrate,
        encoder = %cfg.encoder.display(),
        "starting radio-opus-relay"
    );
    tracing::info!(timezone = %cfg.timezone, "server timezone");

    let state = web::Data::new(AppState::new(&cfg)?);
    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(RequestLog)
            .service(api::healthcheck_resource())
            .default_service(web::to(api::dispatch))
    })
    .disable_signals()
    .shutdown_timeout(SHUTDOWN_GRACE.as_secs() + 1);
    if let Some(workers) = cfg.workers {
        server = server.workers(workers);
    }
    let server = server
        .bind(bind)
        .with_context(|| format!("bind {bind}"))?
        .run();
    tracing::info!(port = cfg.port, "server listening");
    tracing::info!(path = %cfg.output_path, "stream available");

    setup_shutdown(server.handle())?;
    server.await?;
    tracing::info!("server stopped");
    Ok(())
}

fn init_tracing(cfg: &AppConfig) {
    let level = cfg.log_level.as_directive();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{level},actix_web=info,radio_opus_relay={level}"))
        }))
        .init();
}

fn log_defaults(cfg: &AppConfig) {
    for key in &cfg.defaulted {
        if *key == "HTTP_PORT" {
            tracing::debug!(key, port = cfg.port, "setting not provided; using default");
        } else {
            tracing::info!(key, "setting not provided; using default");
        }
    }
}

/// Route SIGINT/SIGTERM to a graceful stop; exit non-zero if it overruns the grace period.
fn setup_shutdown(handle: ServerHandle) -> Result<()> {
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<()>();
    ctrlc::set_handler(move || {
        let _ = signal_tx.send(());
    })
    .context("install signal handler")?;

    actix_web::rt::spawn(async move {
        if signal_rx.recv().await.is_none() {
            return;
        }
        tracing::info!("termination signal received; stopping server");
        if stop_within(&handle, SHUTDOWN_GRACE).await == StopOutcome::TimedOut {
            tracing::error!(
                grace_secs = SHUTDOWN_GRACE.as_secs(),
                "shutdown timed out; exiting now"
            );
            std::process::exit(1);
        }
    });
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopOutcome {
    Drained,
    TimedOut,
}

/// Stop accepting connections and wait up to `grace` for open responses to finish.
async fn stop_within(handle: &ServerHandle, grace: Duration) -> StopOutcome {
    tokio::select! {
        _ = handle.stop(true) => StopOutcome::Drained,
        _ = tokio::time::sleep(grace) => StopOutcome::TimedOut,
    }
}

/// Return true when the request path should be logged.
fn should_log_path(path: &str) -> bool {
    !matches!(path, "/healthcheck" | "/healthcheck/")
}

/// Fields captured before a request is handed on, emitted once its status is known.
struct RequestLine {
    method: Method,
    path: String,
    peer: String,
    user_agent: String,
    started: Instant,
}

impl RequestLine {
    fn capture(req: &ServiceRequest) -> Self {
        let user_agent = req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();
        Self {
            method: req.method().clone(),
            path: req.path().to_string(),
            peer: req
                .connection_info()
                .realip_remote_addr()
                .unwrap_or("-")
                .to_string(),
            user_agent,
            started: Instant::now(),
        }
    }

    // For streams this fires when the head is ready, not when the body ends.
    fn emit(&self, status: StatusCode) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        if status.is_server_error() {
            tracing::warn!(
                method = %self.method,
                path = %self.path,
                status = status.as_u16(),
                user_agent = %self.user_agent,
                peer = %self.peer,
                elapsed_ms,
                "http request failed"
            );
        } else {
            tracing::info!(
                method = %self.method,
                path = %self.path,
                status = status.as_u16(),
                user_agent = %self.user_agent,
                peer = %self.peer,
                elapsed_ms,
                "http request"
            );
        }
    }
}

/// One log line per request; healthcheck probes are passed through silently.
struct RequestLog;

impl<S, B> actix_web::dev::Transform<S, ServiceRequest> for RequestLog
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLogService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RequestLogService { inner: service })
    }
}

struct RequestLogService<S> {
    inner: S,
}

impl<S, B> Service<ServiceRequest> for RequestLogService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    actix_web::dev::forward_ready!(inner);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        if !should_log_path(req.path()) {
            return Box::pin(self.inner.call(req));
        }
        let line = RequestLine::capture(&req);
        let fut = self.inner.call(req);
        Box::pin(async move {
            let res = fut.await?;
            line.emit(res.status());
            Ok(res)
        })
    }
}

#[cfg(test)]
mod tests {
    use actix_web::web::Bytes;
    use actix_web::{HttpResponse, test as actix_test};
    use futures_util::{StreamExt, stream};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;

    async fn open_stream() -> HttpResponse {
        let body = stream::once(async { Ok::<_, Error>(Bytes::from_static(b"OggS")) })
            .chain(stream::pending());
        HttpResponse::Ok().streaming(body)
    }

    fn start_server() -> (std::net::SocketAddr, ServerHandle) {
        let server = HttpServer::new(|| {
            App::new()
                .route("/idle", web::get().to(|| async { HttpResponse::Ok().finish() }))
                .route("/open", web::get().to(open_stream))
        })
        .workers(1)
        .disable_signals()
        .shutdown_timeout(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        let server = server.run();
        let handle = server.handle();
        actix_web::rt::spawn(server);
        (addr, handle)
    }

    #[test]
    fn should_log_path_skips_healthcheck() {
        assert!(!should_log_path("/healthcheck"));
        assert!(!should_log_path("/healthcheck/"));
        assert!(should_log_path("/stream"));
        assert!(should_log_path("/"));
    }

    #[actix_web::test]
    async fn request_log_passes_responses_through() {
        let app = actix_test::init_service(
            App::new()
                .wrap(RequestLog)
                .route("/ping", web::get().to(|| async { HttpResponse::Ok().body("pong") }))
                .route("/fail", web::get().to(|| async { HttpResponse::BadGateway().finish() })),
        )
        .await;
        let req = actix_test::TestRequest::get().uri("/ping").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(&actix_test::read_body(resp).await[..], b"pong");

        let req = actix_test::TestRequest::get().uri("/fail").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[actix_web::test]
    async fn idle_server_drains_within_grace() {
        let (_, handle) = start_server();
        let outcome = stop_within(&handle, Duration::from_secs(5)).await;
        assert_eq!(outcome, StopOutcome::Drained);
    }

    #[actix_web::test]
    async fn open_stream_overruns_grace() {
        let (addr, handle) = start_server();
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /open HTTP/1.1\r\nHost: relay.test\r\n\r\n")
            .await
            .unwrap();
        let mut head = [0u8; 64];
        let read = client.read(&mut head).await.unwrap();
        assert!(head[..read].starts_with(b"HTTP/1.1 200"));

        let started = Instant::now();
        let outcome = stop_within(&handle, Duration::from_millis(300)).await;
        assert_eq!(outcome, StopOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
