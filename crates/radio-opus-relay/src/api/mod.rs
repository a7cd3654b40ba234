//! HTTP API handlers.
//!
//! Routes the healthcheck, the stream prefix, and everything else (404).

pub mod health;
pub mod stream;

use actix_web::http::Method;
use actix_web::{HttpRequest, HttpResponse, web};

pub use health::healthcheck_resource;
pub use stream::stream_radio;

/// Fallback service: stream requests under the configured prefix, 404 otherwise.
pub async fn dispatch(req: HttpRequest, state: web::Data<crate::state::AppState>) -> HttpResponse {
    if req.method() == Method::GET && req.path().starts_with(state.output_path.as_str()) {
        return stream_radio(req, state).await;
    }
    not_found(&req)
}

fn not_found(req: &HttpRequest) -> HttpResponse {
    tracing::info!(method = %req.method(), url = %req.uri(), "404 invalid url");
    HttpResponse::NotFound().finish()
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::time::Duration;

    use actix_web::dev::ServerHandle;
    use actix_web::http::StatusCode;
    use actix_web::http::header;
    use actix_web::{App, HttpResponse, HttpServer, test, web};

    use crate::api;
    use crate::metadata::MetadataResolver;
    use crate::state::AppState;
    use crate::transcode::EncoderConfig;

    fn make_state(output_path: &str, encoder: EncoderConfig) -> web::Data<AppState> {
        web::Data::new(AppState {
            output_path: output_path.to_string(),
            default_bitrate: 128,
            resolver: MetadataResolver::new(Duration::from_secs(2)).expect("resolver"),
            encoder,
        })
    }

    fn missing_encoder() -> EncoderConfig {
        EncoderConfig {
            program: PathBuf::from("/nonexistent/radio-opus-relay-encoder"),
            timezone: "UTC".to_string(),
        }
    }

    async fn start_radio() -> (SocketAddr, ServerHandle) {
        let server = HttpServer::new(|| {
            App::new()
                .route(
                    "/live",
                    web::get().to(|| async {
                        HttpResponse::MovedPermanently()
                            .insert_header(("location", "/relay/live"))
                            .finish()
                    }),
                )
                .route(
                    "/relay/live",
                    web::get().to(|| async {
                        HttpResponse::Ok()
                            .insert_header(("icy-name", "TestRadio"))
                            .insert_header(("icy-metaint", "16000"))
                            .insert_header(("x-station-id", "42"))
                            .finish()
                    }),
                )
        })
        .workers(1)
        .disable_signals()
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        let server = server.run();
        let handle = server.handle();
        actix_web::rt::spawn(server);
        (addr, handle)
    }

    macro_rules! relay_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data($state.clone())
                    .service(api::healthcheck_resource())
                    .default_service(web::to(api::dispatch)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn healthcheck_wins_over_root_stream_prefix() {
        let state = make_state("/", missing_encoder());
        let app = relay_app!(state);

        for uri in ["/healthcheck", "/healthcheck/"] {
            let req = test::TestRequest::get().uri(uri).to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::OK, "{uri}");
            assert!(test::read_body(resp).await.is_empty());
        }
    }

    #[actix_web::test]
    async fn unknown_path_returns_404() {
        let state = make_state("/stream", missing_encoder());
        let app = relay_app!(state);

        let req = test::TestRequest::get().uri("/favicon.ico").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::post()
            .uri("/stream?_radio=http://example.test/live")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn invalid_radio_returns_400() {
        let state = make_state("/stream", missing_encoder());
        let app = relay_app!(state);

        for uri in [
            "/stream",
            "/stream?_bitrate=96",
            "/stream?_radio=ftp%3A%2F%2Fexample.test%2Flive",
            "/stream?_radio=nope",
        ] {
            let req = test::TestRequest::get().uri(uri).to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{uri}");
        }
    }

    #[actix_web::test]
    async fn encoder_spawn_failure_returns_502() {
        let state = make_state("/stream", missing_encoder());
        let app = relay_app!(state);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let closed = listener.local_addr().unwrap();
        drop(listener);
        let req = test::TestRequest::get()
            .uri(&format!("/stream?_radio=http://{closed}/live"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[cfg(unix)]
    #[actix_web::test]
    async fn stream_forwards_icy_headers_after_redirect() {
        let (radio, handle) = start_radio().await;
        let encoder = crate::transcode::test_support::fake_encoder(
            "api-stream",
            "printf 'OggS-opus'",
        );
        let state = make_state("/stream", encoder);
        let app = relay_app!(state);

        let req = test::TestRequest::get()
            .uri(&format!("/stream?_radio=http://{radio}/live&_bitrate=96"))
            .insert_header((header::HOST, "relay.example"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "audio/opus");
        assert_eq!(resp.headers().get("icy-name").unwrap(), "TestRadio");
        assert!(resp.headers().get("icy-metaint").is_none());
        assert!(resp.headers().get("x-station-id").is_none());

        let body = test::read_body(resp).await;
        assert_eq!(&body[..], b"OggS-opus");

        handle.stop(false).await;
    }

    #[cfg(unix)]
    #[actix_web::test]
    async fn unreachable_radio_streams_without_metadata() {
        let encoder = crate::transcode::test_support::fake_encoder("api-unreachable", "exit 1");
        let state = make_state("/", encoder);
        let app = relay_app!(state);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let closed = listener.local_addr().unwrap();
        drop(listener);
        let req = test::TestRequest::get()
            .uri(&format!("/?_radio=http://{closed}/live"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "audio/opus");
        assert!(resp.headers().keys().all(|name| !name.as_str().starts_with("icy-")));

        let body = tokio::time::timeout(Duration::from_secs(5), test::read_body(resp))
            .await
            .expect("response must end when the encoder exits");
        assert!(body.is_empty());
    }

    #[cfg(target_os = "linux")]
    #[actix_web::test]
    async fn dropped_client_connection_stops_encoder() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpStream;

        let encoder = crate::transcode::test_support::fake_encoder(
            "api-disconnect",
            "echo $$ > \"$(dirname \"$0\")/pid\"\nwhile :; do printf 'OggS'; sleep 0.01; done",
        );
        let pid_file = encoder.program.with_file_name("pid");
        let state = make_state("/stream", encoder);
        let server = HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .service(api::healthcheck_resource())
                .default_service(web::to(api::dispatch))
        })
        .workers(1)
        .disable_signals()
        .bind(("127.0.0.1", 0))
        .unwrap();
        let relay = server.addrs()[0];
        let server = server.run();
        let handle = server.handle();
        actix_web::rt::spawn(server);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let closed = listener.local_addr().unwrap();
        drop(listener);

        let mut client = TcpStream::connect(relay).await.unwrap();
        client
            .write_all(
                format!("GET /stream?_radio=http://{closed}/live HTTP/1.1\r\nHost: relay.test\r\n\r\n")
                    .as_bytes(),
            )
            .await
            .unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        while !received.windows(4).any(|w| w == b"OggS") {
            let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
                .await
                .expect("encoder output should arrive")
                .unwrap();
            assert!(read > 0, "relay closed the connection early");
            received.extend_from_slice(&buf[..read]);
        }
        let head = String::from_utf8_lossy(&received).to_ascii_lowercase();
        assert!(head.starts_with("http/1.1 200"));
        assert!(head.contains("content-type: audio/opus"));

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        let proc_entry = std::path::PathBuf::from(format!("/proc/{pid}"));
        assert!(proc_entry.exists());

        drop(client);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while proc_entry.exists() {
            assert!(
                std::time::Instant::now() < deadline,
                "encoder {pid} still running after the client left"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        handle.stop(false).await;
    }
}
