use actix_web::{HttpResponse, Resource, web};

/// Liveness probe; answers 200 with an empty body regardless of stream load.
pub async fn healthcheck() -> HttpResponse {
    tracing::debug!("healthcheck probed");
    HttpResponse::Ok().finish()
}

pub fn healthcheck_resource() -> Resource {
    web::resource(["/healthcheck", "/healthcheck/"]).to(healthcheck)
}
