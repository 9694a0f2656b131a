pub mod handshake;
pub mod messages;
pub mod wsroute;

use crate::metrics::metrics_handler;
use crate::state::AppState;
use actix_web::{get, web, HttpResponse};
use serde_json::json;

#[get("/health")]
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "fanout_mode": state.config.fanout_mode.as_str(),
        "sessions": state.registry.session_count().await,
    }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(handshake::handshake)
        .service(messages::send_message)
        .service(messages::get_message)
        .service(wsroute::ws_handler)
        .route("/metrics", web::get().to(metrics_handler));
}
