//! Status endpoint

use std::sync::atomic::Ordering;

use actix_web::{web, HttpResponse, Responder};

use crate::manager::AppState;

/// Version from Cargo.toml, available at compile time
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/status").route(web::get().to(get_status)));
}

async fn get_status(state: web::Data<AppState>) -> impl Responder {
    let manager = &state.manager;
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "version": VERSION,
        "inflight": manager.inflight_count.load(Ordering::Relaxed),
        "streams": manager.streams.len(),
        "connector_live": manager.connector.is_live().await,
    }))
}
