//! Event stream management endpoints

use actix_web::{web, HttpResponse, Responder};
use serde::Deserialize;

use crate::manager::AppState;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/eventstreams")
            .route("", web::post().to(create_stream))
            .route("", web::get().to(list_streams))
            .route("/{id}", web::get().to(get_stream))
            .route("/{id}", web::patch().to(update_stream))
            .route("/{id}", web::delete().to(delete_stream))
            .route("/{id}/listeners", web::post().to(create_listener))
            .route("/{id}/listeners", web::get().to(list_listeners))
            .route("/{id}/listeners/{lid}", web::delete().to(delete_listener)),
    );
}

#[derive(Debug, Deserialize)]
pub struct CreateStreamRequest {
    pub name: String,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub batch_timeout_ms: Option<u64>,
}

/// PATCH body; absent fields are untouched. `filter` uses a nested Option so
/// an explicit `"filter": null` clears it.
#[derive(Debug, Deserialize)]
pub struct UpdateStreamRequest {
    #[serde(default, with = "serde_double_option")]
    pub filter: Option<Option<String>>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub batch_timeout_ms: Option<u64>,
    #[serde(default)]
    pub suspended: Option<bool>,
}

/// Distinguish "field absent" from "field null" in PATCH bodies
mod serde_double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(de).map(Some)
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateListenerRequest {
    #[serde(default)]
    pub filter: Option<String>,
}

async fn create_stream(
    state: web::Data<AppState>,
    body: web::Json<CreateStreamRequest>,
) -> impl Responder {
    let body = body.into_inner();
    match state
        .manager
        .create_stream(body.name, body.filter, body.batch_size, body.batch_timeout_ms)
    {
        Ok(spec) => HttpResponse::Created().json(spec),
        Err(e) => e.to_response(),
    }
}

async fn list_streams(state: web::Data<AppState>) -> impl Responder {
    match state.manager.list_streams() {
        Ok(specs) => HttpResponse::Ok().json(specs),
        Err(e) => e.to_response(),
    }
}

async fn get_stream(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    match state.manager.get_stream(&path.into_inner()) {
        Ok(spec) => HttpResponse::Ok().json(spec),
        Err(e) => e.to_response(),
    }
}

async fn update_stream(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<UpdateStreamRequest>,
) -> impl Responder {
    let body = body.into_inner();
    match state
        .manager
        .update_stream(
            &path.into_inner(),
            body.filter,
            body.batch_size,
            body.batch_timeout_ms,
            body.suspended,
        )
        .await
    {
        Ok(spec) => HttpResponse::Ok().json(spec),
        Err(e) => e.to_response(),
    }
}

async fn delete_stream(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    match state.manager.delete_stream(&path.into_inner()).await {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(e) => e.to_response(),
    }
}

async fn create_listener(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<CreateListenerRequest>,
) -> impl Responder {
    match state
        .manager
        .create_listener(&path.into_inner(), body.into_inner().filter)
    {
        Ok(listener) => HttpResponse::Created().json(listener),
        Err(e) => e.to_response(),
    }
}

async fn list_listeners(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    match state.manager.list_listeners(&path.into_inner()) {
        Ok(listeners) => HttpResponse::Ok().json(listeners),
        Err(e) => e.to_response(),
    }
}

async fn delete_listener(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> impl Responder {
    let (stream_id, listener_id) = path.into_inner();
    match state.manager.delete_listener(&stream_id, &listener_id) {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(e) => e.to_response(),
    }
}
