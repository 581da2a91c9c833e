//! Transaction API endpoints

use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, Responder};
use serde::Deserialize;

use crate::manager::transaction_management::TransactionRequest;
use crate::manager::AppState;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/transactions")
            .route("", web::post().to(submit_transaction))
            .route("", web::get().to(list_transactions))
            .route("/{id}", web::get().to(get_transaction))
            .route("/{id}", web::delete().to(delete_transaction)),
    );
}

/// Query parameters for listing transactions
#[derive(Debug, Deserialize)]
pub struct ListParams {
    after: Option<String>,
    limit: Option<usize>,
    signer: Option<String>,
    #[serde(default)]
    pending: bool,
    direction: Option<String>,
}

async fn submit_transaction(
    state: web::Data<AppState>,
    body: web::Json<TransactionRequest>,
) -> impl Responder {
    match state.manager.submit_transaction(body.into_inner()).await {
        Ok(tx) => HttpResponse::Created().json(tx),
        Err(e) => {
            log::warn!("[API] Transaction submission rejected: {}", e);
            e.to_response()
        }
    }
}

async fn list_transactions(
    state: web::Data<AppState>,
    query: web::Query<ListParams>,
) -> impl Responder {
    match state.manager.get_transactions(
        query.after.as_deref(),
        query.limit,
        query.signer.as_deref(),
        query.pending,
        query.direction.as_deref(),
    ) {
        Ok(txs) => HttpResponse::Ok().json(txs),
        Err(e) => e.to_response(),
    }
}

async fn get_transaction(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    match state.manager.get_transaction(&path.into_inner()) {
        Ok(tx) => HttpResponse::Ok().json(tx),
        Err(e) => e.to_response(),
    }
}

async fn delete_transaction(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    match state.manager.delete_transaction(&path.into_inner()).await {
        Ok((status, tx)) => {
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            HttpResponse::build(status).json(tx)
        }
        Err(e) => e.to_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use actix_web::{test, web, App};
    use serde_json::{json, Value};

    use crate::config::Config;
    use crate::manager::{AppState, Manager};
    use crate::policy::PolicyEngineRegistry;
    use crate::testutil::{test_config, MockConnector};

    fn test_state(config: Config) -> (Manager, web::Data<AppState>) {
        let connector = Arc::new(MockConnector::new());
        let registry = PolicyEngineRegistry::with_defaults();
        let manager = Manager::new(config, connector, &registry).unwrap();
        let state = web::Data::new(AppState {
            manager: manager.inner.clone(),
        });
        (manager, state)
    }

    macro_rules! test_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data($state.clone())
                    .configure(super::config),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_submit_and_fetch() {
        let (_manager, state) = test_state(test_config());
        let app = test_app!(state);

        let req = test::TestRequest::post()
            .uri("/transactions")
            .set_json(json!({"signer": "0xaaa", "transaction_data": "0xaa"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 201);
        let tx: Value = test::read_body_json(resp).await;
        let id = tx["id"].as_str().unwrap().to_string();
        assert_eq!(tx["status"], "pending");

        let req = test::TestRequest::get()
            .uri(&format!("/transactions/{}", id))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);

        let req = test::TestRequest::get()
            .uri("/transactions/no-such-id")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 404);
    }

    #[actix_web::test]
    async fn test_submit_validation() {
        let (_manager, state) = test_state(test_config());
        let app = test_app!(state);

        let req = test::TestRequest::post()
            .uri("/transactions")
            .set_json(json!({"signer": "", "transaction_data": "0xaa"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);

        // duplicate caller-chosen id
        let body = json!({"id": "fixed-id", "signer": "0xaaa", "transaction_data": "0xaa"});
        let req = test::TestRequest::post()
            .uri("/transactions")
            .set_json(&body)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 201);
        let req = test::TestRequest::post()
            .uri("/transactions")
            .set_json(&body)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 409);
    }

    #[actix_web::test]
    async fn test_list_query_validation() {
        let (_manager, state) = test_state(test_config());
        let app = test_app!(state);

        let req = test::TestRequest::get()
            .uri("/transactions?signer=0xaaa&pending=true")
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 400);

        let req = test::TestRequest::get()
            .uri("/transactions?limit=0")
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 400);

        let req = test::TestRequest::get()
            .uri("/transactions?direction=sideways")
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 400);

        let req = test::TestRequest::get()
            .uri("/transactions?after=missing-cursor")
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 404);
    }

    #[actix_web::test]
    async fn test_pending_list_pagination() {
        let (_manager, state) = test_state(test_config());
        let app = test_app!(state);

        let mut ids = Vec::new();
        for i in 0..5 {
            let req = test::TestRequest::post()
                .uri("/transactions")
                .set_json(json!({
                    "signer": format!("0xsigner{}", i),
                    "transaction_data": "0xaa"
                }))
                .to_request();
            let tx: Value = test::read_body_json(test::call_service(&app, req).await).await;
            ids.push(tx["id"].as_str().unwrap().to_string());
        }

        let req = test::TestRequest::get()
            .uri("/transactions?pending=true&limit=2&direction=asc")
            .to_request();
        let page: Value = test::read_body_json(test::call_service(&app, req).await).await;
        let got: Vec<&str> = page
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["id"].as_str().unwrap())
            .collect();
        assert_eq!(got, vec![ids[0].as_str(), ids[1].as_str()]);

        let req = test::TestRequest::get()
            .uri(&format!(
                "/transactions?pending=true&limit=2&direction=asc&after={}",
                ids[1]
            ))
            .to_request();
        let page: Value = test::read_body_json(test::call_service(&app, req).await).await;
        let got: Vec<&str> = page
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["id"].as_str().unwrap())
            .collect();
        assert_eq!(got, vec![ids[2].as_str(), ids[3].as_str()]);
    }

    #[actix_web::test]
    async fn test_list_by_signer_uses_nonce_cursor() {
        let (_manager, state) = test_state(test_config());
        let app = test_app!(state);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let req = test::TestRequest::post()
                .uri("/transactions")
                .set_json(json!({"signer": "0xaaa", "transaction_data": "0xaa"}))
                .to_request();
            let tx: Value = test::read_body_json(test::call_service(&app, req).await).await;
            ids.push(tx["id"].as_str().unwrap().to_string());
        }

        let req = test::TestRequest::get()
            .uri(&format!(
                "/transactions?signer=0xaaa&direction=asc&limit=10&after={}",
                ids[0]
            ))
            .to_request();
        let page: Value = test::read_body_json(test::call_service(&app, req).await).await;
        let nonces: Vec<u64> = page
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["nonce"].as_u64().unwrap())
            .collect();
        assert_eq!(nonces, vec![1, 2]);
    }
}
