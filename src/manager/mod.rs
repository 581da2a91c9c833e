//! The transaction manager
//!
//! Owns the in-flight pipeline: admission, the policy loop, confirmation
//! tracking, event fan-out, and the HTTP/WebSocket surface. One connector is
//! injected at construction; the manager holds a non-owning reference to it
//! and owns everything else.

pub mod policy_loop;
pub mod streams;
pub mod transaction_management;


use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::dev::ServerHandle;
use actix_web::{middleware, web, App, HttpServer};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::confirmations::ConfirmationManager;
use crate::connector::{ConnectorApi, NewBlockListenerRequest};
use crate::controllers;
use crate::errors::{ApiError, StartupError};
use crate::events::{websocket, StreamHandle};
use crate::models::{BlockInfo, ManagedTransaction};
use crate::nonces::NonceAllocator;
use crate::persistence::{Database, Persistence};
use crate::policy::{PolicyEngine, PolicyEngineRegistry};

/// Control requests queued to the policy loop. Replies carry the HTTP status
/// to return: 200 when the mutation applied synchronously, 202 when the loop
/// deferred it to its reap step.
pub(crate) enum PolicyApiRequest {
    Delete {
        tx_id: String,
        reply: oneshot::Sender<Result<(u16, ManagedTransaction), ApiError>>,
    },
}

/// Shared state handed to the HTTP layer
pub struct AppState {
    pub(crate) manager: Arc<ManagerInner>,
}

pub struct ManagerInner {
    pub(crate) config: Config,
    pub(crate) connector: Arc<dyn ConnectorApi>,
    pub(crate) persistence: Arc<dyn Persistence>,
    pub(crate) policy_engine: Arc<dyn PolicyEngine>,
    pub(crate) confirmations: ConfirmationManager,
    pub(crate) nonces: NonceAllocator,
    pub(crate) cancel: CancellationToken,
    /// Coalescing wake signals for the policy loop
    pub(crate) inflight_stale: Notify,
    pub(crate) inflight_update: Notify,
    pub(crate) api_requests: Mutex<Vec<PolicyApiRequest>>,
    /// Running fan-out workers, by stream id
    pub(crate) streams: DashMap<String, StreamHandle>,
    /// The bounded buffer the connector writes new blocks into
    pub(crate) block_tx: mpsc::Sender<BlockInfo>,
    pub(crate) inflight_count: AtomicUsize,
}

impl ManagerInner {
    pub(crate) fn mark_inflight_stale(&self) {
        self.inflight_stale.notify_one();
    }

    pub(crate) fn mark_inflight_update(&self) {
        self.inflight_update.notify_one();
    }
}

pub struct Manager {
    pub(crate) inner: Arc<ManagerInner>,
    server: Mutex<Option<ServerHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Manager {
    pub fn new(
        config: Config,
        connector: Arc<dyn ConnectorApi>,
        registry: &PolicyEngineRegistry,
    ) -> Result<Self, StartupError> {
        let persistence: Arc<dyn Persistence> = match config.persistence_type.as_str() {
            "sqlite" => {
                if config.persistence_path == ":memory:" {
                    Arc::new(Database::open_in_memory()?)
                } else {
                    if let Some(parent) = Path::new(&config.persistence_path).parent() {
                        if !parent.as_os_str().is_empty() {
                            std::fs::create_dir_all(parent)?;
                        }
                    }
                    Arc::new(Database::new(&config.persistence_path)?)
                }
            }
            other => return Err(StartupError::UnknownPersistence(other.to_string())),
        };

        let policy_engine =
            registry.build(&config.policy_engine, &config.policy_engine_config)?;

        let cancel = CancellationToken::new();
        let (confirmations, block_tx, confirmations_task) = ConfirmationManager::start(
            connector.clone(),
            config.confirmations_required,
            cancel.child_token(),
        );
        let nonces = NonceAllocator::new(config.nonce_state_timeout);

        let inner = Arc::new(ManagerInner {
            config,
            connector,
            persistence,
            policy_engine,
            confirmations,
            nonces,
            cancel,
            inflight_stale: Notify::new(),
            inflight_update: Notify::new(),
            api_requests: Mutex::new(Vec::new()),
            streams: DashMap::new(),
            block_tx,
            inflight_count: AtomicUsize::new(0),
        });

        Ok(Self {
            inner,
            server: Mutex::new(None),
            tasks: Mutex::new(vec![confirmations_task]),
            started: AtomicBool::new(false),
        })
    }

    /// Restore event streams, register the block listener, and start the
    /// policy loop and API server.
    pub async fn start(&self) -> Result<(), StartupError> {
        self.start_core().await?;
        self.start_api_server()?;
        self.started.store(true, Ordering::SeqCst);
        log::info!(
            "[MANAGER] Started on {}:{}",
            self.inner.config.api_address,
            self.inner.config.api_port
        );
        Ok(())
    }

    /// Everything except the HTTP server; used directly by pipeline tests
    pub(crate) async fn start_core(&self) -> Result<(), StartupError> {
        self.inner.restore_streams()?;

        let resp = self
            .inner
            .connector
            .new_block_listener(NewBlockListenerRequest {
                listener: self.inner.block_tx.clone(),
            })
            .await
            .map_err(StartupError::BlockListener)?;
        log::info!("[MANAGER] Block listener registered from block {}", resp.initial_block);

        self.inner.mark_inflight_stale();
        let inner = self.inner.clone();
        self.tasks.lock().push(tokio::spawn(policy_loop::run(inner)));
        Ok(())
    }

    fn start_api_server(&self) -> Result<(), StartupError> {
        let inner = self.inner.clone();
        let server = HttpServer::new(move || {
            let cors = if inner.config.cors_enabled {
                Cors::default()
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header()
                    .max_age(3600)
            } else {
                Cors::default()
            };
            App::new()
                .app_data(web::Data::new(AppState {
                    manager: inner.clone(),
                }))
                .wrap(middleware::Logger::default())
                .wrap(cors)
                .configure(controllers::transactions::config)
                .configure(controllers::eventstreams::config)
                .configure(controllers::health::config)
                .route("/ws", web::get().to(websocket::ws_handler))
        })
        .bind((self.inner.config.api_address.as_str(), self.inner.config.api_port))?
        .run();

        *self.server.lock() = Some(server.handle());
        self.tasks.lock().push(tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("[API] Server error: {}", e);
            }
        }));
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Ordered shutdown: cancel the root context, wait for the API server,
    /// policy loop and tracker, stop every stream worker, close persistence.
    pub async fn close(&self) {
        log::info!("[MANAGER] Shutting down");
        self.inner.cancel.cancel();

        let server = self.server.lock().take();
        if let Some(handle) = server {
            handle.stop(true).await;
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        let ids: Vec<String> = self.inner.streams.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, handle)) = self.inner.streams.remove(&id) {
                handle.cancel.cancel();
                let _ = handle.task.await;
            }
        }

        self.inner.persistence.close();
        self.started.store(false, Ordering::SeqCst);
        log::info!("[MANAGER] Shutdown complete");
    }
}
