//! HTTP front door and server lifecycle.
//!
//! A plain hyper listener fields every request: WebSocket upgrade requests
//! are authenticated and handed to the connection loop, `/healthz` answers
//! liveness probes, and everything else is a 404. Authentication happens
//! before the upgrade so a rejected client gets a clean HTTP 401 instead of
//! a severed socket.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::auth::{AuthError, Claims, TokenVerifier};
use crate::config::ServerConfig;
use crate::connection::run_connection;
use crate::registry::Registry;
use crate::storage::{RocksStore, SnapshotStore, StoreConfig, StoreError};

/// Server startup errors.
#[derive(Debug)]
pub enum ServerError {
    Io(std::io::Error),
    Auth(AuthError),
    Storage(StoreError),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Auth(e) => write!(f, "auth error: {e}"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Aggregate counters, readable at any time.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub auth_failures: AtomicU64,
    pub frames_received: AtomicU64,
}

impl ServerStats {
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.connections_total.load(Ordering::Relaxed),
            self.connections_active.load(Ordering::Relaxed),
            self.auth_failures.load(Ordering::Relaxed),
            self.frames_received.load(Ordering::Relaxed),
        )
    }
}

struct ServerInner {
    registry: Arc<Registry>,
    verifier: TokenVerifier,
    stats: Arc<ServerStats>,
}

/// The collaborative sync server.
pub struct SyncServer {
    config: ServerConfig,
    inner: Arc<ServerInner>,
}

impl SyncServer {
    /// Build a server from configuration, opening storage when configured.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Option<Arc<dyn SnapshotStore>> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                let store = RocksStore::open(store_config).map_err(ServerError::Storage)?;
                info!("storage opened at {}", path.display());
                Some(Arc::new(store))
            }
            None => {
                info!("no storage path configured, documents are volatile");
                None
            }
        };
        Self::with_store(config, store)
    }

    /// Build a server over an externally supplied store.
    pub fn with_store(
        config: ServerConfig,
        store: Option<Arc<dyn SnapshotStore>>,
    ) -> Result<Self, ServerError> {
        let verifier = TokenVerifier::new(&config.auth_secret).map_err(ServerError::Auth)?;
        let registry = Arc::new(Registry::new(
            store,
            config.broadcast_capacity,
            config.idle_evict,
        ));

        Ok(Self {
            config,
            inner: Arc::new(ServerInner {
                registry,
                verifier,
                stats: Arc::new(ServerStats::default()),
            }),
        })
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.inner.stats)
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.inner.registry)
    }

    /// Bind and serve until the process is stopped.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve on an already-bound listener. Tests bind port 0 and call this.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let inner = Arc::clone(&inner);
                    async move { handle_request(req, inner).await }
                });
                let conn = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades();
                if let Err(e) = conn.await {
                    debug!("connection from {peer} ended: {e}");
                }
            });
        }
    }
}

async fn handle_request(
    mut req: Request<Incoming>,
    inner: Arc<ServerInner>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if hyper_tungstenite::is_upgrade_request(&req) {
        return Ok(handle_upgrade(&mut req, inner));
    }

    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") | (&Method::GET, "/health") => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from_static(b"ok"))),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new())),
    };
    Ok(response.unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}

fn handle_upgrade(req: &mut Request<Incoming>, inner: Arc<ServerInner>) -> Response<Full<Bytes>> {
    let Some(doc_name) = doc_name_from_path(req.uri().path()) else {
        return empty_response(StatusCode::BAD_REQUEST);
    };

    let claims = match token_from_query(req.uri().query())
        .ok_or_else(|| AuthError::InvalidToken("missing token".to_string()))
        .and_then(|token| inner.verifier.verify(&token))
    {
        Ok(claims) => claims,
        Err(e) => {
            inner.stats.auth_failures.fetch_add(1, Ordering::Relaxed);
            warn!("rejected connection to '{}': {}", doc_name, e);
            return empty_response(StatusCode::UNAUTHORIZED);
        }
    };

    match hyper_tungstenite::upgrade(req, None) {
        Ok((response, websocket)) => {
            tokio::spawn(accept_connection(websocket, doc_name, claims, inner));
            response
        }
        Err(e) => {
            warn!("upgrade failed: {e}");
            empty_response(StatusCode::BAD_REQUEST)
        }
    }
}

async fn accept_connection(
    websocket: hyper_tungstenite::HyperWebsocket,
    doc_name: String,
    claims: Claims,
    inner: Arc<ServerInner>,
) {
    let ws = match websocket.await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("websocket handshake failed for '{}': {}", doc_name, e);
            return;
        }
    };

    let conn_id = Uuid::new_v4();
    inner.stats.connections_total.fetch_add(1, Ordering::Relaxed);
    inner.stats.connections_active.fetch_add(1, Ordering::Relaxed);
    info!("conn {}: '{}' opened for '{}'", conn_id, claims.sub, doc_name);

    let session = inner.registry.get_or_create(&doc_name, conn_id).await;
    if let Err(e) = run_connection(
        ws,
        session,
        Arc::clone(&inner.registry),
        Arc::clone(&inner.stats),
        conn_id,
    )
    .await
    {
        error!("conn {conn_id}: ended with error: {e}");
    }

    inner.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
    info!("conn {conn_id}: closed");
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

/// Document name from the request path.
///
/// Some clients append the document name twice (`/notes/notes`); the
/// duplicate collapses to a single name. An empty path is rejected.
fn doc_name_from_path(path: &str) -> Option<String> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        [] => None,
        [one] => Some((*one).to_string()),
        [first, second] if first == second => Some((*first).to_string()),
        many => Some(many.join("/")),
    }
}

fn token_from_query(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_name_single_segment() {
        assert_eq!(doc_name_from_path("/notes"), Some("notes".to_string()));
        assert_eq!(doc_name_from_path("/notes/"), Some("notes".to_string()));
    }

    #[test]
    fn test_doc_name_duplicate_collapses() {
        assert_eq!(doc_name_from_path("/notes/notes"), Some("notes".to_string()));
    }

    #[test]
    fn test_doc_name_nested_path_preserved() {
        assert_eq!(
            doc_name_from_path("/team/notes"),
            Some("team/notes".to_string())
        );
    }

    #[test]
    fn test_doc_name_empty_rejected() {
        assert_eq!(doc_name_from_path("/"), None);
        assert_eq!(doc_name_from_path(""), None);
    }

    #[test]
    fn test_token_extraction() {
        assert_eq!(token_from_query(Some("token=abc")), Some("abc".to_string()));
        assert_eq!(
            token_from_query(Some("a=1&token=abc&b=2")),
            Some("abc".to_string())
        );
        assert_eq!(token_from_query(Some("token=")), None);
        assert_eq!(token_from_query(Some("other=1")), None);
        assert_eq!(token_from_query(None), None);
    }
}
