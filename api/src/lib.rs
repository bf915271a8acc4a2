// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The unprivileged HTTP/WebSocket façade.
//!
//! Every operation is a translation onto the supervisor RPC; this process
//! never touches kernel or store state directly. Authentication (session
//! cookie or API key) and CSRF live here, and repeated login failures from
//! one address raise the fail2ban signal toward the supervisor.

pub mod auth;
pub mod routes;
pub mod ws;

pub use auth::{AuthState, FailTracker};

use mgmt::RpcClient;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("rpc: {0}")]
    Rpc(#[from] mgmt::RpcError),
    #[error("listen: {0}")]
    Io(#[from] std::io::Error),
}

pub struct ApiState {
    pub socket_path: PathBuf,
    pub auth: AuthState,
}

impl ApiState {
    /// One RPC call on a fresh connection; the unix socket makes this
    /// cheap and keeps the API free of connection state.
    pub async fn rpc(&self, method: &str, params: Value) -> Result<Value, mgmt::RpcError> {
        let mut client = RpcClient::connect(&self.socket_path).await?;
        client.call(method, params).await
    }
}

pub struct ApiServer {
    state: Arc<ApiState>,
    listen: SocketAddr,
}

impl ApiServer {
    #[must_use]
    pub fn new(socket_path: PathBuf, listen: SocketAddr, session_secret: Option<&str>, api_keys: Vec<String>) -> ApiServer {
        ApiServer {
            state: Arc::new(ApiState {
                socket_path,
                auth: AuthState::new(session_secret, api_keys),
            }),
            listen,
        }
    }

    #[must_use]
    pub fn state(&self) -> Arc<ApiState> {
        Arc::clone(&self.state)
    }

    /// Serve until shutdown flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ApiError> {
        let router = routes::router(Arc::clone(&self.state));
        let listener = tokio::net::TcpListener::bind(self.listen).await?;
        info!(listen = %self.listen, "api listening");
        let service =
            router.into_make_service_with_connect_info::<SocketAddr>();
        tokio::select! {
            result = axum::serve(listener, service) => {
                if let Err(error) = result {
                    warn!(%error, "api server exited");
                }
            }
            _ = shutdown.changed() => {}
        }
        Ok(())
    }
}
