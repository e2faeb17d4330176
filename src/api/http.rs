//! HTTP API Server
//!
//! REST API for status queries, client proposals and cluster joins.

use std::sync::Arc;
use std::time::Duration;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::log::{LogIndex, Term};
use crate::raft::RaftHandle;
use crate::state::{NodeId, NodeRole};

/// How long `?wait=true` proposals wait for commit
const DEFAULT_COMMIT_WAIT: Duration = Duration::from_secs(5);

/// Shared application state
pub struct AppState {
    /// Node ID
    pub node_id: String,
    /// Running node
    pub handle: RaftHandle,
    /// Commit wait for proposals and joins that ask for it
    pub commit_wait: Duration,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, node_id: String, handle: RaftHandle) -> Self {
        let state = Arc::new(AppState {
            node_id,
            handle,
            commit_wait: DEFAULT_COMMIT_WAIT,
        });

        Self { config, state }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/status", get(handle_status))
            .route("/health", get(handle_health))
            .route("/propose", post(handle_propose))
            .route("/join", post(handle_join))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: tokio::net::TcpListener) -> Result<()> {
        tracing::info!("HTTP API listening on {}", listener.local_addr()?);

        axum::serve(listener, self.router())
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Options for write endpoints
#[derive(Debug, Default, Deserialize)]
pub struct WaitParams {
    /// Wait for the entry to commit before answering
    #[serde(default)]
    pub wait: bool,
}

/// Proposal/join acknowledgment
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendResponse {
    pub index: LogIndex,
    pub committed: bool,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub role: NodeRole,
    pub term: Term,
    pub leader: Option<NodeId>,
}

/// Where to send a redirected request
#[derive(Debug, Serialize, Deserialize)]
pub struct LeaderHint {
    pub id: NodeId,
    pub address: String,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    pub leader: Option<LeaderHint>,
}

/// Error wrapper rendered as JSON
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, leader) = match &self.0 {
            Error::NotLeader { leader_id, address } => (
                StatusCode::CONFLICT,
                "not_leader",
                Some(LeaderHint {
                    id: leader_id.clone(),
                    address: address.clone(),
                }),
            ),
            Error::InvalidDescriptor(_) => (StatusCode::BAD_REQUEST, "invalid_descriptor", None),
            Error::NoLeader => (StatusCode::SERVICE_UNAVAILABLE, "no_leader", None),
            Error::MembershipChangePending => {
                (StatusCode::SERVICE_UNAVAILABLE, "membership_change_pending", None)
            }
            Error::CommitTimeout(_) => (StatusCode::SERVICE_UNAVAILABLE, "commit_timeout", None),
            e if e.is_retryable() => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", None),
            Error::Durability(_) | Error::Halted(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "halted", None)
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal", None),
        };

        let body = ErrorResponse {
            error: self.0.to_string(),
            code: code.to_string(),
            leader,
        };
        (status, Json(body)).into_response()
    }
}

// ============ Handlers ============

async fn handle_status(
    State(state): State<Arc<AppState>>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let status = state.handle.status().await?;
    Ok(Json(status))
}

async fn handle_health(
    State(state): State<Arc<AppState>>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let status = state.handle.status().await?;
    let healthy = status.halted.is_none();
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    Ok((
        code,
        Json(HealthResponse {
            healthy,
            node_id: state.node_id.clone(),
            role: status.role,
            term: status.term,
            leader: status.leader,
        }),
    ))
}

async fn handle_propose(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WaitParams>,
    body: Bytes,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let index = state.handle.propose(body.to_vec()).await?;
    let committed = wait_if_asked(&state, index, params.wait).await?;
    Ok(Json(AppendResponse { index, committed }))
}

async fn handle_join(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WaitParams>,
    body: Bytes,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let index = state.handle.join(body.to_vec()).await?;
    let committed = wait_if_asked(&state, index, params.wait).await?;
    Ok(Json(AppendResponse { index, committed }))
}

async fn wait_if_asked(state: &AppState, index: LogIndex, wait: bool) -> Result<bool> {
    if wait {
        state.handle.wait_for_commit(index, state.commit_wait).await?;
        return Ok(true);
    }
    Ok(state.handle.commit_index() >= index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLog;
    use crate::network::NetworkClient;
    use crate::raft::{CoreConfig, NodeStatus, RaftCore, RaftNode, Scheduler, TimerConfig};
    use crate::state::{MemoryLedger, Membership, NodeDescriptor};

    async fn spawn_api(voters: &[&str]) -> String {
        let core = RaftCore::new(
            CoreConfig {
                id: "a".into(),
                address: "a:7654".into(),
                membership: Membership::new(
                    voters.iter().map(|id| NodeDescriptor::new(*id, format!("{}:7654", id))),
                ),
                max_batch_entries: 16,
            },
            Box::new(MemoryLog::new()),
            Box::new(MemoryLedger::new()),
        )
        .unwrap();
        let scheduler = Scheduler::new(TimerConfig {
            election_timeout_min_ms: 20,
            election_timeout_max_ms: 40,
            heartbeat_interval_ms: 10,
        });
        let transport = Arc::new(NetworkClient::new(
            Duration::from_millis(50),
            Duration::from_millis(100),
        ));
        let (handle, _task) = RaftNode::spawn(core, transport, scheduler);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let server = HttpServer::new(ApiConfig::default(), "a".into(), handle);
        tokio::spawn(async move { server.serve(listener).await });

        url
    }

    async fn wait_for_role(url: &str, role: NodeRole) -> NodeStatus {
        for _ in 0..100 {
            let status: NodeStatus = reqwest::get(format!("{}/status", url))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if status.role == role {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node never became {}", role);
    }

    #[tokio::test]
    async fn test_propose_and_join_on_single_node() {
        let url = spawn_api(&["a"]).await;
        wait_for_role(&url, NodeRole::Leader).await;
        let http = reqwest::Client::new();

        let health: HealthResponse = http
            .get(format!("{}/health", url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(health.healthy);
        assert_eq!(health.leader.as_deref(), Some("a"));

        let ack: AppendResponse = http
            .post(format!("{}/propose?wait=true", url))
            .body("set x 1")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(ack.index, 2);
        assert!(ack.committed);

        let ack: AppendResponse = http
            .post(format!("{}/join?wait=true", url))
            .body("b@127.0.0.1:1")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(ack.committed);

        let status = wait_for_role(&url, NodeRole::Leader).await;
        assert_eq!(status.voters.len(), 2);

        let response = http
            .post(format!("{}/join", url))
            .body("bad descriptor")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_proposal_without_leader_is_unavailable() {
        // Peers are unreachable so no election can succeed
        let url = spawn_api(&["a", "b", "c"]).await;
        let response = reqwest::Client::new()
            .post(format!("{}/propose", url))
            .body("x")
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        let body: ErrorResponse = response.json().await.unwrap();
        assert_eq!(body.code, "no_leader");
    }
}
