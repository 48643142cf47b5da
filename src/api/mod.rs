//! HTTP control surface.
//!
//! A thin axum router mapping operator commands onto node methods:
//! inspection (`/nodes`, `/journal`, `/dump`, `/get`, `/topology`),
//! command submission (`/request`), and fault simulation (`/kill`,
//! `/recover`, `/connect`, `/disconnect`).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::cluster::Cluster;
use crate::error::QuorumError;
use crate::raft::Node;

#[derive(Clone)]
pub struct ApiState {
    pub cluster: Arc<Cluster>,
}

type ApiError = (StatusCode, String);

#[derive(Serialize)]
pub struct NodeSummary {
    pub id: String,
    pub role: String,
    pub term: i64,
    pub journal_len: i64,
    pub alive: bool,
}

#[derive(Serialize)]
pub struct NodesResponse {
    pub nodes: Vec<NodeSummary>,
}

#[derive(Serialize)]
pub struct JournalResponse {
    pub id: String,
    pub log: Vec<String>,
}

#[derive(Serialize, Deserialize)]
pub struct CommandBody {
    pub key: String,
    pub value: Value,
}

#[derive(Deserialize)]
pub struct SubmitRequest {
    pub id: String,
    pub msg: CommandBody,
}

#[derive(Serialize)]
pub struct SubmitResponse {
    pub id: String,
    pub key: String,
    pub value: Value,
}

#[derive(Serialize)]
pub struct GetResponse {
    pub id: String,
    pub key: String,
    pub value: Value,
}

#[derive(Serialize)]
pub struct DumpResponse {
    pub id: String,
    pub dump: String,
}

#[derive(Serialize)]
pub struct TopologyPeer {
    pub node: String,
    pub connected: bool,
}

#[derive(Serialize)]
pub struct TopologyResponse {
    pub id: String,
    pub nodes: Vec<TopologyPeer>,
}

#[derive(Deserialize)]
struct NodeQuery {
    node: String,
}

#[derive(Deserialize)]
struct GetQuery {
    node: String,
    key: String,
}

#[derive(Deserialize)]
struct LinkQuery {
    node: String,
    with: String,
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| (StatusCode::BAD_REQUEST, "invalid node id".to_owned()))
}

fn lookup<'a>(cluster: &'a Cluster, raw: &str) -> Result<&'a Arc<Node>, ApiError> {
    let id = parse_id(raw)?;
    cluster
        .node(id)
        .ok_or((StatusCode::NOT_FOUND, "node not found".to_owned()))
}

pub fn router(cluster: Arc<Cluster>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/nodes", get(list_nodes))
        .route("/journal", get(journal))
        .route("/request", post(submit))
        .route("/get", get(get_key))
        .route("/dump", get(dump))
        .route("/kill", get(kill))
        .route("/recover", get(recover))
        .route("/connect", get(connect))
        .route("/disconnect", get(disconnect))
        .route("/topology", get(topology))
        .layer(cors)
        .with_state(ApiState { cluster })
}

/// Bind the control API and serve it until the token is cancelled.
/// A failed bind is returned to the caller and is fatal.
pub async fn serve(
    addr: SocketAddr,
    cluster: Arc<Cluster>,
    cancel: CancellationToken,
) -> Result<(), QuorumError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "control api listening");

    axum::serve(listener, router(cluster))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn list_nodes(State(state): State<ApiState>) -> Json<NodesResponse> {
    let mut nodes = Vec::with_capacity(state.cluster.len());
    for node in state.cluster.nodes() {
        nodes.push(NodeSummary {
            id: node.id().to_string(),
            role: node.role().await.to_string(),
            term: node.term().await,
            journal_len: node.journal_len().await,
            alive: node.alive(),
        });
    }
    Json(NodesResponse { nodes })
}

async fn journal(
    State(state): State<ApiState>,
    Query(query): Query<NodeQuery>,
) -> Result<Json<JournalResponse>, ApiError> {
    let node = lookup(&state.cluster, &query.node)?;
    Ok(Json(JournalResponse {
        id: node.id().to_string(),
        log: node.journal_lines().await,
    }))
}

async fn submit(
    State(state): State<ApiState>,
    Json(body): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let node = lookup(&state.cluster, &body.id)?;
    let command = json!({"key": body.msg.key, "value": body.msg.value});
    node.request(command).await;

    Ok(Json(SubmitResponse {
        id: node.id().to_string(),
        key: body.msg.key,
        value: body.msg.value,
    }))
}

async fn get_key(
    State(state): State<ApiState>,
    Query(query): Query<GetQuery>,
) -> Result<Json<GetResponse>, ApiError> {
    let node = lookup(&state.cluster, &query.node)?;
    let value = node
        .get_key(&query.key)
        .await
        .ok_or((StatusCode::NOT_FOUND, "key not found".to_owned()))?;

    Ok(Json(GetResponse {
        id: node.id().to_string(),
        key: query.key,
        value,
    }))
}

async fn dump(
    State(state): State<ApiState>,
    Query(query): Query<NodeQuery>,
) -> Result<Json<DumpResponse>, ApiError> {
    let node = lookup(&state.cluster, &query.node)?;
    let map = node.dump().await;
    let dump = serde_json::to_string(&map)
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    Ok(Json(DumpResponse {
        id: node.id().to_string(),
        dump,
    }))
}

async fn kill(
    State(state): State<ApiState>,
    Query(query): Query<NodeQuery>,
) -> Result<StatusCode, ApiError> {
    let node = lookup(&state.cluster, &query.node)?;
    node.kill().await;
    Ok(StatusCode::OK)
}

async fn recover(
    State(state): State<ApiState>,
    Query(query): Query<NodeQuery>,
) -> Result<StatusCode, ApiError> {
    let node = lookup(&state.cluster, &query.node)?;
    node.recover();
    Ok(StatusCode::OK)
}

async fn connect(
    State(state): State<ApiState>,
    Query(query): Query<LinkQuery>,
) -> Result<Json<bool>, ApiError> {
    let node = lookup(&state.cluster, &query.node)?;
    let with = parse_id(&query.with)?;
    Ok(Json(node.connect(with).await))
}

async fn disconnect(
    State(state): State<ApiState>,
    Query(query): Query<LinkQuery>,
) -> Result<Json<bool>, ApiError> {
    let node = lookup(&state.cluster, &query.node)?;
    let with = parse_id(&query.with)?;
    Ok(Json(node.disconnect(with).await))
}

async fn topology(
    State(state): State<ApiState>,
    Query(query): Query<NodeQuery>,
) -> Result<Json<TopologyResponse>, ApiError> {
    let node = lookup(&state.cluster, &query.node)?;
    let nodes = node
        .topology()
        .await
        .into_iter()
        .map(|(id, connected)| TopologyPeer {
            node: id.to_string(),
            connected,
        })
        .collect();

    Ok(Json(TopologyResponse {
        id: node.id().to_string(),
        nodes,
    }))
}
