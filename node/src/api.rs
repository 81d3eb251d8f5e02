//! # HTTP Gateway
//!
//! Builds the axum routers for a Strata node. The chain surface (status,
//! blocks, membership, consensus messages) is generic over the entry
//! type and shared by both tiers; the lower tier adds ingest, search,
//! and proofs, the upper tier adds anchor admission and the verified
//! query route.
//!
//! Handlers are thin translations: decode, call the node method, map the
//! typed error onto a status code. No protocol logic lives here.
//!
//! ## Error mapping
//!
//! | Error class                                   | Status |
//! |-----------------------------------------------|--------|
//! | malformed/missing parameters                  | 400    |
//! | chain-id mismatch, invalid signature          | 403    |
//! | unknown block/provider/record                 | 404    |
//! | duplicate or non-consecutive block            | 409    |
//! | wrong consensus mode, nothing to finalize     | 412    |
//! | peer/boot unreachable                         | 502    |
//! | store or internal failure                     | 500    |

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use strata_protocol::anchor::{search_records, record_proof, AnchorError, AnchorSubmission};
use strata_protocol::consensus::{BftStart, BftVote, BlockAnnouncement, MineStartRequest};
use strata_protocol::ledger::LedgerError;
use strata_protocol::node::{
    AddPeerRequest, BlocksPage, BootNotify, ConsensusMode, LowerNode, Node, NodeError,
    ProviderBootNotify, RegisterRequest, UpperNode,
};
use strata_protocol::record::{Entry, ProviderRecord};
use strata_protocol::config::DEFAULT_BLOCKS_LIMIT;

// ---------------------------------------------------------------------------
// Error translation
// ---------------------------------------------------------------------------

/// A request-level failure carrying its HTTP status.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<NodeError> for ApiError {
    fn from(err: NodeError) -> Self {
        let status = match &err {
            NodeError::ChainIdMismatch => StatusCode::FORBIDDEN,
            NodeError::WrongMode => StatusCode::PRECONDITION_FAILED,
            NodeError::BootUnreachable(_) | NodeError::Net(_) => StatusCode::BAD_GATEWAY,
            NodeError::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
            NodeError::Crypto(_) => StatusCode::FORBIDDEN,
            NodeError::Ledger(ledger) => match ledger {
                LedgerError::DuplicateIndex { .. } | LedgerError::NonConsecutive { .. } => {
                    StatusCode::CONFLICT
                }
                LedgerError::MissingPrev { .. } => StatusCode::CONFLICT,
                LedgerError::EmptyChain => StatusCode::SERVICE_UNAVAILABLE,
                LedgerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::BAD_REQUEST,
            },
            NodeError::Anchor(anchor) => match anchor {
                AnchorError::InvalidSignature(_)
                | AnchorError::StaleTimestamp(_)
                | AnchorError::BadTimestamp(_) => StatusCode::FORBIDDEN,
                AnchorError::UnknownProvider(_) | AnchorError::NotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                AnchorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                AnchorError::Crypto(_) => StatusCode::FORBIDDEN,
            },
        };
        Self::new(status, err.to_string())
    }
}

impl From<AnchorError> for ApiError {
    fn from(err: AnchorError) -> Self {
        ApiError::from(NodeError::Anchor(err))
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError::from(NodeError::Ledger(err))
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Router construction
// ---------------------------------------------------------------------------

fn with_layers(router: Router) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    router.layer(cors).layer(TraceLayer::new_for_http())
}

/// The chain surface shared by both tiers.
pub fn chain_router<E: Entry>(node: Arc<Node<E>>) -> Router {
    Router::new()
        .route("/status", get(status::<E>))
        .route("/peers", get(peers::<E>))
        .route("/register", post(register::<E>))
        .route("/addPeer", post(add_peer::<E>))
        .route("/bootNotify", post(boot_notify::<E>))
        .route("/blocks", get(blocks::<E>))
        .route("/block/index", get(block_by_index::<E>))
        .route("/block/hash", get(block_by_hash::<E>))
        .route("/block/root", get(block_root::<E>))
        .route("/getPublicKey", get(public_key::<E>))
        .route("/mine/start", post(mine_start::<E>))
        .route("/receiveBlock", post(receive_block::<E>))
        .route("/bft/start", post(bft_start::<E>))
        .route("/bft/prepare", post(bft_prepare::<E>))
        .route("/bft/commit", post(bft_commit::<E>))
        .with_state(node)
}

/// Full router for a lower-tier (provider) node.
pub fn lower_router(lower: Arc<LowerNode>) -> Router {
    let tier = Router::new()
        .route("/record/add", post(record_add))
        .route("/search", get(search))
        .route("/proof", get(proof))
        .route("/upperBootNotify", post(upper_boot_notify))
        .with_state(lower.clone());
    with_layers(chain_router(lower.node.clone()).merge(tier))
}

/// Full router for an upper-tier (registry) node.
pub fn upper_router(upper: Arc<UpperNode>) -> Router {
    let tier = Router::new()
        .route("/addAnchor", post(add_anchor))
        .route("/query", get(query))
        .route("/providerBootNotify", post(provider_boot_notify))
        .with_state(upper.clone());
    with_layers(chain_router(upper.node.clone()).merge(tier))
}

// ---------------------------------------------------------------------------
// Shared chain handlers
// ---------------------------------------------------------------------------

async fn status<E: Entry>(State(node): State<Arc<Node<E>>>) -> impl IntoResponse {
    Json(node.status())
}

async fn peers<E: Entry>(State(node): State<Arc<Node<E>>>) -> impl IntoResponse {
    // Empty set serializes as `[]`, never `null`.
    Json(node.peers.snapshot())
}

async fn register<E: Entry>(
    State(node): State<Arc<Node<E>>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.addr.is_empty() {
        return Err(ApiError::bad_request("addr required"));
    }
    Ok(Json(node.handle_register(&req)?))
}

async fn add_peer<E: Entry>(
    State(node): State<Arc<Node<E>>>,
    Json(req): Json<AddPeerRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.addr.is_empty() {
        return Err(ApiError::bad_request("addr required"));
    }
    node.handle_add_peer(&req);
    Ok(Json(json!({ "ok": true })))
}

async fn boot_notify<E: Entry>(
    State(node): State<Arc<Node<E>>>,
    Json(req): Json<BootNotify>,
) -> ApiResult<impl IntoResponse> {
    if req.addr.is_empty() {
        return Err(ApiError::bad_request("addr required"));
    }
    node.handle_boot_notify(&req.addr).await?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct BlocksQuery {
    offset: Option<u64>,
    limit: Option<u64>,
}

async fn blocks<E: Entry>(
    State(node): State<Arc<Node<E>>>,
    Query(params): Query<BlocksQuery>,
) -> ApiResult<impl IntoResponse> {
    let offset = params.offset.unwrap_or(0);
    let limit = match params.limit {
        Some(0) | None => DEFAULT_BLOCKS_LIMIT,
        Some(l) => l,
    };
    let (items, total) = node
        .ledger
        .store()
        .list_blocks::<E>(offset, limit)
        .map_err(LedgerError::from)?;
    Ok(Json(BlocksPage {
        total,
        offset,
        limit,
        items,
        difficulty: (node.mode == ConsensusMode::Pow).then(|| node.difficulty.current()),
    }))
}

#[derive(Deserialize)]
struct IndexQuery {
    id: Option<String>,
}

async fn block_by_index<E: Entry>(
    State(node): State<Arc<Node<E>>>,
    Query(params): Query<IndexQuery>,
) -> ApiResult<impl IntoResponse> {
    let raw = params
        .id
        .ok_or_else(|| ApiError::bad_request("id parameter required"))?;
    let index: u64 = raw
        .parse()
        .map_err(|_| ApiError::bad_request("id must be an integer"))?;
    let block = node
        .ledger
        .store()
        .block::<E>(index)
        .map_err(LedgerError::from)?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "block not found"))?;
    Ok(Json(block))
}

#[derive(Deserialize)]
struct ValueQuery {
    value: Option<String>,
}

async fn block_by_hash<E: Entry>(
    State(node): State<Arc<Node<E>>>,
    Query(params): Query<ValueQuery>,
) -> ApiResult<impl IntoResponse> {
    let hash = params
        .value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request("value parameter required"))?;
    let block = node
        .ledger
        .store()
        .block_by_hash::<E>(&hash)
        .map_err(LedgerError::from)?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "block not found"))?;
    Ok(Json(block))
}

async fn block_root<E: Entry>(
    State(node): State<Arc<Node<E>>>,
) -> ApiResult<impl IntoResponse> {
    let root = node
        .ledger
        .store()
        .latest_root()
        .map_err(LedgerError::from)?
        .unwrap_or_default();
    Ok(Json(json!({ "root": root })))
}

async fn public_key<E: Entry>(State(node): State<Arc<Node<E>>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/x-pem-file")],
        node.identity.public_pem.clone(),
    )
}

async fn mine_start<E: Entry>(
    State(node): State<Arc<Node<E>>>,
    Json(req): Json<MineStartRequest<E>>,
) -> ApiResult<impl IntoResponse> {
    node.handle_mine_start(req.entries)?;
    Ok(Json(json!({ "status": "mining started" })))
}

async fn receive_block<E: Entry>(
    State(node): State<Arc<Node<E>>>,
    Json(announcement): Json<BlockAnnouncement<E>>,
) -> ApiResult<impl IntoResponse> {
    node.handle_receive_block(announcement)?;
    Ok(StatusCode::OK)
}

async fn bft_start<E: Entry>(
    State(node): State<Arc<Node<E>>>,
    Json(msg): Json<BftStart<E>>,
) -> ApiResult<impl IntoResponse> {
    node.handle_bft_start(msg)?;
    Ok(StatusCode::OK)
}

async fn bft_prepare<E: Entry>(
    State(node): State<Arc<Node<E>>>,
    Json(vote): Json<BftVote>,
) -> ApiResult<impl IntoResponse> {
    node.handle_bft_prepare(vote)?;
    Ok(StatusCode::OK)
}

async fn bft_commit<E: Entry>(
    State(node): State<Arc<Node<E>>>,
    Json(vote): Json<BftVote>,
) -> ApiResult<impl IntoResponse> {
    node.handle_bft_commit(vote)?;
    Ok(StatusCode::OK)
}

// ---------------------------------------------------------------------------
// Lower-tier handlers
// ---------------------------------------------------------------------------

async fn record_add(
    State(lower): State<Arc<LowerNode>>,
    Json(record): Json<ProviderRecord>,
) -> ApiResult<impl IntoResponse> {
    if record.record_id.is_empty() || record.fingerprint.is_empty() || record.storage_addr.is_empty()
    {
        return Err(ApiError::bad_request(
            "missing required fields (record_id, fingerprint, storage_addr)",
        ));
    }
    lower.node.ledger.append_pending(vec![record]);
    let (count, bytes) = lower.node.ledger.pending_stats();
    Ok(Json(json!({
        "ok": true,
        "queued": { "count": count, "bytes": bytes },
    })))
}

async fn search(
    State(lower): State<Arc<LowerNode>>,
    Query(params): Query<ValueQuery>,
) -> ApiResult<impl IntoResponse> {
    let keyword = params
        .value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request("value parameter required"))?;
    let items = search_records(lower.node.ledger.store(), &keyword)?;
    Ok(Json(items))
}

async fn proof(
    State(lower): State<Arc<LowerNode>>,
    Query(params): Query<IndexQuery>,
) -> ApiResult<impl IntoResponse> {
    let record_id = params
        .id
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request("id parameter required"))?;
    let (record, block, proof) = record_proof(lower.node.ledger.store(), &record_id)?;
    Ok(Json(json!({
        "record": record,
        "block": block,
        "proof": proof,
    })))
}

async fn upper_boot_notify(
    State(lower): State<Arc<LowerNode>>,
    Json(req): Json<BootNotify>,
) -> ApiResult<impl IntoResponse> {
    if req.addr.is_empty() {
        return Err(ApiError::bad_request("addr required"));
    }
    if lower.node.net.probe_status(&req.addr).await.is_none() {
        return Err(ApiError::new(
            StatusCode::BAD_GATEWAY,
            "claimed upper boot not reachable",
        ));
    }
    lower.set_upper_boot(&req.addr);
    Ok(StatusCode::OK)
}

// ---------------------------------------------------------------------------
// Upper-tier handlers
// ---------------------------------------------------------------------------

async fn add_anchor(
    State(upper): State<Arc<UpperNode>>,
    Json(submission): Json<AnchorSubmission>,
) -> ApiResult<impl IntoResponse> {
    if submission.provider_id.is_empty() || submission.root.is_empty() {
        return Err(ApiError::bad_request("provider_id and root required"));
    }
    upper.handle_add_anchor(submission).await?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct QueryParams {
    provider_id: Option<String>,
    keyword: Option<String>,
}

async fn query(
    State(upper): State<Arc<UpperNode>>,
    Query(params): Query<QueryParams>,
) -> ApiResult<impl IntoResponse> {
    let provider = params
        .provider_id
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request("provider_id required"))?;
    let keyword = params
        .keyword
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request("keyword required"))?;
    let verified = upper.handle_query(&provider, &keyword).await?;
    Ok(Json(verified))
}

async fn provider_boot_notify(
    State(upper): State<Arc<UpperNode>>,
    Json(req): Json<ProviderBootNotify>,
) -> ApiResult<impl IntoResponse> {
    if req.provider_id.is_empty() || req.boot_addr.is_empty() {
        return Err(ApiError::bad_request("provider_id and boot_addr required"));
    }
    upper.handle_provider_boot_notify(&req).await?;
    Ok(StatusCode::OK)
}
