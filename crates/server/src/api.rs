//! HTTP API for clients: `/kv` for data, `/join` for membership and
//! `/health` for load balancers.

use crate::error::ApiError;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use raftkv::{Health, KvError, KvStore};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

type Store = Arc<dyn KvStore>;

#[derive(Debug, Deserialize)]
struct KeyParam {
    key: Option<String>,
}

impl KeyParam {
    fn required(self) -> Result<String, ApiError> {
        self.key
            .ok_or_else(|| KvError::InvalidArgument("missing key parameter".into()).into())
    }
}

/// Body of `POST /join`.
#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub id: Option<String>,
    pub addr: Option<String>,
}

/// Build the client API router.
///
/// Methods other than the ones routed here get `405 Method Not Allowed`.
pub fn router(store: Store) -> Router {
    Router::new()
        .route("/kv", get(get_key).post(put_keys).delete(delete_key))
        .route("/join", post(join))
        .route("/health", get(health))
        .with_state(store)
}

async fn get_key(
    State(store): State<Store>,
    Query(param): Query<KeyParam>,
) -> Result<Response, ApiError> {
    let key = param.required()?;
    match store.get(&key).await? {
        Some(value) => Ok((StatusCode::OK, value).into_response()),
        None => Ok((StatusCode::NOT_FOUND, format!("key {:?} not found\n", key)).into_response()),
    }
}

async fn put_keys(State(store): State<Store>, body: Bytes) -> Result<StatusCode, ApiError> {
    let pairs: BTreeMap<String, String> = serde_json::from_slice(&body).map_err(|e| {
        KvError::InvalidArgument(format!("body must be a JSON object of strings: {}", e))
    })?;
    store.put(pairs).await?;
    Ok(StatusCode::OK)
}

async fn delete_key(
    State(store): State<Store>,
    Query(param): Query<KeyParam>,
) -> Result<StatusCode, ApiError> {
    let key = param.required()?;
    store.delete(&key).await?;
    Ok(StatusCode::OK)
}

async fn join(State(store): State<Store>, body: Bytes) -> Result<StatusCode, ApiError> {
    let req: JoinRequest = serde_json::from_slice(&body)
        .map_err(|e| KvError::InvalidArgument(format!("invalid join request: {}", e)))?;
    let (Some(id), Some(addr)) = (req.id, req.addr) else {
        return Err(KvError::InvalidArgument("join requires id and addr".into()).into());
    };

    tracing::info!(node = %id, %addr, "join requested");
    store.join(&id, &addr).await?;
    Ok(StatusCode::OK)
}

/// 200 while serving, 503 once halted. Followers are healthy; the body says
/// who leads so a client can pick the right node.
async fn health(State(store): State<Store>) -> Response {
    let leadership = store.leadership();
    let (status, code, reason) = match store.health() {
        Health::Serving => ("healthy", StatusCode::OK, None),
        Health::Halted { reason } => ("halted", StatusCode::SERVICE_UNAVAILABLE, Some(reason)),
    };
    let body = serde_json::json!({
        "status": status,
        "reason": reason,
        "leader": leadership.is_leader,
        "leader_hint": leadership.leader_hint,
    });
    (code, axum::Json(body)).into_response()
}
