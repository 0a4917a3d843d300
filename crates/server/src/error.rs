//! Error mapping utilities for converting store errors to HTTP responses.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use raftkv::KvError;

/// Header carrying the leader's Raft address on a not-leader response.
///
/// Nodes only know each other's Raft addresses, so this is not the address
/// of the leader's client API.
pub const LEADER_HEADER: &str = "x-raft-leader";

/// Map a store error to an HTTP status code.
pub fn status_for(err: &KvError) -> StatusCode {
    match err {
        KvError::NotLeader { .. } | KvError::Halted(_) => StatusCode::SERVICE_UNAVAILABLE,
        KvError::InvalidArgument(_) | KvError::Decode(_) => StatusCode::BAD_REQUEST,
        KvError::Conflict { .. } => StatusCode::CONFLICT,
        KvError::Apply(_)
        | KvError::Encode(_)
        | KvError::Restore(_)
        | KvError::Consensus(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// A [`KvError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub KvError);

impl From<KvError> for ApiError {
    fn from(err: KvError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if let KvError::NotLeader { hint } = &self.0 {
            let mut response = (status, format!("{}\n", hint)).into_response();
            if let Ok(value) = HeaderValue::from_str(hint) {
                response.headers_mut().insert(LEADER_HEADER, value);
            }
            return response;
        }

        if status.is_server_error() {
            tracing::warn!(error = %self.0, "request failed");
        }
        (status, format!("{}\n", self.0)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_not_leader() {
        assert_eq!(
            status_for(&KvError::not_leader("10.0.0.1:7000")),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_map_apply_error() {
        assert_eq!(
            status_for(&KvError::Apply("timed out".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_map_conflict() {
        let err = KvError::Conflict {
            node_id: "n2".into(),
            existing: "a:1".into(),
            requested: "b:2".into(),
        };
        assert_eq!(status_for(&err), StatusCode::CONFLICT);
    }

    #[test]
    fn test_map_invalid_argument() {
        assert_eq!(
            status_for(&KvError::InvalidArgument("empty".into())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_map_halted() {
        assert_eq!(
            status_for(&KvError::Halted("bad snapshot".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_not_leader_sets_header() {
        let response = ApiError(KvError::not_leader("10.0.0.1:7000")).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(LEADER_HEADER).unwrap(),
            "10.0.0.1:7000"
        );
    }
}
