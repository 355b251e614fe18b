use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{body::Bytes, Json, Router};
use tokio::net::TcpListener;
use tracing::info;

use crate::error::{Error, Result};
use crate::health;
use crate::kv::{KvCommand, KvResult};
use crate::server::RaftHandle;

const PROPOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP surface over a node: KV operations plus health and status.
pub fn router(handle: RaftHandle) -> Router {
    Router::new()
        .route(
            "/kv/{key}",
            get(handle_get).put(handle_put).delete(handle_delete),
        )
        .route("/health/live", get(handle_live))
        .route("/health/ready", get(handle_ready))
        .route("/status", get(handle_status))
        .with_state(handle)
}

pub async fn serve(listener: TcpListener, handle: RaftHandle) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "client api listening");
    }
    axum::serve(listener, router(handle)).await
}

async fn handle_get(
    State(handle): State<RaftHandle>,
    Path(key): Path<String>,
) -> (StatusCode, String) {
    submit(&handle, KvCommand::Get { key }).await
}

async fn handle_put(
    State(handle): State<RaftHandle>,
    Path(key): Path<String>,
    body: Bytes,
) -> (StatusCode, String) {
    match set_command(key, body) {
        Ok(command) => submit(&handle, command).await,
        Err(rejected) => rejected,
    }
}

/// Values are stored as text; bodies that are not UTF-8 are refused, not rewritten.
fn set_command(
    key: String,
    body: Bytes,
) -> std::result::Result<KvCommand, (StatusCode, String)> {
    let value = String::from_utf8(body.to_vec()).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            format!("value is not valid UTF-8: {e}"),
        )
    })?;
    Ok(KvCommand::Set { key, value })
}

async fn handle_delete(
    State(handle): State<RaftHandle>,
    Path(key): Path<String>,
) -> (StatusCode, String) {
    submit(&handle, KvCommand::Delete { key }).await
}

async fn handle_live(State(handle): State<RaftHandle>) -> Response {
    health_response(health::liveness(handle.is_running()))
}

async fn handle_ready(State(handle): State<RaftHandle>) -> Response {
    health_response(health::readiness(&handle.status()))
}

async fn handle_status(State(handle): State<RaftHandle>) -> Response {
    Json(handle.status()).into_response()
}

fn health_response(report: health::HealthReport) -> Response {
    let code = if report.status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report)).into_response()
}

/// Propose a command and wait up to 5 s for it to be applied.
async fn submit(handle: &RaftHandle, command: KvCommand) -> (StatusCode, String) {
    let result = match tokio::time::timeout(PROPOSE_TIMEOUT, handle.propose(command.encode())).await
    {
        Ok(result) => result.and_then(|output| KvResult::decode(&output)),
        Err(_) => return (StatusCode::SERVICE_UNAVAILABLE, "timeout".into()),
    };
    to_response(result)
}

fn to_response(result: Result<KvResult>) -> (StatusCode, String) {
    match result {
        Ok(KvResult::Ok) => (StatusCode::OK, "ok".into()),
        Ok(KvResult::Value(Some(v))) => (StatusCode::OK, v),
        Ok(KvResult::Value(None)) => (StatusCode::NOT_FOUND, String::new()),
        Ok(KvResult::Invalid(reason)) => (StatusCode::BAD_REQUEST, reason),
        Err(Error::NotLeader { leader: Some(leader) }) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("not the leader, try {leader}"),
        ),
        Err(Error::NotLeader { leader: None }) => {
            (StatusCode::SERVICE_UNAVAILABLE, "not the leader".into())
        }
        Err(Error::Shutdown | Error::Halted) => {
            (StatusCode::SERVICE_UNAVAILABLE, "server shutting down".into())
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;

    #[test]
    fn values_and_misses() {
        assert_eq!(
            to_response(Ok(KvResult::Value(Some("v".into())))),
            (StatusCode::OK, "v".to_string())
        );
        assert_eq!(to_response(Ok(KvResult::Value(None))).0, StatusCode::NOT_FOUND);
        assert_eq!(to_response(Ok(KvResult::Ok)).0, StatusCode::OK);
    }

    #[test]
    fn put_body_must_be_utf8() {
        let (code, _) =
            set_command("k".into(), Bytes::from_static(&[0x66, 0xff, 0xfe])).unwrap_err();
        assert_eq!(code, StatusCode::BAD_REQUEST);

        assert_eq!(
            set_command("k".into(), Bytes::from_static("grüße".as_bytes())).unwrap(),
            KvCommand::Set {
                key: "k".into(),
                value: "grüße".into(),
            }
        );
    }

    #[test]
    fn not_leader_carries_hint() {
        let (code, body) = to_response(Err(Error::NotLeader {
            leader: Some(NodeId::from("n2")),
        }));
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("n2"));
    }

    #[test]
    fn halted_node_is_unavailable() {
        assert_eq!(
            to_response(Err(Error::Halted)).0,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            to_response(Err(Error::StateMachine("bad".into()))).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
