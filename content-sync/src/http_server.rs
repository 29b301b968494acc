use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use nexus_content_sync::types::RawChangeEvent;
use nexus_content_sync::{ContentSync, SyncError};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const SIGNATURE_HEADER: &str = "x-content-signature";

#[derive(Clone)]
struct ServerState {
    sync: Arc<ContentSync>,
}

/// Spawn the Axum server on 127.0.0.1:0 and return the bound port.
pub async fn start(sync: Arc<ContentSync>) -> Result<u16, String> {
    let app = Router::new()
        .route("/hooks/content", post(handle_change))
        .route("/health", get(handle_health))
        .with_state(ServerState { sync });

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| format!("failed to bind HTTP server: {e}"))?;

    let port = listener
        .local_addr()
        .map_err(|e| format!("failed to read bound address: {e}"))?
        .port();
    info!(port, "HTTP server bound");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "HTTP server error");
        }
    });

    Ok(port)
}

async fn handle_change(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let raw: RawChangeEvent = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "unparsable change notification");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "validation_error", "message": e.to_string() })),
            );
        }
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    match state.sync.notify_raw(raw, signature).await {
        Ok(result) => {
            let status = if result.success || result.retry_in_ms.is_some() {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, Json(json!(result)))
        }
        Err(e) => (
            status_for(&e),
            Json(json!({ "error": e.kind(), "message": e.to_string() })),
        ),
    }
}

async fn handle_health(State(state): State<ServerState>) -> Json<Value> {
    Json(json!(state.sync.get_health_status()))
}

fn status_for(err: &SyncError) -> StatusCode {
    match err {
        SyncError::Validation { .. } => StatusCode::BAD_REQUEST,
        SyncError::Authenticity => StatusCode::UNAUTHORIZED,
        SyncError::StaleEvent { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        SyncError::Processing(_) | SyncError::Fetch(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_content_sync::verification::sign_event;
    use nexus_content_sync::{
        ChangeAction, ChangeEvent, ContentType, FetchError, HttpContentSource, SyncConfig,
    };

    const SECRET: &str = "route-secret";

    async fn serve() -> String {
        let config = SyncConfig {
            webhook_secret: Some(SECRET.to_string()),
            ..SyncConfig::default()
        };
        let source = Arc::new(HttpContentSource::new("http://127.0.0.1:9"));
        let sync = Arc::new(ContentSync::new(config, source));
        let port = start(sync).await.unwrap();
        format!("http://127.0.0.1:{port}")
    }

    #[tokio::test]
    async fn change_route_maps_outcomes_to_statuses() {
        let base = serve().await;
        let client = reqwest::Client::new();
        let url = format!("{base}/hooks/content");

        let garbled = client.post(&url).body("{not json").send().await.unwrap();
        assert_eq!(garbled.status(), StatusCode::BAD_REQUEST);

        let forged = ChangeEvent::new(ChangeAction::Publish, ContentType::Article, "A1");
        let res = client
            .post(&url)
            .header(SIGNATURE_HEADER, "sha256=00")
            .body(serde_json::to_vec(&forged).unwrap())
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["error"], "authenticity_error");

        let event = ChangeEvent::new(ChangeAction::Publish, ContentType::Article, "A2");
        let res = client
            .post(&url)
            .header(SIGNATURE_HEADER, sign_event(SECRET, &event))
            .body(serde_json::to_vec(&event).unwrap())
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["success"], true);

        let health = client.get(format!("{base}/health")).send().await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);
    }

    #[test]
    fn errors_map_to_distinct_statuses() {
        assert_eq!(status_for(&SyncError::validation("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&SyncError::Authenticity), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_for(&SyncError::StaleEvent { age_ms: 1, window_ms: 0 }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&SyncError::Fetch(FetchError::Unavailable("down".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
