mod http_server;

use nexus_content_sync::bus::Subscription;
use nexus_content_sync::types::{CacheUpdate, RawChangeEvent};
use nexus_content_sync::{ContentSync, ContentType, ContentView, HttpContentSource, SyncConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// ─── JSON-RPC wire types ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: Value,
    id: Value,
}

#[derive(Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Value,
}

#[derive(Serialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

fn ok_response(id: Value, data: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: Some(serde_json::json!({
            "success": true,
            "data": data,
            "message": null
        })),
        error: None,
        id,
    }
}

fn err_response(id: Value, code: i64, message: String) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: None,
        error: Some(JsonRpcError { code, message }),
        id,
    }
}

/// Operation failure carrying its JSON-RPC error code.
struct OpError {
    code: i64,
    message: String,
}

impl OpError {
    fn params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            code: -32000,
            message: message.into(),
        }
    }
}

// ─── Shared app state ────────────────────────────────────────────────────────

#[derive(Default)]
struct AppState {
    sync: Option<Arc<ContentSync>>,
    port: Option<u16>,
    base_url: String,
    /// Cache updates not yet published to the host.
    pending_rx: Option<mpsc::UnboundedReceiver<CacheUpdate>>,
    subscription: Option<Subscription>,
}

impl AppState {
    fn sync(&self) -> Result<Arc<ContentSync>, OpError> {
        self.sync
            .clone()
            .ok_or_else(|| OpError::failed("content sync not initialized"))
    }
}

// ─── Entry point ─────────────────────────────────────────────────────────────

fn init_tracing() {
    // stdout carries JSON-RPC; logs go to stderr.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("nexus_content_sync=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    let state: Arc<RwLock<AppState>> = Arc::new(RwLock::new(AppState::default()));
    let state_clone = state.clone();
    let handle = tokio::runtime::Handle::current();

    // Stdin loop on a blocking thread to avoid blocking the async runtime.
    let stdin_loop = tokio::task::spawn_blocking(move || {
        let stdin = io::stdin();
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let mut line = String::new();

        loop {
            line.clear();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                _ => {}
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let request: JsonRpcRequest = match serde_json::from_str(trimmed) {
                Ok(r) => r,
                Err(e) => {
                    let resp =
                        err_response(Value::Number(0.into()), -32700, format!("Parse error: {e}"));
                    emit_line(&mut out, &resp);
                    continue;
                }
            };

            let is_shutdown = request.method == "shutdown";

            let response = handle.block_on(handle_request(&request, &state_clone, &mut out));
            emit_line(&mut out, &response);

            if is_shutdown {
                break;
            }
        }
    });

    if let Err(e) = stdin_loop.await {
        error!(error = %e, "stdin loop panicked");
    }
}

fn emit_line(out: &mut impl Write, resp: &JsonRpcResponse) {
    let line = serde_json::to_string(resp).expect("serialize response");
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

// ─── Request dispatch ─────────────────────────────────────────────────────────

async fn handle_request(
    req: &JsonRpcRequest,
    state: &Arc<RwLock<AppState>>,
    out: &mut dyn Write,
) -> JsonRpcResponse {
    match req.method.as_str() {
        "initialize" => handle_initialize(req, state).await,
        "shutdown" => handle_shutdown(req, state).await,
        "execute" => handle_execute(req, state, out).await,
        _ => err_response(req.id.clone(), -32601, format!("Unknown method: {}", req.method)),
    }
}

async fn handle_initialize(
    req: &JsonRpcRequest,
    state: &Arc<RwLock<AppState>>,
) -> JsonRpcResponse {
    let config: SyncConfig = match req.params.get("config") {
        Some(raw) => match serde_json::from_value(raw.clone()) {
            Ok(c) => c,
            Err(e) => {
                return err_response(req.id.clone(), -32602, format!("invalid config: {e}"));
            }
        },
        None => SyncConfig::default(),
    };

    let Some(source_url) = config.source_url.clone() else {
        return err_response(
            req.id.clone(),
            -32602,
            "config.sourceUrl is required".to_string(),
        );
    };

    if let Some(previous) = state.write().await.sync.take() {
        previous.stop();
    }

    let source = Arc::new(HttpContentSource::new(&source_url));
    let sync = Arc::new(ContentSync::new(config, source));

    let (update_tx, update_rx) = mpsc::unbounded_channel();
    let subscription = sync.on_cache_update(move |update| {
        let _ = update_tx.send(update.clone());
    });

    let port = match http_server::start(sync.clone()).await {
        Ok(p) => p,
        Err(e) => {
            return err_response(req.id.clone(), -32603, format!("HTTP server failed: {e}"));
        }
    };
    let base_url = format!("http://127.0.0.1:{port}");

    sync.start();
    info!(source_url = %source_url, base_url = %base_url, "content sync initialized");

    let mut st = state.write().await;
    st.sync = Some(sync);
    st.port = Some(port);
    st.base_url = base_url.clone();
    st.pending_rx = Some(update_rx);
    st.subscription = Some(subscription);

    JsonRpcResponse {
        jsonrpc: "2.0",
        result: Some(serde_json::json!({
            "ready": true,
            "webhook_url": format!("{base_url}/hooks/content"),
        })),
        error: None,
        id: req.id.clone(),
    }
}

async fn handle_shutdown(
    req: &JsonRpcRequest,
    state: &Arc<RwLock<AppState>>,
) -> JsonRpcResponse {
    let mut st = state.write().await;
    st.subscription = None;
    if let Some(sync) = st.sync.take() {
        sync.stop();
    }
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: Some(serde_json::json!({})),
        error: None,
        id: req.id.clone(),
    }
}

// ─── Execute handler ──────────────────────────────────────────────────────────

async fn handle_execute(
    req: &JsonRpcRequest,
    state: &Arc<RwLock<AppState>>,
    out: &mut dyn Write,
) -> JsonRpcResponse {
    drain_pending_updates(state, out).await;

    let operation = req
        .params
        .get("operation")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let input = req
        .params
        .get("input")
        .cloned()
        .unwrap_or(Value::Object(Default::default()));

    let result = match operation {
        "get_server_info" => op_get_server_info(state).await,
        "notify_change" => op_notify_change(&input, state).await,
        "get_health_status" => op_get_health_status(state).await,
        "export_metrics" => op_export_metrics(state).await,
        "force_check" => op_force_check(state).await,
        "set_frequency" => op_set_frequency(&input, state).await,
        "list_alerts" => op_list_alerts(state).await,
        "resolve_alert" => op_resolve_alert(&input, state).await,
        "get_recent_deliveries" => op_get_recent_deliveries(state).await,
        "get_poller_status" => op_get_poller_status(state).await,
        "read_content" => op_read_content(&input, state).await,
        _ => Err(OpError::failed(format!("Unknown operation: {operation}"))),
    };

    // Updates triggered by this operation go out before the response.
    drain_pending_updates(state, out).await;

    match result {
        Ok(data) => ok_response(req.id.clone(), data),
        Err(e) => err_response(req.id.clone(), e.code, e.message),
    }
}

// ─── Pending update draining ──────────────────────────────────────────────────

/// Publish queued cache updates to the host as `content.cache_updated` events.
/// Must be called while the host is in its read loop.
async fn drain_pending_updates(state: &Arc<RwLock<AppState>>, out: &mut dyn Write) {
    let mut pending: Vec<CacheUpdate> = Vec::new();
    {
        let mut st = state.write().await;
        if let Some(rx) = &mut st.pending_rx {
            while let Ok(update) = rx.try_recv() {
                pending.push(update);
            }
        }
    }

    if pending.is_empty() {
        return;
    }

    static NEXT_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(20000);
    let stdin = io::stdin();

    for update in &pending {
        let call_id = NEXT_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let subject = match &update.content_id {
            Some(id) => format!("{}:{}", update.content_type, id),
            None => format!("{}:all", update.content_type),
        };
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "event.publish",
            "params": {
                "type": "content.cache_updated",
                "subject": subject,
                "data": update,
            },
            "id": call_id,
        });
        let _ = writeln!(out, "{req}");
        let _ = out.flush();

        // Read back the host's response to keep the protocol in sync
        let mut line = String::new();
        let _ = stdin.lock().read_line(&mut line);
    }
}

// ─── Operations ───────────────────────────────────────────────────────────────

async fn op_get_server_info(state: &Arc<RwLock<AppState>>) -> Result<Value, OpError> {
    let st = state.read().await;
    let port = st.port.ok_or_else(|| OpError::failed("server not initialized"))?;
    let sync = st.sync()?;
    Ok(serde_json::json!({
        "port": port,
        "base_url": st.base_url,
        "webhook_url": format!("{}/hooks/content", st.base_url),
        "content_types": sync.config().content_types,
        "poll_interval_ms": sync.poller_status().interval_ms,
    }))
}

async fn op_notify_change(input: &Value, state: &Arc<RwLock<AppState>>) -> Result<Value, OpError> {
    let sync = state.read().await.sync()?;
    let event = input
        .get("event")
        .cloned()
        .ok_or_else(|| OpError::params("missing required field: event"))?;
    let raw: RawChangeEvent =
        serde_json::from_value(event).map_err(|e| OpError::params(format!("invalid event: {e}")))?;
    let signature = input.get("signature").and_then(|v| v.as_str());

    let result = sync
        .notify_raw(raw, signature)
        .await
        .map_err(|e| OpError::failed(format!("{}: {e}", e.kind())))?;
    Ok(serde_json::json!(result))
}

async fn op_get_health_status(state: &Arc<RwLock<AppState>>) -> Result<Value, OpError> {
    let sync = state.read().await.sync()?;
    Ok(serde_json::json!(sync.get_health_status()))
}

async fn op_export_metrics(state: &Arc<RwLock<AppState>>) -> Result<Value, OpError> {
    let sync = state.read().await.sync()?;
    Ok(sync.export_metrics())
}

async fn op_force_check(state: &Arc<RwLock<AppState>>) -> Result<Value, OpError> {
    use nexus_content_sync::poller::PollOutcome;

    let sync = state.read().await.sync()?;
    let data = match sync.force_check().await {
        PollOutcome::Skipped => serde_json::json!({ "outcome": "skipped" }),
        PollOutcome::Suspended => serde_json::json!({ "outcome": "suspended" }),
        PollOutcome::Baseline => serde_json::json!({ "outcome": "baseline" }),
        PollOutcome::Discarded => serde_json::json!({ "outcome": "discarded" }),
        PollOutcome::Changes(result) => serde_json::json!({
            "outcome": "changes",
            "count": result.len(),
            "changes": result.changes,
        }),
        PollOutcome::Failed(message) => return Err(OpError::failed(message)),
    };
    Ok(data)
}

async fn op_set_frequency(input: &Value, state: &Arc<RwLock<AppState>>) -> Result<Value, OpError> {
    let sync = state.read().await.sync()?;
    let ms = input
        .get("interval_ms")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| OpError::params("missing required field: interval_ms"))?;
    let applied = sync.set_frequency(ms);
    Ok(serde_json::json!({ "interval_ms": applied }))
}

async fn op_list_alerts(state: &Arc<RwLock<AppState>>) -> Result<Value, OpError> {
    let sync = state.read().await.sync()?;
    let alerts = sync.active_alerts();
    Ok(serde_json::json!({ "alerts": alerts, "count": alerts.len() }))
}

async fn op_resolve_alert(input: &Value, state: &Arc<RwLock<AppState>>) -> Result<Value, OpError> {
    let sync = state.read().await.sync()?;
    let id = input
        .get("alert_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| OpError::params("missing required field: alert_id"))?;
    let id = uuid::Uuid::parse_str(id).map_err(|e| OpError::params(format!("invalid alert_id: {e}")))?;
    match sync.resolve_alert(id) {
        Some(alert) => Ok(serde_json::json!(alert)),
        None => Err(OpError::failed(format!("no open alert: {id}"))),
    }
}

async fn op_get_recent_deliveries(state: &Arc<RwLock<AppState>>) -> Result<Value, OpError> {
    let sync = state.read().await.sync()?;
    Ok(serde_json::json!({
        "deliveries": sync.recent_results(),
        "pending_retries": sync.retry_queue(),
    }))
}

async fn op_get_poller_status(state: &Arc<RwLock<AppState>>) -> Result<Value, OpError> {
    let sync = state.read().await.sync()?;
    Ok(serde_json::json!(sync.poller_status()))
}

async fn op_read_content(input: &Value, state: &Arc<RwLock<AppState>>) -> Result<Value, OpError> {
    let sync = state.read().await.sync()?;
    let content_type: ContentType = input
        .get("content_type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| OpError::params("missing required field: content_type"))?
        .parse()
        .map_err(OpError::params)?;
    let view = match input.get("content_id").and_then(|v| v.as_str()) {
        Some(id) => ContentView::item(content_type, id),
        None => ContentView::list(content_type),
    };
    sync.read(&view)
        .await
        .map_err(|e| OpError::failed(e.to_string()))
}
