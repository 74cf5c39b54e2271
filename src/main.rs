use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use twitch_trigger::config::Config;
use twitch_trigger::host::{self, AppState};
use twitch_trigger::store::LinkStore;
use twitch_trigger::types::PendingEvent;
use twitch_trigger::webhook::{self, ActiveInstances};

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

fn raw_response(id: Value, result: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: Some(result),
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

// ─── Entry point ─────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let state: Arc<RwLock<AppState>> = Arc::new(RwLock::new(AppState::new(PathBuf::from("."))));

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
    match serde_json::to_string(resp) {
        Ok(line) => {
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        }
        Err(e) => error!(error = %e, "failed to serialize response"),
    }
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

async fn handle_initialize(req: &JsonRpcRequest, state: &Arc<RwLock<AppState>>) -> JsonRpcResponse {
    let data_dir = req
        .params
        .get("data_dir")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let config = match Config::from_host(req.params.get("config")) {
        Ok(c) => c,
        Err(e) => return err_response(req.id.clone(), -32602, format!("Invalid config: {e}")),
    };

    let mut links = LinkStore::new(data_dir);
    if let Err(e) = links.load() {
        warn!(error = %e, "failed to load webhook links");
    }
    let instances: ActiveInstances = Arc::new(RwLock::new(
        links.instance_ids().map(str::to_string).collect(),
    ));

    let signing_secret = config
        .verify_signatures
        .then(|| config.subscription_secret.clone());
    let started = webhook::start(&config.bind_addr, instances.clone(), signing_secret).await;
    let (addr, pending_rx) = match started {
        Ok(r) => r,
        Err(e) => {
            return err_response(req.id.clone(), -32603, format!("HTTP server failed: {e}"));
        }
    };

    let base_url = format!("http://{addr}");
    let public_url = config
        .public_url
        .clone()
        .unwrap_or_else(|| base_url.clone());

    let mut st = state.write().await;
    st.links = links;
    st.instances = instances;
    st.configure(config);
    st.port = Some(addr.port());
    st.base_url = base_url;
    st.public_url = public_url;
    st.pending_rx = Some(pending_rx);

    info!(public_url = %st.public_url, tracked = st.links.len(), "initialized");
    raw_response(req.id.clone(), serde_json::json!({ "ready": true }))
}

async fn handle_shutdown(req: &JsonRpcRequest, state: &Arc<RwLock<AppState>>) -> JsonRpcResponse {
    let st = state.read().await;
    if let Err(e) = st.links.save() {
        warn!(error = %e, "failed to persist webhook links on shutdown");
    }
    raw_response(req.id.clone(), serde_json::json!({}))
}

// ─── Execute handler ──────────────────────────────────────────────────────────

async fn handle_execute(
    req: &JsonRpcRequest,
    state: &Arc<RwLock<AppState>>,
    out: &mut dyn Write,
) -> JsonRpcResponse {
    drain_pending_events(state, out).await;

    let operation = req
        .params
        .get("operation")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let input = req.params.get("input").cloned().unwrap_or(Value::Null);

    let result = {
        let mut st = state.write().await;
        host::execute(operation, &input, &mut st).await
    };

    match result {
        Ok(data) => ok_response(req.id.clone(), data),
        Err(msg) => err_response(req.id.clone(), -32000, msg),
    }
}

// ─── Pending event draining ───────────────────────────────────────────────────

/// Drain any deliveries queued by the HTTP server and publish them as IPC events.
/// Must be called while the host is in its read loop (i.e., during any execute call).
async fn drain_pending_events(state: &Arc<RwLock<AppState>>, out: &mut dyn Write) {
    let mut pending: Vec<PendingEvent> = Vec::new();
    {
        let mut st = state.write().await;
        if let Some(rx) = &mut st.pending_rx {
            while let Ok(item) = rx.try_recv() {
                pending.push(item);
            }
        }
    }

    if pending.is_empty() {
        return;
    }

    static NEXT_ID: AtomicU64 = AtomicU64::new(20000);
    let stdin = io::stdin();

    for event in pending {
        let call_id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "event.publish",
            "params": {
                "type": event.event_type,
                "subject": event.instance_id,
                "data": event.data,
                "delivery_id": event.delivery_id,
                "received_at": event.received_at.to_rfc3339(),
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
