use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router, body::Bytes};
use hopline_core::chain::{ChainRequest, ChainResponse};
use hopline_core::config::Config;
use hopline_core::context::TRACE_HEADER;
use hopline_core::error::{HoplineError, Result};
use hopline_core::recorder::SpanRecorder;
use hopline_core::sink::PersistenceSink;
use hopline_store::{Store, StoreSink};
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;

use crate::collector::{Collector, CollectorConfig};
use crate::dispatch::ChainDispatcher;
use crate::handler::handler_for;
use crate::hop::{ServiceState, process_hop};

pub fn service_router(state: Arc<ServiceState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    let mut router = Router::new()
        .route("/process", post(process))
        .route("/health", get(health))
        .route("/", get(service_info));
    if state.store.is_some() {
        router = router
            .route("/traces", get(recent_traces))
            .route("/traces/{trace_id}", get(trace_records));
    }
    router
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .on_request(tower_http::trace::DefaultOnRequest::new().level(Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

async fn process(
    State(state): State<Arc<ServiceState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<ChainResponse>) {
    // A missing or non-JSON body becomes an empty request and fails
    // validation with a traced 400 instead of a bare framework reject.
    let request: ChainRequest = serde_json::from_slice(&body).unwrap_or_default();
    let header = headers.get(TRACE_HEADER).and_then(|v| v.to_str().ok());
    let (status, response) = process_hop(&state, header, request).await;
    (status, Json(response))
}

/// Liveness only. Touches neither the chain nor the store, so a sick
/// downstream or database never flips health.
async fn health(State(state): State<Arc<ServiceState>>) -> Json<Value> {
    Json(json!({"status": "ok", "service": state.name()}))
}

async fn service_info(State(state): State<Arc<ServiceState>>) -> Json<Value> {
    let role = if state.topology.entry().name == state.name() {
        "entry"
    } else if state.topology.is_terminal(state.name()) {
        "terminal"
    } else {
        "relay"
    };
    let mut endpoints = vec!["/", "/health", "/process"];
    if state.store.is_some() {
        endpoints.push("/traces");
        endpoints.push("/traces/{trace_id}");
    }
    Json(json!({
        "service": state.name(),
        "role": role,
        "next_hop": state.topology.next_hop(state.name()).map(|s| s.name.clone()),
        "endpoints": endpoints,
    }))
}

async fn recent_traces(State(state): State<Arc<ServiceState>>) -> (StatusCode, Json<Value>) {
    let Some(store) = &state.store else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "not_found", "message": "trace queries live on the terminal service"})),
        );
    };
    match store.recent_records(50) {
        Ok(records) => (
            StatusCode::OK,
            Json(json!({"status": "ok", "count": records.len(), "traces": records})),
        ),
        Err(e) => {
            tracing::warn!(error = ?e, "recent trace query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "error", "message": e.to_string()})),
            )
        }
    }
}

async fn trace_records(
    State(state): State<Arc<ServiceState>>,
    Path(trace_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    let Some(store) = &state.store else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "not_found", "message": "trace queries live on the terminal service"})),
        );
    };
    match store.records_for_trace(&trace_id) {
        Ok(records) if records.is_empty() => (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "not_found", "trace_id": trace_id})),
        ),
        Ok(records) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "trace_id": trace_id,
                "count": records.len(),
                "records": records,
            })),
        ),
        Err(e) => {
            tracing::warn!(error = ?e, trace_id, "trace query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "error", "message": e.to_string()})),
            )
        }
    }
}

/// Binds the state's configured address and serves it in the background.
/// Returns the bound address; used directly by in-process tests.
pub async fn spawn_service(state: Arc<ServiceState>) -> Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(&state.service.listen_addr)
        .await
        .map_err(|e| {
            HoplineError::Io(format!("failed to bind {}: {e}", state.service.listen_addr))
        })?;
    let addr = listener
        .local_addr()
        .map_err(|e| HoplineError::Io(format!("failed to read bound addr: {e}")))?;
    let name = state.name().to_string();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, service_router(state)).await {
            tracing::warn!(error = ?e, service = %name, "service exited");
        }
    });
    Ok(addr)
}

/// Starts every service in the chain in this process, all sharing one
/// store, recorder and sink. Returns when any server fails.
pub async fn run_chain_servers(cfg: Config, store: Store) -> Result<()> {
    let topology = cfg.topology()?;
    let collector = Collector::new(
        store.clone(),
        CollectorConfig {
            channel_capacity: cfg.export_channel_capacity,
            flush_interval: Duration::from_millis(cfg.export_flush_ms),
            batch_size: cfg.export_batch_size,
        },
    );
    let recorder = SpanRecorder::new(collector.exporter());
    let dispatcher = ChainDispatcher::new();
    let sink: Arc<dyn PersistenceSink> = Arc::new(StoreSink::new(store.clone()));

    let mut tasks = Vec::new();
    for svc in topology.services() {
        let terminal = topology.is_terminal(&svc.name);
        let state = Arc::new(ServiceState {
            service: svc.clone(),
            topology: topology.clone(),
            recorder: recorder.clone(),
            dispatcher: dispatcher.clone(),
            handler: handler_for(&svc.name),
            sink: sink.clone(),
            store: terminal.then(|| store.clone()),
            forward_timeout: cfg.forward_timeout,
            persist_budget: cfg.persist_budget,
            sampling: cfg.sampling,
        });
        let listener = tokio::net::TcpListener::bind(&svc.listen_addr)
            .await
            .map_err(|e| HoplineError::Io(format!("failed to bind {}: {e}", svc.listen_addr)))?;
        let router = service_router(state);
        let name = svc.name.clone();
        tasks.push(tokio::spawn(async move {
            axum::serve(listener, router)
                .await
                .map_err(|e| HoplineError::Io(format!("{name} server failed: {e}")))
        }));
    }

    let (res, _, _) = futures::future::select_all(tasks).await;
    match res {
        Ok(inner) => inner,
        Err(e) => Err(HoplineError::Internal(format!(
            "server task join failed: {e}"
        ))),
    }
}
