use std::sync::Arc;
use std::time::Duration;

use hopline_chain::collector::{Collector, CollectorConfig};
use hopline_chain::dispatch::ChainDispatcher;
use hopline_chain::handler::handler_for;
use hopline_chain::hop::ServiceState;
use hopline_chain::server::{run_chain_servers, spawn_service};
use hopline_core::chain::TraceRecord;
use hopline_core::config::{
    ChainTopology, Config, DownstreamPolicy, ServiceConfig, TimeoutPolicy,
};
use hopline_core::context::{SamplingPolicy, TRACE_HEADER, TraceContext};
use hopline_core::error::{HoplineError, Result};
use hopline_core::ids::TraceId;
use hopline_core::recorder::SpanRecorder;
use hopline_core::sink::PersistenceSink;
use hopline_store::{Store, StoreSink};
use serde_json::{Value, json};

fn free_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    format!("127.0.0.1:{}", listener.local_addr().unwrap().port())
}

fn service(name: &str, addr: &str) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        listen_addr: addr.to_string(),
        on_timeout: TimeoutPolicy::Degrade,
        on_downstream_error: DownstreamPolicy::Propagate,
    }
}

fn fast_recorder(store: &Store) -> SpanRecorder {
    let collector = Collector::new(
        store.clone(),
        CollectorConfig {
            channel_capacity: 64,
            flush_interval: Duration::from_millis(10),
            batch_size: 8,
        },
    );
    SpanRecorder::new(collector.exporter())
}

fn make_state(
    svc: &ServiceConfig,
    topology: &ChainTopology,
    recorder: &SpanRecorder,
    sink: Arc<dyn PersistenceSink>,
    store: Option<Store>,
    forward_timeout: Duration,
) -> Arc<ServiceState> {
    Arc::new(ServiceState {
        service: svc.clone(),
        topology: topology.clone(),
        recorder: recorder.clone(),
        dispatcher: ChainDispatcher::new(),
        handler: handler_for(&svc.name),
        sink,
        store,
        forward_timeout,
        persist_budget: Duration::from_secs(1),
        sampling: SamplingPolicy::Always,
    })
}

async fn wait_ready(addr: &str) {
    let client = reqwest::Client::new();
    for _ in 0..200 {
        if let Ok(resp) = client.get(format!("http://{addr}/health")).send().await {
            if resp.status().is_success() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("service at {addr} never became ready");
}

async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn post_process(addr: &str, body: Value, header: Option<&str>) -> (u16, Value) {
    let client = reqwest::Client::new();
    let mut req = client.post(format!("http://{addr}/process")).json(&body);
    if let Some(h) = header {
        req = req.header(TRACE_HEADER, h);
    }
    let resp = req.send().await.unwrap();
    let status = resp.status().as_u16();
    let value = resp.json::<Value>().await.unwrap();
    (status, value)
}

fn response_trace_id(value: &Value) -> TraceId {
    TraceId::parse(value["trace_id"].as_str().expect("trace_id missing")).expect("bad trace id")
}

#[tokio::test]
async fn full_chain_records_every_hop_in_order() {
    let store = Store::open_in_memory().unwrap();
    let mut cfg = Config::default();
    cfg.services = vec![
        service("user-service", &free_addr()),
        service("order-service", &free_addr()),
        service("audit-service", &free_addr()),
    ];
    cfg.export_flush_ms = 10;
    cfg.export_batch_size = 8;
    let entry_addr = cfg.services[0].listen_addr.clone();
    let addrs: Vec<String> = cfg.services.iter().map(|s| s.listen_addr.clone()).collect();

    tokio::spawn(run_chain_servers(cfg, store.clone()));
    for addr in &addrs {
        wait_ready(addr).await;
    }

    let (status, body) = post_process(
        &entry_addr,
        json!({"user_id": 1001, "action": "checkout"}),
        None,
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "user-service");
    let trace = response_trace_id(&body);
    assert_eq!(
        body["service_chain"],
        json!(["user-service", "order-service", "audit-service"])
    );
    assert_eq!(body["data"]["user_name"], "user-1001");
    assert!(body["processing_time_ms"].as_i64().unwrap() >= 0);

    // The nested downstream replies surface the whole chain's view.
    let order_reply = &body["downstream"];
    assert_eq!(order_reply["service"], "order-service");
    let audit_reply = &order_reply["downstream"];
    assert_eq!(audit_reply["service"], "audit-service");
    assert_eq!(audit_reply["message"], "chain completed");
    assert_eq!(audit_reply["data"]["audit_status"], "passed");
    assert!(audit_reply["data"]["order_id"].as_i64().is_some());

    wait_until(
        || store.records_for_trace(trace.as_str()).unwrap().len() == 3,
        "three trace records",
    )
    .await;
    let records = store.records_for_trace(trace.as_str()).unwrap();
    let services: Vec<&str> = records.iter().map(|r| r.service.as_str()).collect();
    assert_eq!(services, ["user-service", "order-service", "audit-service"]);

    wait_until(
        || store.spans_for_trace(trace.as_str()).unwrap().len() == 3,
        "three spans",
    )
    .await;
    let spans = store.spans_for_trace(trace.as_str()).unwrap();
    let span_for = |name: &str| spans.iter().find(|s| s.service == name).unwrap();
    let user = span_for("user-service");
    let order = span_for("order-service");
    let audit = span_for("audit-service");
    assert!(user.parent_span_id.is_none());
    assert_eq!(order.parent_span_id.as_ref(), Some(&user.span_id));
    assert_eq!(audit.parent_span_id.as_ref(), Some(&order.span_id));
    assert!(spans.iter().all(|s| s.trace_id == trace));
    assert!(spans.iter().all(|s| !s.status.is_error()));
    assert!(spans.iter().all(|s| s.duration_ms >= 0));
}

#[tokio::test]
async fn timeout_at_next_hop_degrades_entry_response() {
    let store = Store::open_in_memory().unwrap();
    // Bound but never accepted: connects land in the backlog and requests
    // hang until the dispatch deadline.
    let blocked = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let blocked_addr = blocked.local_addr().unwrap().to_string();

    let services = vec![
        service("user-service", &free_addr()),
        service("order-service", &blocked_addr),
    ];
    let topology = ChainTopology::new(services.clone()).unwrap();
    let recorder = fast_recorder(&store);
    let sink: Arc<dyn PersistenceSink> = Arc::new(StoreSink::new(store.clone()));

    let state = make_state(
        &services[0],
        &topology,
        &recorder,
        sink,
        None,
        Duration::from_millis(300),
    );
    let addr = spawn_service(state).await.unwrap();
    wait_ready(&addr.to_string()).await;

    let (status, body) = post_process(
        &addr.to_string(),
        json!({"user_id": 1001, "action": "checkout"}),
        None,
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body["status"], "degraded");
    assert!(body["message"].as_str().unwrap().contains("timeout"));
    let trace = response_trace_id(&body);

    // Only the entry hop persisted; the chain never reached a third hop.
    wait_until(
        || !store.records_for_trace(trace.as_str()).unwrap().is_empty(),
        "entry trace record",
    )
    .await;
    let records = store.records_for_trace(trace.as_str()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].service, "user-service");

    wait_until(
        || !store.spans_for_trace(trace.as_str()).unwrap().is_empty(),
        "entry span",
    )
    .await;
    let spans = store.spans_for_trace(trace.as_str()).unwrap();
    assert_eq!(spans.len(), 1);
    assert!(spans[0].status.is_error());
    assert!(
        spans[0]
            .status
            .reason()
            .unwrap()
            .contains("timeout"),
        "reason: {:?}",
        spans[0].status.reason()
    );
    drop(blocked);
}

#[tokio::test]
async fn timeout_propagates_when_policy_says_so() {
    let store = Store::open_in_memory().unwrap();
    let blocked = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let blocked_addr = blocked.local_addr().unwrap().to_string();

    let mut entry = service("user-service", &free_addr());
    entry.on_timeout = TimeoutPolicy::Propagate;
    let services = vec![entry, service("order-service", &blocked_addr)];
    let topology = ChainTopology::new(services.clone()).unwrap();
    let recorder = fast_recorder(&store);
    let sink: Arc<dyn PersistenceSink> = Arc::new(StoreSink::new(store.clone()));

    let state = make_state(
        &services[0],
        &topology,
        &recorder,
        sink,
        None,
        Duration::from_millis(300),
    );
    let addr = spawn_service(state).await.unwrap();
    wait_ready(&addr.to_string()).await;

    let (status, body) = post_process(
        &addr.to_string(),
        json!({"user_id": 1001, "action": "checkout"}),
        None,
    )
    .await;

    assert_eq!(status, 504);
    assert_eq!(body["status"], "error");
    // Even a failed chain hands the caller its trace id.
    response_trace_id(&body);
    drop(blocked);
}

#[tokio::test]
async fn invalid_entry_request_is_a_traced_400() {
    let store = Store::open_in_memory().unwrap();
    let services = vec![service("user-service", &free_addr())];
    let topology = ChainTopology::new(services.clone()).unwrap();
    let recorder = fast_recorder(&store);
    let sink: Arc<dyn PersistenceSink> = Arc::new(StoreSink::new(store.clone()));

    let state = make_state(
        &services[0],
        &topology,
        &recorder,
        sink,
        Some(store.clone()),
        Duration::from_secs(1),
    );
    let addr = spawn_service(state).await.unwrap();
    wait_ready(&addr.to_string()).await;

    let (status, body) = post_process(&addr.to_string(), json!({}), None).await;

    assert_eq!(status, 400);
    assert_eq!(body["status"], "error");
    assert!(body["message"].as_str().unwrap().contains("user_id"));
    let trace = response_trace_id(&body);

    wait_until(
        || !store.records_for_trace(trace.as_str()).unwrap().is_empty(),
        "record for rejected request",
    )
    .await;
    let records = store.records_for_trace(trace.as_str()).unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].response_json.contains("\"error\""));

    wait_until(
        || !store.spans_for_trace(trace.as_str()).unwrap().is_empty(),
        "span for rejected request",
    )
    .await;
    let spans = store.spans_for_trace(trace.as_str()).unwrap();
    assert!(spans[0].status.is_error());
}

#[tokio::test]
async fn malformed_context_header_starts_a_fresh_trace() {
    let store = Store::open_in_memory().unwrap();
    let services = vec![service("user-service", &free_addr())];
    let topology = ChainTopology::new(services.clone()).unwrap();
    let recorder = fast_recorder(&store);
    let sink: Arc<dyn PersistenceSink> = Arc::new(StoreSink::new(store.clone()));

    let state = make_state(
        &services[0],
        &topology,
        &recorder,
        sink,
        None,
        Duration::from_secs(1),
    );
    let addr = spawn_service(state).await.unwrap();
    wait_ready(&addr.to_string()).await;

    let (status, body) = post_process(
        &addr.to_string(),
        json!({"user_id": 1001, "action": "checkout"}),
        Some("definitely-not-a-traceparent"),
    )
    .await;
    assert_eq!(status, 200);
    response_trace_id(&body);

    // A well-formed header is adopted: same trace id, parented span.
    let upstream = TraceContext::decode("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
        .unwrap();
    let (status, body) = post_process(
        &addr.to_string(),
        json!({"user_id": 1001, "action": "checkout"}),
        Some(&upstream.encode()),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["trace_id"], "4bf92f3577b34da6a3ce929d0e0e4736");

    wait_until(
        || !store.spans_for_trace("4bf92f3577b34da6a3ce929d0e0e4736").unwrap().is_empty(),
        "span for adopted context",
    )
    .await;
    let spans = store.spans_for_trace("4bf92f3577b34da6a3ce929d0e0e4736").unwrap();
    assert_eq!(
        spans[0].parent_span_id.as_ref().map(|p| p.as_str()),
        Some("00f067aa0ba902b7")
    );
}

async fn spawn_user_audit_chain(
    store: &Store,
    entry_policy: DownstreamPolicy,
) -> (String, TraceId) {
    let services = vec![
        {
            let mut svc = service("user-service", &free_addr());
            svc.on_downstream_error = entry_policy;
            svc
        },
        service("audit-service", &free_addr()),
    ];
    let topology = ChainTopology::new(services.clone()).unwrap();
    let recorder = fast_recorder(store);
    let sink: Arc<dyn PersistenceSink> = Arc::new(StoreSink::new(store.clone()));

    let entry_state = make_state(
        &services[0],
        &topology,
        &recorder,
        sink.clone(),
        None,
        Duration::from_secs(1),
    );
    let audit_state = make_state(
        &services[1],
        &topology,
        &recorder,
        sink,
        None,
        Duration::from_secs(1),
    );
    let entry_addr = spawn_service(entry_state).await.unwrap().to_string();
    let audit_addr = spawn_service(audit_state).await.unwrap().to_string();
    wait_ready(&entry_addr).await;
    wait_ready(&audit_addr).await;

    // The user hop never produces order fields, so the audit hop rejects
    // the request with a 400 and the entry's policy decides what happens.
    let (status, body) = post_process(
        &entry_addr,
        json!({"user_id": 1001, "action": "checkout"}),
        None,
    )
    .await;
    let trace = response_trace_id(&body);
    match entry_policy {
        DownstreamPolicy::Propagate => {
            assert_eq!(status, 502);
            assert_eq!(body["status"], "error");
            assert!(body["message"].as_str().unwrap().contains("order_id"));
        }
        DownstreamPolicy::Absorb => {
            assert_eq!(status, 200);
            assert_eq!(body["status"], "ok");
            assert!(body["message"].as_str().unwrap().contains("absorbed"));
            assert_eq!(body["data"]["fallback_applied"], true);
        }
    }
    (entry_addr, trace)
}

#[tokio::test]
async fn downstream_rejection_propagates_as_bad_gateway() {
    let store = Store::open_in_memory().unwrap();
    let (_, trace) = spawn_user_audit_chain(&store, DownstreamPolicy::Propagate).await;

    // Both hops persisted their view of the request.
    wait_until(
        || store.records_for_trace(trace.as_str()).unwrap().len() == 2,
        "records from both hops",
    )
    .await;
    let records = store.records_for_trace(trace.as_str()).unwrap();
    let services: Vec<&str> = records.iter().map(|r| r.service.as_str()).collect();
    assert_eq!(services, ["user-service", "audit-service"]);

    wait_until(
        || store.spans_for_trace(trace.as_str()).unwrap().len() == 2,
        "spans from both hops",
    )
    .await;
    let spans = store.spans_for_trace(trace.as_str()).unwrap();
    assert!(spans.iter().all(|s| s.status.is_error()));
}

#[tokio::test]
async fn downstream_rejection_can_be_absorbed() {
    let store = Store::open_in_memory().unwrap();
    let (_, trace) = spawn_user_audit_chain(&store, DownstreamPolicy::Absorb).await;

    wait_until(
        || store.spans_for_trace(trace.as_str()).unwrap().len() == 2,
        "spans from both hops",
    )
    .await;
    let spans = store.spans_for_trace(trace.as_str()).unwrap();
    let entry_span = spans.iter().find(|s| s.service == "user-service").unwrap();
    let audit_span = spans.iter().find(|s| s.service == "audit-service").unwrap();
    // The absorbing hop reports OK; the failure stays visible downstream.
    assert!(!entry_span.status.is_error());
    assert!(audit_span.status.is_error());
}

struct FailingSink;

impl PersistenceSink for FailingSink {
    fn record(&self, _record: &TraceRecord) -> Result<()> {
        Err(HoplineError::Persistence("disk full".into()))
    }
}

#[tokio::test]
async fn persistence_failure_never_changes_the_response() {
    let store = Store::open_in_memory().unwrap();
    let services = vec![service("user-service", &free_addr())];
    let topology = ChainTopology::new(services.clone()).unwrap();
    let recorder = fast_recorder(&store);

    let state = make_state(
        &services[0],
        &topology,
        &recorder,
        Arc::new(FailingSink),
        None,
        Duration::from_secs(1),
    );
    let addr = spawn_service(state).await.unwrap();
    wait_ready(&addr.to_string()).await;

    let (status, body) = post_process(
        &addr.to_string(),
        json!({"user_id": 1001, "action": "checkout"}),
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    let trace = response_trace_id(&body);

    let (status, body) = post_process(&addr.to_string(), json!({}), None).await;
    assert_eq!(status, 400);
    assert_eq!(body["status"], "error");

    // Nothing was durably recorded, and nothing leaked into the responses.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.records_for_trace(trace.as_str()).unwrap().is_empty());
}

#[tokio::test]
async fn health_and_info_have_no_tracing_side_effects() {
    let store = Store::open_in_memory().unwrap();
    let services = vec![service("user-service", &free_addr())];
    let topology = ChainTopology::new(services.clone()).unwrap();
    let recorder = fast_recorder(&store);
    let sink: Arc<dyn PersistenceSink> = Arc::new(StoreSink::new(store.clone()));

    let state = make_state(
        &services[0],
        &topology,
        &recorder,
        sink,
        Some(store.clone()),
        Duration::from_secs(1),
    );
    let addr = spawn_service(state).await.unwrap();
    wait_ready(&addr.to_string()).await;

    let client = reqwest::Client::new();
    let health: Value = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health, json!({"status": "ok", "service": "user-service"}));

    let info: Value = client
        .get(format!("http://{addr}/"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["service"], "user-service");
    assert_eq!(info["role"], "entry");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = store.status().unwrap();
    assert_eq!(status.trace_record_count, 0);
    assert_eq!(status.span_count, 0);
}

#[tokio::test]
async fn terminal_service_answers_trace_queries() {
    let store = Store::open_in_memory().unwrap();
    let services = vec![service("user-service", &free_addr())];
    let topology = ChainTopology::new(services.clone()).unwrap();
    let recorder = fast_recorder(&store);
    let sink: Arc<dyn PersistenceSink> = Arc::new(StoreSink::new(store.clone()));

    let state = make_state(
        &services[0],
        &topology,
        &recorder,
        sink,
        Some(store.clone()),
        Duration::from_secs(1),
    );
    let addr = spawn_service(state).await.unwrap();
    wait_ready(&addr.to_string()).await;

    let (_, body) = post_process(
        &addr.to_string(),
        json!({"user_id": 1001, "action": "checkout"}),
        None,
    )
    .await;
    let trace = response_trace_id(&body);
    wait_until(
        || !store.records_for_trace(trace.as_str()).unwrap().is_empty(),
        "persisted record",
    )
    .await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/traces/{}", trace.as_str()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let listing: Value = resp.json().await.unwrap();
    assert_eq!(listing["count"], 1);
    assert_eq!(listing["records"][0]["service"], "user-service");

    let resp = client
        .get(format!("http://{addr}/traces"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let recent: Value = resp.json().await.unwrap();
    assert!(recent["count"].as_u64().unwrap() >= 1);

    let resp = client
        .get(format!("http://{addr}/traces/ffffffffffffffffffffffffffffffff"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}
