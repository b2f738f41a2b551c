//! Demo run: simulates a short agent run and prints the resulting graph
//! snapshot and trace export as JSON.

use observer::bus::{handler_fn, EventBus};
use observer::observability::{format_cost, SpanKind, Tracer};
use observer::{GraphEventAdapter, LifecycleEmitter, ObserverConfig};
use serde_json::json;
use shared_types::EventType;
use tracing_subscriber::EnvFilter;

const SESSION_ID: &str = "demo-session";
const MODEL: &str = "gpt-4o-mini";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ObserverConfig::from_env()?;
    tracing::info!(
        max_graph_depth = config.max_graph_depth,
        backend = ?config.bus_backend,
        "Observer configuration loaded"
    );

    let bus = EventBus::start(config.bus_config()?).await?;
    let mut adapter = GraphEventAdapter::attach(&bus, SESSION_ID, config.max_graph_depth).await?;
    bus.subscribe(
        EventType::AgentError,
        handler_fn("error-log", |event| async move {
            tracing::error!(
                session_id = %event.session_id,
                error = ?event.str_field("error"),
                "Agent reported an error"
            );
            Ok(())
        }),
    )
    .await?;

    let emitter = LifecycleEmitter::new(bus.clone(), SESSION_ID);
    let mut tracer = Tracer::new(SESSION_ID, config.cost_aggregator());

    let task = "Find the three most recent releases of the project";
    tracer.start_trace(task);
    emitter.agent_start(task);

    let mut run = tracer.span("agent run", SpanKind::AgentRun, serde_json::Map::new());

    let step = emitter.node_start(1, Some("Plan how to find the releases page"), Some(MODEL));
    {
        let llm = emitter.llm_call_start(MODEL);
        let mut call = run.tracer().llm_span("plan", MODEL, serde_json::Map::new());
        call.record_llm_usage(MODEL, 1000, 500);
        call.set_output("plan", json!("open the releases page"));
        call.complete();
        emitter.llm_call_complete(&llm, true, 1000, 500);
    }
    emitter.node_complete(&step, true, Some(json!("plan ready")));

    let first = emitter.action_start("go_to_url", json!({"url": "https://example.com/releases"}), 1);
    let navigate = run.tracer().in_span(
        "go_to_url",
        SpanKind::BrowserAction,
        serde_json::Map::new(),
        |_| Err::<(), _>("timeout waiting for page"),
    );
    emitter.action_complete(&first, false, None, navigate.err());

    let retry = emitter.action_start("go_to_url", json!({"url": "https://example.com/releases"}), 2);
    run.tracer()
        .in_span("go_to_url (retry)", SpanKind::BrowserAction, serde_json::Map::new(), |_| {
            Ok::<_, String>(())
        })
        .ok();
    emitter.action_complete(&retry, true, Some(json!({"status": 200})), None);

    let result = json!(["v2.3.0", "v2.2.1", "v2.2.0"]);
    run.set_output("releases", result.clone());
    run.complete();
    emitter.agent_complete(true, Some(result.clone()));

    bus.drain().await?;

    let snapshot = adapter.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    if let Some(trace) = tracer.end_trace(true, Some(result), None) {
        tracing::info!(
            cost = %format_cost(trace.total_cost_usd),
            llm_calls = trace.llm_call_count,
            actions = trace.action_count,
            "Demo run finished"
        );
        println!("{}", serde_json::to_string_pretty(&trace.export())?);
    }

    adapter.detach().await?;
    bus.close().await;
    Ok(())
}
