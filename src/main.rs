//! Interaction Engine — behavioral scoring and intervention dispatch
//! service. Wires the evaluation pipeline behind two WebSocket surfaces
//! (widget, dashboard) plus health/metrics, and drives the idle-session
//! sweep and drift job scheduler in the background.

use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use interaction_engine::batcher::{EventBatcher, FlushSink};
use interaction_engine::clock::{Clock, SystemClock};
use interaction_engine::config::EngineConfig;
use interaction_engine::config_store::ConfigStore;
use interaction_engine::decision::{DecisionWriter, InterventionBroadcaster, TrainingSink};
use interaction_engine::drift::JobRunner;
use interaction_engine::evaluation::{EvaluationConfig, EvaluationCoordinator, LlmAnalyst, ShadowSink, StubLlmAnalyst};
use interaction_engine::experiments::ExperimentResolver;
use interaction_engine::friction::{FrictionCatalog, StaticFrictionCatalog};
use interaction_engine::ingest::Ingestor;
use interaction_engine::middleware::{request_logging, RateLimitConfig, RateLimitLayer};
use interaction_engine::models::{Id, InterventionStatus};
use interaction_engine::session::SessionStore;
use interaction_engine::shadow::ShadowComparator;
use interaction_engine::store::{SqliteStore, Store};
use interaction_engine::training::TrainingSnapshotter;
use interaction_engine::transport::{handle_dashboard_socket, handle_widget_socket, Channel, ChannelRegistry, DashboardFrame, WidgetFrame};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct AppState {
    ingestor: Arc<Ingestor>,
    decision: Arc<DecisionWriter>,
    registry: Arc<ChannelRegistry>,
    configs: Arc<ConfigStore>,
}

/// Bridges the per-session batch flush to the evaluation/decision pipeline.
struct EvaluationFlushSink {
    evaluation: Arc<EvaluationCoordinator>,
    decision: Arc<DecisionWriter>,
}

#[async_trait::async_trait]
impl FlushSink for EvaluationFlushSink {
    async fn on_flush(&self, session_id: Id, event_ids: Vec<Id>) {
        match self.evaluation.evaluate_event_batch(&session_id, &event_ids).await {
            Ok(Some(evaluation)) => {
                if let Err(err) = self.decision.fire_if_needed(&evaluation).await {
                    error!(session_id = %session_id, ?err, "failed to write intervention");
                }
            }
            Ok(None) => {}
            Err(err) => error!(session_id = %session_id, ?err, "evaluation failed"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::load().context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install prometheus recorder")?;

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.db_path).context("failed to open database")?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let friction_catalog: Arc<dyn FrictionCatalog> = Arc::new(StaticFrictionCatalog);

    let sessions = Arc::new(SessionStore::new(store.clone(), clock.clone()));
    let configs = Arc::new(ConfigStore::new(store.clone()));
    let experiments = Arc::new(ExperimentResolver::new(store.clone(), config.experiments.enabled));
    let registry = Arc::new(ChannelRegistry::new());
    let training = Arc::new(TrainingSnapshotter::new(store.clone(), clock.clone()));
    let decision = Arc::new(DecisionWriter::new(
        store.clone(),
        sessions.clone(),
        clock.clone(),
        registry.clone() as Arc<dyn InterventionBroadcaster>,
        training as Arc<dyn TrainingSink>,
    ));
    let shadow = Arc::new(ShadowComparator::new(store.clone(), clock.clone(), friction_catalog.clone()));

    // No LLM provider wire format is part of this service's own contract;
    // the stub synthesizes deterministic signals from context so `auto`
    // and `llm` engine modes degrade gracefully until a real analyst client
    // is wired in here.
    let analyst: Arc<dyn LlmAnalyst> = Arc::new(StubLlmAnalyst);

    let evaluation = Arc::new(EvaluationCoordinator::new(
        store.clone(),
        clock.clone(),
        configs.clone(),
        experiments,
        friction_catalog,
        analyst,
        shadow as Arc<dyn ShadowSink>,
        EvaluationConfig {
            max_context_events: config.evaluation.max_context_events,
            default_engine: config.evaluation.eval_engine,
            shadow_enabled: config.shadow.enabled,
            llm_timeout: Duration::from_millis(config.llm.timeout_ms),
        },
    ));

    let flush_sink = Arc::new(EvaluationFlushSink {
        evaluation,
        decision: decision.clone(),
    });
    let batcher = Arc::new(EventBatcher::new(
        flush_sink,
        config.evaluation.batch_interval_ms,
        config.evaluation.batch_max_events,
    ));
    let ingestor = Arc::new(Ingestor::new(store.clone(), sessions.clone(), batcher.clone(), registry.clone()));

    let job_runner = Arc::new(JobRunner::new(store.clone(), clock.clone(), config.drift.clone()));

    spawn_idle_sweeper(sessions);
    if !config.jobs.disable_scheduler {
        spawn_drift_scheduler(job_runner);
    } else {
        info!("background job scheduler disabled by configuration");
    }

    let state = Arc::new(AppState {
        ingestor,
        decision,
        registry,
        configs,
    });

    let rate_limit = RateLimitLayer::new(RateLimitConfig::default());

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(move || metrics_handler(prometheus.clone())))
        .route("/ws/widget", get(widget_ws_handler))
        .route("/ws/dashboard", get(dashboard_ws_handler))
        .layer(axum::middleware::from_fn(request_logging))
        .layer(axum::middleware::from_fn_with_state(
            rate_limit,
            interaction_engine::middleware::rate_limit::rate_limit_middleware,
        ))
        // The widget script runs embedded on arbitrary customer storefronts,
        // so the origin is never known ahead of time.
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await.context("failed to bind listener")?;
    info!(%addr, "interaction engine listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(batcher))
    .await
    .context("server error")?;

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics_handler(handle: PrometheusHandle) -> impl IntoResponse {
    handle.render()
}

#[derive(serde::Deserialize)]
struct WidgetQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<Id>,
}

async fn widget_ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WidgetQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let registry = state.registry.clone();
        let reply_registry = state.registry.clone();
        let ingestor = state.ingestor.clone();
        let decision = state.decision.clone();
        handle_widget_socket(socket, registry, query.session_id, move |frame, connection_id| {
            let ingestor = ingestor.clone();
            let decision = decision.clone();
            let registry = reply_registry.clone();
            async move {
                match frame {
                    WidgetFrame::Track { body } => match ingestor.handle_track(&body).await {
                        Ok(ack) => registry.send_to(
                            Channel::Widget,
                            connection_id,
                            &serde_json::json!({
                                "type": "track_ack",
                                "sessionId": ack.session_id,
                                "eventId": ack.event_id,
                            }),
                        ),
                        Err(err) => warn!(?err, "failed to ingest track frame"),
                    },
                    WidgetFrame::Ping => {}
                    WidgetFrame::InterventionOutcome {
                        intervention_id,
                        status,
                        conversion_action,
                    } => {
                        let Some(status) = parse_status(&status) else {
                            warn!(status, "unknown intervention status in outcome frame");
                            return;
                        };
                        if let Err(err) = decision.record_outcome(&intervention_id, status, conversion_action).await {
                            warn!(?err, "failed to record intervention outcome");
                        }
                    }
                }
            }
        })
        .await;
    })
}

async fn dashboard_ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let registry = state.registry.clone();
        let configs = state.configs.clone();
        handle_dashboard_socket(socket, registry, move |frame| {
            let configs = configs.clone();
            async move {
                match frame {
                    DashboardFrame::SelectSession { session_id } => {
                        info!(session_id = %session_id, "dashboard selected session");
                    }
                    DashboardFrame::TuneWeights {
                        scoring_config_id,
                        weights,
                    } => {
                        if let Err(err) = apply_weight_tune(&configs, &scoring_config_id, weights).await {
                            warn!(?err, "failed to apply tuned weights");
                        }
                    }
                }
            }
        })
        .await;
    })
}

async fn apply_weight_tune(configs: &ConfigStore, scoring_config_id: &Id, weights: serde_json::Value) -> anyhow::Result<()> {
    let Some(mut config) = configs.get(scoring_config_id).await? else {
        anyhow::bail!("unknown scoring config {scoring_config_id}");
    };
    if let Ok(updated) = serde_json::from_value(weights) {
        config.weights = updated;
    }
    configs.activate(&config).await?;
    Ok(())
}

fn parse_status(raw: &str) -> Option<InterventionStatus> {
    match raw {
        "delivered" => Some(InterventionStatus::Delivered),
        "dismissed" => Some(InterventionStatus::Dismissed),
        "converted" => Some(InterventionStatus::Converted),
        "ignored" => Some(InterventionStatus::Ignored),
        _ => None,
    }
}

fn spawn_idle_sweeper(sessions: Arc<SessionStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5 * 60));
        loop {
            interval.tick().await;
            match sessions.sweep_idle().await {
                Ok(ended) if ended > 0 => info!(ended, "idle sweep ended sessions"),
                Ok(_) => {}
                Err(err) => warn!(?err, "idle sweep failed"),
            }
        }
    });
}

/// The configured `nightly_batch_cron` expression is carried through to
/// every `JobRun` for operator visibility, but this service has no
/// cron-parsing crate in its stack; drift checks run on a fixed hourly
/// cadence instead of honoring that expression directly.
fn spawn_drift_scheduler(job_runner: Arc<JobRunner>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60 * 60));
        loop {
            interval.tick().await;
            if let Err(err) = job_runner.run_drift_check(&[None], "scheduler").await {
                warn!(?err, "scheduled drift check failed");
            }
        }
    });
}

async fn shutdown_signal(batcher: Arc<EventBatcher>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, flushing pending batches");
    batcher.flush_all().await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("shutdown grace period elapsed");
}
