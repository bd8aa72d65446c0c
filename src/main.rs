use std::sync::Arc;

use anyhow::Context;

use site_trace::analysis::{DisabledEmbedder, Embedder, OpenAiEmbedder};
use site_trace::api::{AppState, api_routes};
use site_trace::changes::{ActionTokenService, Workflow};
use site_trace::config::{LlmSettings, PipelineConfig, ServerConfig};
use site_trace::ingest::{IngestService, ProjectRouter};
use site_trace::llm::{LlmBackend, LlmConfig, create_provider};
use site_trace::notify::{Dispatcher, EventBus, LogSink, spawn_dispatcher};
use site_trace::pipeline::{AnalysisPhases, Orchestrator};
use site_trace::store::{Database, LibSqlBackend};
use site_trace::worker::{self, DEFAULT_QUEUE_CAPACITY, JobRunner, ProcessingQueue};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let pipeline_config = PipelineConfig::from_env()?;
    let llm_settings = LlmSettings::from_env()?;
    let server_config = ServerConfig::from_env()?;

    eprintln!("🏗️  Site Trace v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm_settings.model);
    eprintln!("   API: http://0.0.0.0:{}/api", server_config.port);

    // ── LLM + embeddings ────────────────────────────────────────────────
    let llm = create_provider(&LlmConfig {
        backend: LlmBackend::Anthropic,
        api_key: llm_settings.anthropic_api_key.clone(),
        model: llm_settings.model.clone(),
    })?;

    let embedder: Arc<dyn Embedder> = match llm_settings.openai_api_key.clone() {
        Some(key) => {
            eprintln!("   Embeddings: enabled");
            Arc::new(OpenAiEmbedder::new(key)?)
        }
        None => {
            eprintln!("   Embeddings: disabled (OPENAI_API_KEY not set)");
            Arc::new(DisabledEmbedder)
        }
    };

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&server_config.db_path)
            .await
            .with_context(|| {
                format!(
                    "failed to open database at {}",
                    server_config.db_path.display()
                )
            })?,
    );
    eprintln!("   Database: {}", server_config.db_path.display());

    // ── Notifications ───────────────────────────────────────────────────
    let bus = EventBus::new();
    let tokens = ActionTokenService::new(Arc::clone(&db), pipeline_config.action_token_ttl);
    let _dispatcher = spawn_dispatcher(
        &bus,
        Dispatcher::new(tokens.clone(), Arc::new(LogSink), &server_config.public_url),
    );

    // ── Pipeline + worker ───────────────────────────────────────────────
    let orchestrator = Orchestrator::new(
        Arc::clone(&db),
        AnalysisPhases::from_llm(llm.clone(), &pipeline_config),
        embedder,
        bus.clone(),
        pipeline_config.clone(),
    );
    let runner = Arc::new(JobRunner::new(
        Arc::clone(&db),
        Arc::new(orchestrator),
        bus.clone(),
        &pipeline_config,
    ));
    let (queue, rx) = ProcessingQueue::new(DEFAULT_QUEUE_CAPACITY);
    let _worker = worker::spawn_worker(runner, rx, pipeline_config.worker_concurrency);

    // ── Startup recovery ────────────────────────────────────────────────
    let recovered = worker::recover_pending(db.as_ref(), &queue).await?;
    if recovered > 0 {
        eprintln!("   Recovered {} pending ingest events", recovered);
    }

    // ── HTTP ─────────────────────────────────────────────────────────────
    let state = AppState {
        ingest: IngestService::new(Arc::clone(&db), queue, ProjectRouter::with_llm(llm)),
        workflow: Workflow::new(Arc::clone(&db), tokens, bus),
    };
    let app = api_routes(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", server_config.port))
        .await
        .with_context(|| format!("failed to bind port {}", server_config.port))?;
    tracing::info!(port = server_config.port, "HTTP server started");
    axum::serve(listener, app).await?;

    Ok(())
}
