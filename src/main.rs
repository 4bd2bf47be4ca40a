use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use hire_flow::api::{AppState, api_routes};
use hire_flow::channels::{
    BroadcastNotifier, EmailConfig, EmailNotifier, FanoutNotifier, LogNotifier, Notifier,
    PollerStatus, SmtpConfig, spawn_email_poller,
};
use hire_flow::config::{EngineConfig, ServerConfig};
use hire_flow::llm::{LlmConfig, create_provider};
use hire_flow::pipeline::InboundMatcher;
use hire_flow::pipeline::event_processor::spawn_event_processor;
use hire_flow::store::{Database, LibSqlBackend};
use hire_flow::workflow::model::StepType;
use hire_flow::workflow::{
    ApprovalGate, AutoApproveExecutor, ExecutorRegistry, LlmStepExecutor, PassRunner,
    ProgressionController, StepExecutor, StepGateway, WorkflowCatalog, dispatch_channel,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let server = ServerConfig::from_env();
    let _log_guard = init_tracing(&server);
    let engine = EngineConfig::from_env().context("invalid engine configuration")?;

    eprintln!("hire-flow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api", server.port);
    eprintln!("   Approval feed: ws://0.0.0.0:{}/ws/approvals", server.port);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&server.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", server.db_path.display()))?,
    );
    eprintln!("   Database: {}", server.db_path.display());

    // ── Catalog ──────────────────────────────────────────────────────────
    let catalog = Arc::new(WorkflowCatalog::new(Arc::clone(&db)));
    if let Some(path) = &server.catalog_path {
        let report = catalog
            .seed_from_file(path)
            .await
            .with_context(|| format!("failed to seed catalog from {}", path.display()))?;
        eprintln!(
            "   Catalog: {} steps, {} templates, {} jobs",
            report.steps, report.templates, report.jobs
        );
    }

    // ── Notifications ────────────────────────────────────────────────────
    let approvals_feed = Arc::new(BroadcastNotifier::new(256));
    let mut notifiers: Vec<Arc<dyn Notifier>> =
        vec![Arc::new(LogNotifier), approvals_feed.clone()];
    if let Some(smtp) = SmtpConfig::from_env() {
        eprintln!("   Approver email: {}", smtp.host);
        notifiers.push(Arc::new(EmailNotifier::new(smtp)));
    }
    let notifier: Arc<dyn Notifier> = Arc::new(FanoutNotifier::new(notifiers));

    // ── Step executors ───────────────────────────────────────────────────
    let registry = Arc::new(ExecutorRegistry::new());
    let auto_approve: Arc<dyn StepExecutor> = Arc::new(AutoApproveExecutor);
    registry
        .register(StepType::Informational, Arc::clone(&auto_approve))
        .await;
    match LlmConfig::from_env() {
        Some(llm_config) => {
            let llm = create_provider(&llm_config).context("failed to create LLM provider")?;
            eprintln!("   Executor: {} (fallback)", llm.model_name());
            registry.set_fallback(Arc::new(LlmStepExecutor::new(llm))).await;
        }
        None => {
            eprintln!("   Executor: auto-approve (ANTHROPIC_API_KEY not set)");
            registry.set_fallback(auto_approve).await;
        }
    }
    let gateway = Arc::new(StepGateway::new(
        registry,
        engine.executor_timeout,
        engine.failure_policy.clone(),
    ));

    // ── Engine ───────────────────────────────────────────────────────────
    let (dispatcher, queue) = dispatch_channel();
    let gate = Arc::new(ApprovalGate::new(
        Arc::clone(&db),
        notifier,
        dispatcher.clone(),
    ));
    let controller: Arc<dyn PassRunner> = Arc::new(ProgressionController::new(
        Arc::clone(&db),
        Arc::clone(&catalog),
        Arc::clone(&gate),
        gateway,
        engine.clone(),
    ));
    let _router = queue.start(controller, engine.max_concurrent_passes);

    let matcher = Arc::new(InboundMatcher::new(
        Arc::clone(&db),
        Arc::clone(&catalog),
        dispatcher.clone(),
    ));

    // ── Background tasks ─────────────────────────────────────────────────
    let (_sweep_handle, sweep_shutdown) = spawn_event_processor(
        Arc::clone(&db),
        Arc::clone(&matcher),
        engine.event_process_interval,
    );

    let poller = Arc::new(PollerStatus::new());
    let poller_shutdown = match EmailConfig::from_env() {
        Some(email_config) => {
            eprintln!("   Mailbox: {} ({})", email_config.imap_host, email_config.mailbox);
            let (_handle, flag) =
                spawn_email_poller(email_config, Arc::clone(&matcher), Arc::clone(&poller));
            Some(flag)
        }
        None => {
            eprintln!("   Mailbox: disabled (EMAIL_IMAP_HOST not set)");
            None
        }
    };

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api_routes(AppState {
        db,
        matcher,
        gate,
        dispatcher,
        approvals_feed,
        poller,
    });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", server.port))
        .await
        .with_context(|| format!("failed to bind port {}", server.port))?;
    tracing::info!(port = server.port, "API server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .context("API server failed")?;

    sweep_shutdown.store(true, Ordering::Relaxed);
    if let Some(flag) = poller_shutdown {
        flag.store(true, Ordering::Relaxed);
    }
    Ok(())
}

/// Stderr logging, plus daily rolling files when a log directory is set.
fn init_tracing(server: &ServerConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match &server.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "hire-flow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter())
                .with(stderr)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter())
                .with(stderr)
                .init();
            None
        }
    }
}
