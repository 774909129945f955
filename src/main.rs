use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mailpilot::api::{self, AppState};
use mailpilot::config::Config;
use mailpilot::llm::{self, LlmConfig};
use mailpilot::mail::{GmailClient, MailProvider};
use mailpilot::pipeline::{Classifier, DraftService, EmailProcessor, RetryQueue};
use mailpilot::retrieval::HttpRetrieval;
use mailpilot::scheduler;
use mailpilot::store::{LibSqlStore, RecordStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing: stderr always, rolling file when configured.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let (file_layer, _log_guard) = match std::env::var("MAILPILOT_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mailpilot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });
    let llm_config = LlmConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    eprintln!("📬 mailpilot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm_config.model);
    eprintln!("   Database: {}", config.db_path);
    eprintln!("   API: http://0.0.0.0:{}", config.http_port);
    eprintln!(
        "   Polling every {}s, retry sweep every {}s",
        config.poll_interval_secs, config.retry_interval_secs
    );

    // ── Components ──────────────────────────────────────────────────
    let store: Arc<dyn RecordStore> = Arc::new(
        LibSqlStore::new_local(std::path::Path::new(&config.db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {e}", config.db_path);
                std::process::exit(1);
            }),
    );

    let mailer: Arc<dyn MailProvider> = Arc::new(GmailClient::new(&config.mail));
    let llm = llm::create_provider(&llm_config)?;
    let retrieval = Arc::new(HttpRetrieval::new(&config.retrieval));

    let classifier = Arc::new(Classifier::new(llm, retrieval));
    let processor = Arc::new(EmailProcessor::new(
        Arc::clone(&mailer),
        Arc::clone(&classifier),
        Arc::clone(&store),
    ));
    let retries = Arc::new(RetryQueue::new(Arc::clone(&store), Arc::clone(&mailer)));
    let drafts = Arc::new(DraftService::new(
        Arc::clone(&store),
        Arc::clone(&mailer),
        Arc::clone(&classifier),
        Arc::clone(&retries),
    ));

    // ── First-run initialization ────────────────────────────────────
    // Marks pre-existing unread mail as seen so it is never auto-replied.
    match processor.initialize_system().await {
        Ok(0) => {}
        Ok(count) => eprintln!("   Marked {count} pre-existing emails as seen"),
        Err(e) => tracing::warn!("Initialization sweep failed (will retry next start): {e}"),
    }

    // ── Periodic triggers ───────────────────────────────────────────
    let (_poll_handle, _poll_shutdown) = scheduler::spawn_processing_loop(
        Arc::clone(&processor),
        Duration::from_secs(config.poll_interval_secs),
    );
    let (_retry_handle, _retry_shutdown) = scheduler::spawn_retry_loop(
        Arc::clone(&retries),
        Duration::from_secs(config.retry_interval_secs),
    );

    // ── HTTP surface ────────────────────────────────────────────────
    let app = api::router(AppState {
        store,
        mailer,
        processor,
        retries,
        drafts,
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port)).await?;
    tracing::info!(port = config.http_port, "API server started");
    axum::serve(listener, app).await?;

    Ok(())
}
