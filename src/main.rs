use std::sync::Arc;

use anyhow::Context;

use lead_cadence::agent::{LeadProcessor, LlmDecisionService};
use lead_cadence::cadence::{self, CadenceEngine, CadenceTable};
use lead_cadence::channels::{
    Gateways, HttpVoiceGateway, NotificationSink, QueuedNotifier, SmtpConfig, SmtpEmailGateway,
    TelegramNotifier, TelegramNotifyConfig, TracingNotifier, TwilioConfig, TwilioSmsGateway,
    VoiceConfig,
};
use lead_cadence::config::{CadenceConfig, EngineConfig, GuardrailConfig};
use lead_cadence::crm::{CrmConfig, HttpCrmClient};
use lead_cadence::llm::{LlmConfig, create_provider};
use lead_cadence::safety::GuardrailValidator;
use lead_cadence::store::{Database, LibSqlBackend};
use lead_cadence::webhooks::{self, AppState, EventHandler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let _log_guard = init_tracing();

    eprintln!("📈 Lead Cadence v{}", env!("CARGO_PKG_VERSION"));

    // ── LLM ─────────────────────────────────────────────────────────────
    let llm_config = LlmConfig::from_env()?;
    let llm = create_provider(&llm_config)?;
    eprintln!("   Model: {}", llm_config.model);

    // ── Database ────────────────────────────────────────────────────────
    let db_path = std::env::var("LEAD_CADENCE_DB_PATH")
        .unwrap_or_else(|_| "./data/lead-cadence.db".to_string());
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&db_path))
            .await
            .with_context(|| format!("Failed to open database at {db_path}"))?,
    );
    eprintln!("   Database: {}", db_path);

    // ── Gateways ────────────────────────────────────────────────────────
    let mut gateways = Gateways::default();
    let mut active_channels = Vec::new();
    if let Some(config) = TwilioConfig::from_env() {
        gateways = gateways.with_sms(Arc::new(TwilioSmsGateway::new(config)));
        active_channels.push("sms");
    }
    if let Some(config) = SmtpConfig::from_env() {
        gateways = gateways.with_email(Arc::new(SmtpEmailGateway::new(config)));
        active_channels.push("email");
    }
    if let Some(config) = VoiceConfig::from_env() {
        gateways = gateways.with_voice(Arc::new(HttpVoiceGateway::new(config)));
        active_channels.push("voice");
    }
    if active_channels.is_empty() {
        tracing::warn!("No outbound gateway configured; every send will fail");
    }
    eprintln!("   Channels: {}", active_channels.join(", "));

    // ── Operator notifications ──────────────────────────────────────────
    let engine_config = EngineConfig::from_env();
    let sink: Arc<dyn NotificationSink> = match TelegramNotifyConfig::from_env() {
        Some(config) => {
            eprintln!("   Notifications: telegram");
            Arc::new(TelegramNotifier::new(config))
        }
        None => {
            eprintln!("   Notifications: log only");
            Arc::new(TracingNotifier)
        }
    };
    let (notifier, _notify_handle) = QueuedNotifier::spawn(sink, 256, engine_config.notify_timeout);

    // ── Processor + engine ──────────────────────────────────────────────
    let tick_interval = engine_config.tick_interval;
    let processor = Arc::new(LeadProcessor::new(
        Arc::clone(&db),
        Arc::new(LlmDecisionService::new(llm)),
        gateways,
        GuardrailValidator::new(GuardrailConfig::default()),
        Arc::new(notifier),
        CadenceTable::new(CadenceConfig::from_env()),
        engine_config,
    ));

    let engine = Arc::new(CadenceEngine::new(Arc::clone(&processor))?);
    let _ticker = cadence::spawn_ticker(Arc::clone(&engine), tick_interval);
    eprintln!("   Cadence: pass every {}s", tick_interval.as_secs());

    let mut events = EventHandler::new(Arc::clone(&processor));
    if let Some(config) = CrmConfig::from_env() {
        eprintln!("   CRM: {}", config.deals_url);
        events = events.with_crm(Arc::new(HttpCrmClient::new(config)));
    }

    // ── HTTP ────────────────────────────────────────────────────────────
    let port: u16 = std::env::var("LEAD_CADENCE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let app = webhooks::router(AppState {
        processor,
        events: Arc::new(events),
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;
    eprintln!("   HTTP: http://0.0.0.0:{}\n", port);
    tracing::info!(port, "Webhook server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}

/// Log to stderr, and additionally to a daily-rolling file when
/// `LEAD_CADENCE_LOG_DIR` is set. The returned guard flushes the file writer.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match std::env::var("LEAD_CADENCE_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "lead-cadence.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(file)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .init();
            None
        }
    }
}
