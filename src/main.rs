use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use protected_log::audit::{
    AnomalyAction, AnomalyActionDispatcher, JsonFileExportHandler, LogAction, LogAppender,
    LogExporter, LogVerifier, ScriptAction,
};
use protected_log::config::ProtectedLogConfig;
use protected_log::crypto::{EcdsaToken, TokenRegistry};
use protected_log::database::{LogStore, SqlLogStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "protected_log=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting protected log service");

    // Load configuration
    let config = ProtectedLogConfig::load()?;
    info!("Configuration loaded");

    // Initialize database
    let store = SqlLogStore::new(&config.database_url).await?;
    store.run_migrations().await?;
    info!("Database connected and migrated");
    let store: Arc<dyn LogStore> = Arc::new(store);

    // Protection token for this process lifetime
    let token = Arc::new(EcdsaToken::generate("node-token".to_string()));
    let tokens = Arc::new(TokenRegistry::new(token));
    info!("Protection token generated");

    // Anomaly actions: always log, optionally run a script
    let mut default_actions: Vec<Arc<dyn AnomalyAction>> = vec![Arc::new(LogAction)];
    if let Some(script) = &config.anomaly_script {
        default_actions.push(Arc::new(ScriptAction::new(script.clone())));
    }
    let actions =
        Arc::new(AnomalyActionDispatcher::new().with_default_actions(default_actions));

    let appender = Arc::new(LogAppender::new(
        store.clone(),
        tokens.clone(),
        actions.clone(),
        config.clone(),
    ));
    info!("Log appender ready (node id {})", appender.node_id().await);

    let verifier = Arc::new(LogVerifier::new(
        store.clone(),
        tokens.clone(),
        actions.clone(),
        &config,
    ));
    let exporter = Arc::new(LogExporter::new(
        store.clone(),
        actions.clone(),
        Arc::new(JsonFileExportHandler::new(PathBuf::from(
            &config.export_directory,
        ))),
        &config,
    ));

    // Scheduled verification task
    let verifier_task = verifier.clone();
    let verification_interval = Duration::from_secs(config.verification_interval_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(verification_interval);
        loop {
            interval.tick().await;
            if let Some(result) = verifier_task.run_if_not_busy().await {
                info!("Scheduled verification: {}", result.summary());
            }
        }
    });
    info!("Verification task started");

    // Scheduled export task
    if config.export_older_than_ms > 0 {
        let exporter_task = exporter.clone();
        let export_interval = Duration::from_secs(config.export_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(export_interval);
            loop {
                interval.tick().await;
                exporter_task.run_if_not_busy().await;
            }
        });
        info!("Export task started");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    verifier.cancel_permanently();
    exporter.cancel_permanently();
    if let Err(e) = appender.shutdown().await {
        error!("Failed to write shutdown marker: {}", e);
    }
    info!("Protected log service stopped");

    Ok(())
}
