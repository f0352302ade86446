use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, Command};
use std::sync::Arc;
use tracing::info;

use protected_log::audit::{AnomalyActionDispatcher, LogAction, LogVerifier};
use protected_log::config::ProtectedLogConfig;
use protected_log::crypto::{TokenRegistry, UnprotectedToken};
use protected_log::database::{LogStore, SqlLogStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let matches = Command::new("verify-protected-log")
        .version("1.0.0")
        .about("Verify protected log hash chain and signature integrity")
        .arg(
            Arg::new("database-url")
                .short('d')
                .long("database-url")
                .value_name("URL")
                .help("Database URL holding the protected log (defaults to PROTECTEDLOG_DATABASE_URL)"),
        )
        .arg(
            Arg::new("first-failure")
                .short('f')
                .long("first-failure")
                .action(ArgAction::SetTrue)
                .help("Stop at the first detected failure"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Suppress output except errors"),
        )
        .get_matches();

    let quiet = matches.get_flag("quiet");
    let first_failure = matches.get_flag("first-failure");

    if quiet {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::ERROR)
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }

    let mut config = ProtectedLogConfig::load().map_err(|e| anyhow!(e))?;
    if let Some(url) = matches.get_one::<String>("database-url") {
        config.database_url = url.clone();
    }

    info!("Verifying protected log at {}", config.database_url);

    let store = SqlLogStore::new(&config.database_url).await?;
    store.run_migrations().await?;
    let store: Arc<dyn LogStore> = Arc::new(store);

    // The verifier needs the signing keys of every node whose rows it
    // inspects; this standalone tool cannot supply them, so signatures are
    // reported as produced by unknown tokens while chain links are still
    // fully checked.
    let tokens = Arc::new(TokenRegistry::new(Arc::new(UnprotectedToken)));
    let actions =
        Arc::new(AnomalyActionDispatcher::new().with_default_actions(vec![Arc::new(LogAction)]));

    let verifier = LogVerifier::new(store, tokens, actions, &config)
        .with_stop_at_first_failure(first_failure);

    let result = verifier
        .run_if_not_busy()
        .await
        .ok_or_else(|| anyhow!("verification did not run"))?;

    if !quiet {
        println!("{}", result.summary());
        for failure in &result.failures {
            match failure.identifier {
                Some(id) => println!("  {} at {}: {}", failure.cause, id, failure.detail),
                None => println!("  {}: {}", failure.cause, failure.detail),
            }
        }
    }

    if !result.is_valid() {
        std::process::exit(1);
    }

    if !quiet {
        println!("✓ Protected log verification completed successfully");
    }

    Ok(())
}
