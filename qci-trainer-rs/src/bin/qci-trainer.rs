// qci-trainer-rs/src/bin/qci-trainer.rs
// Runs one training cycle over every agent in the call export.

use std::process::ExitCode;
use std::sync::Arc;

use llm_service::{LlmClient, LlmConfig};
use qci_trainer::{
    CallCatalog, CancelFlag, FileArtifactStore, RunOutcome, TrainerConfig, TrainingCycle,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter);

    let result = if json {
        subscriber
            .with(fmt::layer().json().flatten_event(true).with_current_span(true))
            .try_init()
    } else {
        subscriber.with(fmt::layer().with_target(true)).try_init()
    };
    if let Err(err) = result {
        eprintln!("logging already initialized: {}", err);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    config_rs::load_dotenv();

    let config = match TrainerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {}", err);
            return ExitCode::from(2);
        }
    };
    init_logging(config.log_json);

    let llm = match LlmClient::new(LlmConfig::from_env()) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            tracing::error!(error = %err, "completion service not configured");
            return ExitCode::from(2);
        }
    };

    let store = match FileArtifactStore::new(&config.store_path) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            tracing::error!(error = %err, path = %config.store_path.display(), "cannot open artifact store");
            return ExitCode::from(2);
        }
    };

    let mut catalog = match CallCatalog::load(&config.calls_path).await {
        Ok(catalog) => catalog,
        Err(err) => {
            tracing::error!(error = %err, "cannot load call export");
            return ExitCode::from(2);
        }
    };
    if let Some(dir) = &config.prompts_dir {
        catalog = catalog.with_prompts_dir(dir);
    }
    let catalog = Arc::new(catalog);

    let cancel = CancelFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current call");
            on_signal.cancel();
        }
    });

    tracing::info!(
        agents = catalog.agent_count(),
        store = %config.store_path.display(),
        "starting training cycle"
    );
    let cycle = TrainingCycle::new(llm, store, catalog.clone(), catalog, &config);
    let report = cycle.run_all(&cancel).await;

    println!(
        "Run {} {:?}: {}/{} agents fully optimized ({:.1}s)",
        report.run_id,
        report.outcome,
        report.overall.fully_optimized,
        report.overall.agents,
        report.duration_secs
    );
    println!("Next steps:");
    for step in &report.next_steps {
        println!("  - {}", step);
    }

    match report.outcome {
        RunOutcome::Aborted => ExitCode::FAILURE,
        RunOutcome::Completed | RunOutcome::Cancelled => ExitCode::SUCCESS,
    }
}
