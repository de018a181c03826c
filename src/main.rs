use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use nl_sqlgate::audit::AuditLog;
use nl_sqlgate::config::{AppConfig, CliArgs};
use nl_sqlgate::db::executor::QueryExecutor;
use nl_sqlgate::db::schema_manager::SchemaManager;
use nl_sqlgate::llm::LlmManager;
use nl_sqlgate::pipeline::NlQueryPipeline;
use nl_sqlgate::safety::{SafetyGate, TableAllowList};
use nl_sqlgate::util::logging::init_tracing;
use nl_sqlgate::web;
use nl_sqlgate::web::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    init_tracing();

    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // The allow-list is fixed for the life of the process
    let allow_list = match TableAllowList::from_config(&config.databases) {
        Ok(list) => Arc::new(list),
        Err(e) => {
            error!("Invalid table allow-list: {}", e);
            return Err(e.into());
        }
    };

    let gate = Arc::new(SafetyGate::from_config(&config.safety, allow_list.clone()));
    info!(
        "SQL safety gate ready (dialect: {}, structural check: {})",
        config.safety.dialect,
        gate.structural_enabled()
    );

    info!("Opening {} database(s)", config.databases.len());
    let executor = Arc::new(QueryExecutor::from_config(&config, allow_list.clone()));

    info!("Initializing schema cache");
    let schema = Arc::new(SchemaManager::new(allow_list));
    schema.refresh_cache(&executor).await;

    info!("Initializing LLM manager with backend: {}", config.llm.backend);
    let llm_manager = LlmManager::new(&config.llm)?;

    let audit = match AuditLog::open(&config.audit.path).await {
        Ok(log) => Some(Arc::new(log)),
        Err(e) => {
            warn!("Audit log disabled, cannot open {}: {}", config.audit.path.display(), e);
            None
        }
    };

    let mut pipeline = NlQueryPipeline::new(gate, llm_manager.generator(), executor, schema)
        .with_max_repair_attempts(config.safety.max_repair_attempts)
        .with_request_timeout(Duration::from_secs(config.safety.request_timeout_secs));
    if let Some(audit) = &audit {
        pipeline = pipeline.with_audit(audit.clone());
    }

    let app_state = Arc::new(AppState::new(
        config.clone(),
        Arc::new(pipeline),
        audit,
        llm_manager.backend(),
    ));

    // Start the web server
    info!("Starting nl-sqlgate on {}:{}", config.web.host, config.web.port);
    match web::run_server(config.web, app_state).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}
