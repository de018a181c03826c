use crate::audit::AuditLog;
use crate::config::AppConfig;
use crate::pipeline::NlQueryPipeline;
use std::sync::Arc;

/// Shared application state for the web server
pub struct AppState {
    pub config: AppConfig,
    pub pipeline: Arc<NlQueryPipeline>,
    pub audit: Option<Arc<AuditLog>>,
    pub llm_backend: String,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        pipeline: Arc<NlQueryPipeline>,
        audit: Option<Arc<AuditLog>>,
        llm_backend: impl Into<String>,
    ) -> Self {
        Self {
            config,
            pipeline,
            audit,
            llm_backend: llm_backend.into(),
            startup_time: chrono::Utc::now(),
        }
    }
}
