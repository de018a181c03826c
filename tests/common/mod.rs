#![allow(dead_code)]

use async_trait::async_trait;
use nl_sqlgate::audit::AuditLog;
use nl_sqlgate::config::{DatabaseConfig, TableConfig};
use nl_sqlgate::db::executor::QueryExecutor;
use nl_sqlgate::db::schema_manager::SchemaManager;
use nl_sqlgate::llm::{LlmError, TextGenerator};
use nl_sqlgate::pipeline::NlQueryPipeline;
use nl_sqlgate::safety::{SafetyGate, SqlParserAnalyzer, TableAllowList};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const DATABASE: &str = "douyin_analytics";

/// Replays canned model responses and records the prompts it was given.
#[derive(Default)]
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(responses: Vec<Result<String, LlmError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn answering(sql: &[&str]) -> Self {
        Self::new(sql.iter().map(|s| Ok(format!("```sql\n{s}\n```"))).collect())
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::ResponseError("script exhausted".into())))
    }
}

pub fn seed_database(path: &Path) {
    let conn = duckdb::Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE douyin_products (id INTEGER, title VARCHAR, category VARCHAR, price DOUBLE, sales INTEGER);
         INSERT INTO douyin_products VALUES
             (1, 'Lipstick', 'beauty', 99.0, 1200),
             (2, 'Face mask', 'beauty', 59.0, 3400),
             (3, 'Phone case', 'digital', 29.0, 800),
             (4, 'Earbuds', 'digital', 199.0, 560);
         CREATE TABLE sales_summary (product_id INTEGER, total DOUBLE);
         INSERT INTO sales_summary VALUES (1, 118800.0), (2, 200600.0);
         CREATE TABLE internal_costs (product_id INTEGER, cost DOUBLE);",
    )
    .unwrap();
}

pub fn database_config(path: &Path) -> DatabaseConfig {
    let table = |name: &str, row_limit: Option<usize>| TableConfig {
        name: name.to_string(),
        description: String::new(),
        allowed_operations: vec!["SELECT".to_string(), "WITH".to_string()],
        row_limit,
    };
    DatabaseConfig {
        connection_string: path.to_string_lossy().to_string(),
        description: "test analytics".to_string(),
        read_only: true,
        pool_size: 2,
        tables: vec![table("douyin_products", Some(50_000)), table("sales_summary", Some(1_000))],
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub pipeline: Arc<NlQueryPipeline>,
    pub audit: Arc<AuditLog>,
    pub generator: Arc<ScriptedGenerator>,
}

pub async fn harness(generator: ScriptedGenerator) -> Harness {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("douyin.duckdb");
    seed_database(&db_path);

    let mut databases = HashMap::new();
    databases.insert(DATABASE.to_string(), database_config(&db_path));
    let allow_list = Arc::new(TableAllowList::from_config(&databases).unwrap());

    let gate = Arc::new(SafetyGate::new(
        allow_list.clone(),
        Box::new(SqlParserAnalyzer::new("duckdb").unwrap()),
    ));
    let mut executor = QueryExecutor::new(allow_list.clone(), 50_000);
    executor
        .add_database(DATABASE, &databases[DATABASE])
        .unwrap();
    let executor = Arc::new(executor);

    let schema = Arc::new(SchemaManager::new(allow_list));
    schema.refresh_cache(&executor).await;

    let audit = Arc::new(AuditLog::open(dir.path().join("logs/query_audit.log")).await.unwrap());
    let generator = Arc::new(generator);

    let pipeline = NlQueryPipeline::new(gate, generator.clone(), executor, schema)
        .with_audit(audit.clone());

    Harness {
        dir,
        pipeline: Arc::new(pipeline),
        audit,
        generator,
    }
}
