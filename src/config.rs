use clap::Parser;
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: String, // "ollama" or "remote"
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SafetyConfig {
    /// sqlparser dialect name used by the structural check
    pub dialect: String,
    /// Disable to run the gate on keyword checks alone
    pub structural_check: bool,
    pub max_repair_attempts: u32,
    pub max_query_length: usize,
    pub max_result_rows: usize,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct AuditConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TableConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_allowed_operations")]
    pub allowed_operations: Vec<String>,
    #[serde(default)]
    pub row_limit: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub connection_string: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_read_only")]
    pub read_only: bool,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub databases: HashMap<String, DatabaseConfig>,
}

#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Audit log file (JSON lines)
    #[arg(long, value_name = "FILE")]
    pub audit_log: Option<PathBuf>,
}

const DEFAULT_LOCATIONS: &[&str] = &[
    "config.toml",
    "config/config.toml",
    "/etc/nl-sqlgate/config.toml",
];

impl AppConfig {
    /// Loads defaults, then the config file, then `NL_SQLGATE__SECTION__KEY`
    /// environment variables, then command line overrides.
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config_builder = Config::builder();

        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else if let Some(location) = DEFAULT_LOCATIONS
            .iter()
            .find(|location| Path::new(location).exists())
        {
            config_builder = config_builder.add_source(File::new(location, FileFormat::Toml));
        }

        config_builder = config_builder.add_source(
            Environment::with_prefix("NL_SQLGATE")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        if let Some(host) = &args.host {
            config.web.host = host.clone();
        }
        if let Some(port) = args.port {
            config.web.port = port;
        }
        if let Some(audit_log) = &args.audit_log {
            config.audit.path = audit_log.clone();
        }

        Ok(config.with_default_databases())
    }

    /// Parses a TOML document on top of the built-in defaults.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(config.with_default_databases())
    }

    fn with_default_databases(mut self) -> Self {
        if self.databases.is_empty() {
            self.databases = default_databases();
        }
        self
    }
}

fn default_allowed_operations() -> Vec<String> {
    vec!["SELECT".to_string()]
}

fn default_read_only() -> bool {
    true
}

fn default_pool_size() -> u32 {
    4
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: "ollama".to_string(),
            model: "sqlcoder".to_string(),
            api_key: None,
            api_url: None,
            timeout_secs: 60,
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            dialect: "duckdb".to_string(),
            structural_check: true,
            max_repair_attempts: 3,
            max_query_length: 10_000,
            max_result_rows: 50_000,
            request_timeout_secs: 30,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logs/query_audit.log"),
        }
    }
}

fn table(name: &str, description: &str, operations: &[&str], row_limit: usize) -> TableConfig {
    TableConfig {
        name: name.to_string(),
        description: description.to_string(),
        allowed_operations: operations.iter().map(|op| op.to_string()).collect(),
        row_limit: Some(row_limit),
    }
}

/// The analytics warehouse and the assistant platform's own tables.
pub fn default_databases() -> HashMap<String, DatabaseConfig> {
    let mut databases = HashMap::new();
    databases.insert(
        "douyin_analytics".to_string(),
        DatabaseConfig {
            connection_string: "data/douyin_analytics.duckdb".to_string(),
            description: "Douyin e-commerce product and sales analytics".to_string(),
            read_only: true,
            pool_size: default_pool_size(),
            tables: vec![
                table(
                    "douyin_products",
                    "Product catalogue with price, sales and shop data",
                    &["SELECT", "WITH"],
                    50_000,
                ),
                table(
                    "sales_summary",
                    "Aggregated sales per product and period",
                    &["SELECT"],
                    1_000,
                ),
                table(
                    "product_trends",
                    "Daily product sales trends",
                    &["SELECT", "WITH"],
                    10_000,
                ),
                table(
                    "category_analysis",
                    "Sales and pricing statistics per category",
                    &["SELECT"],
                    5_000,
                ),
            ],
        },
    );
    databases.insert(
        "dify_system".to_string(),
        DatabaseConfig {
            connection_string: "data/dify_system.duckdb".to_string(),
            description: "Assistant platform conversations and apps".to_string(),
            read_only: true,
            pool_size: default_pool_size(),
            tables: vec![
                table("conversations", "Chat conversations", &["SELECT"], 1_000),
                table("messages", "Messages within conversations", &["SELECT"], 5_000),
                table("apps", "Configured assistant apps", &["SELECT"], 100),
            ],
        },
    );
    databases
}
