use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

const SCHEMA: &str = include_str!("../../../config/config.schema.json");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
    #[error("missing credential: environment variable {0} is not set")]
    MissingCredential(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub telegram: Telegram,
    #[serde(default)]
    pub mcp: Mcp,
    #[serde(default)]
    pub approvals: Approvals,
    #[serde(default)]
    pub outbound: Outbound,
    #[serde(default)]
    pub prompts: Prompts,
    #[serde(default)]
    pub artifacts: Artifacts,
    #[serde(default)]
    pub tasks: Tasks,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Telegram {
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,
    pub authorized_chat_ids: Vec<i64>,
    #[serde(default)]
    pub primary_chat_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum McpTransport {
    Stdio,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mcp {
    #[serde(default = "default_transport")]
    pub transport: McpTransport,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_server_name")]
    pub server_name: String,
}

impl Default for Mcp {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            listen_addr: default_listen_addr(),
            server_name: default_server_name(),
        }
    }
}

/// What untagged plain text does when the conversation has a pending request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplyPolicy {
    LatestRequest,
    NewPrompt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approvals {
    /// 0 waits indefinitely.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_reply_policy")]
    pub untagged_reply_policy: ReplyPolicy,
}

impl Default for Approvals {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            untagged_reply_policy: default_reply_policy(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outbound {
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
}

impl Default for Outbound {
    fn default() -> Self {
        Self {
            retry_max_attempts: default_retry_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            kind: "memory".to_string(),
            sqlite_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompts {
    #[serde(default)]
    pub store: Store,
    #[serde(default = "default_wait_secs")]
    pub wait_default_secs: u64,
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            store: Store::default(),
            wait_default_secs: default_wait_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifacts {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_artifacts_path")]
    pub path: String,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl Default for Artifacts {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_artifacts_path(),
            extensions: default_extensions(),
            settle_ms: default_settle_ms(),
        }
    }
}

/// A markdown file whose saved contents are queued as a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tasks {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_task_file")]
    pub file: String,
    #[serde(default = "default_task_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for Tasks {
    fn default() -> Self {
        Self {
            enabled: false,
            file: default_task_file(),
            debounce_ms: default_task_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_bot_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".to_string()
}

fn default_transport() -> McpTransport {
    McpTransport::Stdio
}

fn default_listen_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_server_name() -> String {
    "telegram-bridge".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_reply_policy() -> ReplyPolicy {
    ReplyPolicy::LatestRequest
}

fn default_retry_max_attempts() -> usize {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_retry_backoff_max_ms() -> u64 {
    5_000
}

fn default_wait_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_artifacts_path() -> String {
    "~/.gemini/antigravity/artifacts".to_string()
}

fn default_extensions() -> Vec<String> {
    [
        ".png", ".jpg", ".jpeg", ".webp", ".gif", ".mp4", ".webm", ".mov",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_settle_ms() -> u64 {
    500
}

fn default_task_file() -> String {
    "~/telegram_tasks.md".to_string()
}

fn default_task_debounce_ms() -> u64 {
    1_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Explicit `primary_chat_id`, else the first authorized chat.
    pub fn primary_chat_id(&self) -> i64 {
        self.telegram
            .primary_chat_id
            .or_else(|| self.telegram.authorized_chat_ids.first().copied())
            .unwrap_or_default()
    }

    pub fn bot_token(&self) -> Result<String, ConfigError> {
        self.bot_token_with(|key| std::env::var(key).ok())
    }

    pub fn bot_token_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<String, ConfigError> {
        lookup(&self.telegram.bot_token_env)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::MissingCredential(self.telegram.bot_token_env.clone()))
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        expand_home(&self.artifacts.path)
    }

    pub fn task_file(&self) -> PathBuf {
        expand_home(&self.tasks.file)
    }

    pub fn sqlite_path(&self) -> Option<PathBuf> {
        self.prompts.store.sqlite_path.as_deref().map(expand_home)
    }
}

/// Expands a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    match path.strip_prefix("~/") {
        Some(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => PathBuf::from(path),
        },
        None => PathBuf::from(path),
    }
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(format!("{path}: {e}")))?;
    parse_and_validate(&config_text)
}

pub fn parse_and_validate(config_text: &str) -> Result<Config, ConfigError> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.telegram.authorized_chat_ids.is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "telegram.authorized_chat_ids must not be empty".to_string(),
        ));
    }
    if let Some(primary) = cfg.telegram.primary_chat_id {
        if !cfg.telegram.authorized_chat_ids.contains(&primary) {
            return Err(ConfigError::UnsupportedConfig(format!(
                "telegram.primary_chat_id={primary} is not in telegram.authorized_chat_ids"
            )));
        }
    }
    if cfg.mcp.transport == McpTransport::Http
        && cfg.mcp.listen_addr.parse::<std::net::SocketAddr>().is_err()
    {
        return Err(ConfigError::UnsupportedConfig(format!(
            "mcp.listen_addr={} is not a socket address",
            cfg.mcp.listen_addr
        )));
    }
    if cfg.outbound.retry_max_attempts == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "outbound.retry_max_attempts must be >= 1".to_string(),
        ));
    }
    if cfg.outbound.retry_backoff_max_ms < cfg.outbound.retry_backoff_ms {
        return Err(ConfigError::UnsupportedConfig(
            "outbound.retry_backoff_max_ms must be >= outbound.retry_backoff_ms".to_string(),
        ));
    }

    let store = &cfg.prompts.store;
    if store.kind != "memory" && store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "prompts.store.type={} is not implemented; supported: memory, sqlite",
            store.kind
        )));
    }
    if store.kind == "memory" && store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "prompts.store.sqlite_path is not supported when prompts.store.type=memory"
                .to_string(),
        ));
    }
    if store.kind == "sqlite"
        && store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "prompts.store.sqlite_path is required when prompts.store.type=sqlite".to_string(),
        ));
    }

    if cfg.artifacts.enabled && cfg.artifacts.extensions.is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "artifacts.extensions must not be empty when artifacts.enabled=true".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("herald-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
telegram:
  authorized_chat_ids: [1001, 1002]

mcp:
  transport: "stdio"

prompts:
  store:
    type: "memory"
"#
        .to_string()
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("base config should load");
        assert_eq!(cfg.telegram.bot_token_env, "TELEGRAM_BOT_TOKEN");
        assert_eq!(cfg.primary_chat_id(), 1001);
        assert_eq!(cfg.approvals.default_timeout_secs, 300);
        assert_eq!(
            cfg.approvals.untagged_reply_policy,
            ReplyPolicy::LatestRequest
        );
        assert_eq!(cfg.outbound.retry_max_attempts, 3);
        assert_eq!(cfg.prompts.wait_default_secs, 60);
        assert_eq!(cfg.mcp.server_name, "telegram-bridge");
        assert!(cfg.artifacts.extensions.contains(&".mov".to_string()));
        assert!(!cfg.tasks.enabled);
        assert_eq!(cfg.tasks.debounce_ms, 1_000);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn example_config_is_valid() {
        let text = include_str!("../../../config/example-config.yaml");
        let cfg = parse_and_validate(text).expect("example config should load");
        assert_eq!(cfg.mcp.transport, McpTransport::Stdio);
    }

    #[test]
    fn rejects_empty_allow_list() {
        let err = parse_and_validate(
            &base_yaml().replace("[1001, 1002]", "[]"),
        )
        .expect_err("empty allow-list must fail closed");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_primary_outside_allow_list() {
        let err = parse_and_validate(&base_yaml().replace(
            "authorized_chat_ids: [1001, 1002]",
            "authorized_chat_ids: [1001, 1002]\n  primary_chat_id: 7",
        ))
        .expect_err("primary must be authorized");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn explicit_primary_wins() {
        let cfg = parse_and_validate(&base_yaml().replace(
            "authorized_chat_ids: [1001, 1002]",
            "authorized_chat_ids: [1001, 1002]\n  primary_chat_id: 1002",
        ))
        .expect("primary inside allow-list");
        assert_eq!(cfg.primary_chat_id(), 1002);
    }

    #[test]
    fn supports_sqlite_store_type_with_path() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"sqlite\"\n    sqlite_path: \"./prompts.db\"",
        ));
        let cfg = load_and_validate(&path).expect("sqlite config should be accepted");
        assert_eq!(cfg.prompts.store.kind, "sqlite");
        assert_eq!(
            cfg.sqlite_path(),
            Some(PathBuf::from("./prompts.db"))
        );
    }

    #[test]
    fn rejects_sqlite_without_path() {
        let err = parse_and_validate(&base_yaml().replace("type: \"memory\"", "type: \"sqlite\""))
            .expect_err("sqlite needs a path");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn rejects_sqlite_path_even_when_memory() {
        let err = parse_and_validate(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"memory\"\n    sqlite_path: \"./prompts.db\"",
        ))
        .expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn rejects_unknown_keys_and_bad_policy() {
        let err = parse_and_validate(&format!("{}\nwebhook:\n  url: \"x\"\n", base_yaml()))
            .expect_err("unknown section");
        assert!(matches!(err, ConfigError::SchemaValidation(_)));

        let err = parse_and_validate(&format!(
            "{}\napprovals:\n  untagged_reply_policy: \"first_request\"\n",
            base_yaml()
        ))
        .expect_err("unknown policy");
        assert!(matches!(err, ConfigError::SchemaValidation(_)));
    }

    #[test]
    fn rejects_http_transport_with_bad_listen_addr() {
        let err = parse_and_validate(&base_yaml().replace(
            "transport: \"stdio\"",
            "transport: \"http\"\n  listen_addr: \"not-an-addr\"",
        ))
        .expect_err("bad listen addr");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn reports_missing_read_path() {
        let err = load_and_validate("/nonexistent/herald.yaml").expect_err("missing file");
        assert!(matches!(err, ConfigError::Read(_)));
    }

    #[test]
    fn bot_token_comes_from_named_variable() {
        let cfg = parse_and_validate(&base_yaml().replace(
            "authorized_chat_ids: [1001, 1002]",
            "authorized_chat_ids: [1001, 1002]\n  bot_token_env: \"HERALD_TEST_TOKEN\"",
        ))
        .expect("config");
        let token = cfg
            .bot_token_with(|key| (key == "HERALD_TEST_TOKEN").then(|| " 123:abc ".to_string()))
            .expect("token present");
        assert_eq!(token, "123:abc");

        let err = cfg
            .bot_token_with(|_| Some("   ".to_string()))
            .expect_err("blank token");
        assert!(matches!(err, ConfigError::MissingCredential(name) if name == "HERALD_TEST_TOKEN"));
    }

    #[test]
    fn expands_home_prefix() {
        let expanded = expand_home("~/artifacts");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("artifacts"));
        }
        assert_eq!(expand_home("/tmp/x"), PathBuf::from("/tmp/x"));
    }

    #[test]
    fn task_file_section_is_parsed_and_checked() {
        let yaml = format!(
            "{}\ntasks:\n  enabled: true\n  file: /tmp/herald/tasks.md\n  debounce_ms: 250\n",
            base_yaml()
        );
        let cfg = parse_and_validate(&yaml).expect("tasks section should load");
        assert!(cfg.tasks.enabled);
        assert_eq!(cfg.task_file(), PathBuf::from("/tmp/herald/tasks.md"));
        assert_eq!(cfg.tasks.debounce_ms, 250);

        let err = parse_and_validate(&format!("{}\ntasks:\n  file: \"\"\n", base_yaml()))
            .expect_err("empty task file path");
        assert!(matches!(err, ConfigError::SchemaValidation(_)));
    }
}
