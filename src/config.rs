//! TOML configuration with environment overrides.
//!
//! The file is optional: every section has defaults that reproduce the
//! development setup (mock engine under `./datasync-mock`, plaintext admin
//! password, dev-token route enabled). Environment variables are applied
//! after the file so container deployments can inject secrets without
//! editing it.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8000"
//! cors_origins = ["*"]
//!
//! [auth]
//! jwt_secret = "${JWT_SECRET}"
//! token_ttl_hours = 8
//! admin_username = "admin"
//! admin_password_hash = "$argon2id$v=19$..."
//! enable_dev_token = false
//!
//! [engine]
//! home = "/opt/datasync"
//! allowed_tables = ["kpi_jornadas"]
//!
//! [qa]
//! project_root = "."
//! test_command = ["pytest", "--cov=app", "--cov-report=xml", "--cov-report=html"]
//!
//! [rate_limit]
//! login = "3/minute"
//! sync = "5/minute"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::lua_runtime::expand_env_vars;
use crate::ratelimit::RateSpec;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub qa: QaConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Allowed CORS origins. `["*"]` allows any origin.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors_origins: default_cors_origins(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: i64,
    #[serde(default = "default_admin_username")]
    pub admin_username: String,
    /// Argon2 PHC string. Takes precedence over `admin_password`.
    #[serde(default)]
    pub admin_password_hash: Option<String>,
    #[serde(default = "default_admin_password")]
    pub admin_password: Option<String>,
    /// Registers `POST /internal/dev-token`. Must be false in production.
    #[serde(default = "default_true")]
    pub enable_dev_token: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            token_ttl_hours: default_token_ttl_hours(),
            admin_username: default_admin_username(),
            admin_password_hash: None,
            admin_password: default_admin_password(),
            enable_dev_token: true,
        }
    }
}

fn default_jwt_secret() -> String {
    "dev_secret_change_me".to_string()
}
fn default_token_ttl_hours() -> i64 {
    8
}
fn default_admin_username() -> String {
    "admin".to_string()
}
fn default_admin_password() -> Option<String> {
    Some("adminadmin".to_string())
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// DataSync home; the engine module is looked up in `<home>/src`.
    #[serde(default = "default_engine_home")]
    pub home: PathBuf,
    #[serde(default = "default_engine_module")]
    pub module: String,
    /// Upper bound for a single call into the engine script.
    #[serde(default = "default_engine_timeout")]
    pub timeout_secs: u64,
    /// When non-empty, `/sync` may only target these tables.
    #[serde(default)]
    pub allowed_tables: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            home: default_engine_home(),
            module: default_engine_module(),
            timeout_secs: default_engine_timeout(),
            allowed_tables: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn src_dir(&self) -> PathBuf {
        self.home.join("src")
    }
}

fn default_engine_home() -> PathBuf {
    PathBuf::from("./datasync-mock")
}
fn default_engine_module() -> String {
    "sync_engine".to_string()
}
fn default_engine_timeout() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct QaConfig {
    /// Working directory for test commands; relative report paths resolve here.
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_test_command")]
    pub test_command: Vec<String>,
    /// Locations probed for the AI test runner, in order.
    #[serde(default = "default_ai_runner_candidates")]
    pub ai_runner_candidates: Vec<PathBuf>,
    #[serde(default = "default_coverage_xml")]
    pub coverage_xml: PathBuf,
    #[serde(default = "default_coverage_html_dir")]
    pub coverage_html_dir: PathBuf,
    /// Kill the test process after this many seconds. Unset means no limit.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            project_root: default_project_root(),
            python: default_python(),
            test_command: default_test_command(),
            ai_runner_candidates: default_ai_runner_candidates(),
            coverage_xml: default_coverage_xml(),
            coverage_html_dir: default_coverage_html_dir(),
            timeout_secs: None,
        }
    }
}

impl QaConfig {
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }

    pub fn coverage_xml_path(&self) -> PathBuf {
        self.resolve(&self.coverage_xml)
    }

    pub fn coverage_html_path(&self) -> PathBuf {
        self.resolve(&self.coverage_html_dir)
    }
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_python() -> String {
    "python".to_string()
}
fn default_test_command() -> Vec<String> {
    ["pytest", "--cov=app", "--cov-report=xml", "--cov-report=html"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_ai_runner_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("tools/ai_test_runner.py"),
        PathBuf::from("ai_test_runner.py"),
        PathBuf::from("scripts/ai_test_runner.py"),
    ]
}
fn default_coverage_xml() -> PathBuf {
    PathBuf::from("coverage.xml")
}
fn default_coverage_html_dir() -> PathBuf {
    PathBuf::from("htmlcov")
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    /// Limit for `POST /auth/login`, e.g. `"3/minute"`. Unset disables it.
    #[serde(default = "default_login_rate")]
    pub login: Option<String>,
    #[serde(default = "default_sync_rate")]
    pub sync: Option<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            login: default_login_rate(),
            sync: default_sync_rate(),
        }
    }
}

fn default_login_rate() -> Option<String> {
    Some("3/minute".to_string())
}
fn default_sync_rate() -> Option<String> {
    Some("5/minute".to_string())
}

impl Config {
    /// Defaults only, used when no config file exists.
    pub fn minimal() -> Self {
        Self::default()
    }

    /// Apply process environment overrides on top of the file values.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary lookup. Empty values are ignored
    /// except for `ALLOWED_TABLES`, where an empty value clears the list.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("APP_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = get("CORS_ORIGINS") {
            self.server.cors_origins = coerce_list(&v);
        }
        if let Some(v) = get("JWT_SECRET") {
            self.auth.jwt_secret = v;
        }
        if let Some(hours) = get("ACCESS_TOKEN_EXPIRE_HOURS").and_then(|v| v.trim().parse().ok()) {
            self.auth.token_ttl_hours = hours;
        }
        if let Some(v) = get("ADMIN_USERNAME") {
            self.auth.admin_username = v;
        }
        if let Some(v) = get("ADMIN_PASSWORD_HASH") {
            self.auth.admin_password_hash = Some(v);
        }
        if let Some(v) = get("ADMIN_PASSWORD_PLAIN") {
            self.auth.admin_password = Some(v);
        }
        if let Some(v) = get("DASHBOARD_ENABLE_DEV") {
            self.auth.enable_dev_token = parse_bool(&v);
        }
        if let Some(v) = get("DATASYNC_HOME") {
            self.engine.home = PathBuf::from(v);
        }
        if let Some(v) = lookup("ALLOWED_TABLES") {
            self.engine.allowed_tables = coerce_list(&v);
        }
        if let Some(v) = get("RATE_LIMIT_LOGIN") {
            self.rate_limit.login = Some(v);
        }
        if let Some(v) = get("RATE_LIMIT_SYNC") {
            self.rate_limit.sync = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.is_empty() {
            bail!("auth.jwt_secret must not be empty");
        }
        if self.auth.token_ttl_hours < 1 {
            bail!("auth.token_ttl_hours must be >= 1");
        }
        if self.auth.admin_username.is_empty() {
            bail!("auth.admin_username must not be empty");
        }
        if self.engine.module.is_empty() {
            bail!("engine.module must not be empty");
        }
        if self.engine.timeout_secs == 0 {
            bail!("engine.timeout_secs must be > 0");
        }
        if self.qa.test_command.is_empty() {
            bail!("qa.test_command must contain at least the program name");
        }
        for (name, spec) in [
            ("rate_limit.login", &self.rate_limit.login),
            ("rate_limit.sync", &self.rate_limit.sync),
        ] {
            if let Some(spec) = spec {
                RateSpec::parse(spec).with_context(|| format!("invalid {}", name))?;
            }
        }

        if self.auth.admin_password_hash.is_none() && self.auth.admin_password.is_none() {
            tracing::warn!("no admin password configured; /auth/login will reject every attempt");
        }
        if self.auth.jwt_secret == default_jwt_secret() {
            tracing::warn!("auth.jwt_secret is the development default");
        }

        Ok(())
    }
}

/// Read a TOML config file, expand `${VAR}` references, apply environment
/// overrides and validate the result.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&expand_env_vars(&content)).with_context(|| "Failed to parse config file")?;

    config.apply_env();
    config.validate()?;
    Ok(config)
}

/// Like [`load_config`], but a missing file yields defaults plus environment.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        return load_config(path);
    }
    tracing::debug!(path = %path.display(), "config file not found, using defaults");
    let mut config = Config::minimal();
    config.apply_env();
    config.validate()?;
    Ok(config)
}

/// Accept `*`, a JSON array, or a comma-separated list.
pub fn coerce_list(raw: &str) -> Vec<String> {
    let s = raw.trim();
    if s == "*" {
        return vec!["*".to_string()];
    }
    if s.starts_with('[') {
        if let Ok(items) = serde_json::from_str::<Vec<String>>(s) {
            return items;
        }
    }
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_coerce_list_formats() {
        assert_eq!(coerce_list("*"), vec!["*"]);
        assert_eq!(coerce_list(r#"["a","b"]"#), vec!["a", "b"]);
        assert_eq!(coerce_list("a, b ,,c"), vec!["a", "b", "c"]);
        assert!(coerce_list("").is_empty());
        // Broken JSON falls through to CSV.
        assert_eq!(coerce_list("[a,b"), vec!["[a", "b"]);
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.auth.admin_username, "admin");
        assert_eq!(config.auth.admin_password.as_deref(), Some("adminadmin"));
        assert_eq!(config.auth.token_ttl_hours, 8);
        assert_eq!(config.engine.module, "sync_engine");
        assert_eq!(config.engine.src_dir(), PathBuf::from("./datasync-mock/src"));
        assert!(config.engine.allowed_tables.is_empty());
        assert!(config.auth.enable_dev_token);
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::minimal();
        config.apply_overrides(overrides(&[
            ("DATASYNC_HOME", "/opt/datasync"),
            ("JWT_SECRET", "s3cret"),
            ("ALLOWED_TABLES", "users,orders"),
            ("DASHBOARD_ENABLE_DEV", "false"),
            ("ACCESS_TOKEN_EXPIRE_HOURS", "2"),
        ]));
        assert_eq!(config.engine.home, PathBuf::from("/opt/datasync"));
        assert_eq!(config.auth.jwt_secret, "s3cret");
        assert_eq!(config.engine.allowed_tables, vec!["users", "orders"]);
        assert!(!config.auth.enable_dev_token);
        assert_eq!(config.auth.token_ttl_hours, 2);
    }

    #[test]
    fn test_empty_allowed_tables_clears_whitelist() {
        let mut config: Config = toml::from_str(
            r#"
[engine]
allowed_tables = ["users"]
"#,
        )
        .unwrap();
        config.apply_overrides(overrides(&[("ALLOWED_TABLES", "")]));
        assert!(config.engine.allowed_tables.is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_rate_limit() {
        let mut config = Config::minimal();
        config.rate_limit.login = Some("three per minute".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_config_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("datasync.toml");
        std::fs::write(
            &path,
            r#"
[auth]
jwt_secret = "file-secret"
enable_dev_token = false

[qa]
project_root = "/srv/app"
timeout_secs = 120
"#,
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert!(!config.auth.enable_dev_token);
        assert_eq!(config.qa.timeout_secs, Some(120));
        assert_eq!(
            config.qa.coverage_xml_path(),
            PathBuf::from("/srv/app/coverage.xml")
        );
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = load_or_default(&tmp.path().join("missing.toml")).unwrap();
        assert_eq!(config.qa.python, "python");
    }
}
