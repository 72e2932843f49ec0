use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Upper bound for a single store / registry / upload call.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 5_000;
/// Upper bound for one git invocation at fire time.
pub const DEFAULT_GIT_TIMEOUT_SECS: u64 = 120;
/// How long a fire delivery owns a rule or a job before it may be taken again.
pub const DEFAULT_CLAIM_LEASE_SECS: u64 = 600;
/// Request bodies carry base64 content bundles; 8 MB hard cap.
pub const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Top-level config (gits.toml + GITS_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitsConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub fire: FireConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Run the local trigger clock inside the gateway process.
    /// Disable when an external registry delivers fire events to POST /fire.
    #[serde(default = "bool_true")]
    pub local_clock: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            local_clock: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Where uploaded change bundles are kept until their job fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentConfig {
    #[serde(default = "default_content_root")]
    pub root: String,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            root: default_content_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Working tree the executor runs git in. Defaults to the process cwd.
    pub workdir: Option<String>,
    #[serde(default = "default_git_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            workdir: None,
            timeout_secs: DEFAULT_GIT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Kept above `git.timeout_secs` so a running job is never taken twice.
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            claim_lease_secs: DEFAULT_CLAIM_LEASE_SECS,
        }
    }
}

/// Authentication mode for inbound fire events.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FireAuthMode {
    /// HMAC-SHA256 over the raw request body in `X-Gits-Signature-256`.
    HmacSha256,
    /// Static bearer token in the Authorization header.
    BearerToken,
    /// No authentication; use only when the gateway is not reachable from outside.
    #[default]
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FireConfig {
    #[serde(default)]
    pub auth_mode: FireAuthMode,
    /// HMAC signing secret or bearer token value.
    pub secret: Option<String>,
}

/// Settings read by the `gits` CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    pub user_id: Option<String>,
    /// Name of the secret holding the git credential, resolved at fire time.
    pub credential_ref: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            user_id: None,
            credential_ref: None,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_git_timeout_secs() -> u64 {
    DEFAULT_GIT_TIMEOUT_SECS
}
fn default_call_timeout_ms() -> u64 {
    DEFAULT_CALL_TIMEOUT_MS
}
fn default_claim_lease_secs() -> u64 {
    DEFAULT_CLAIM_LEASE_SECS
}
fn default_api_url() -> String {
    format!("http://{DEFAULT_BIND}:{DEFAULT_PORT}")
}
fn default_db_path() -> String {
    format!("{}/gits.db", gits_home())
}
fn default_content_root() -> String {
    format!("{}/content", gits_home())
}

fn gits_home() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.gits", home)
}

impl GitsConfig {
    /// Load config from a TOML file with GITS_* env var overrides.
    ///
    /// Env keys name a section and a field joined by a double underscore,
    /// e.g. `GITS_CLIENT__USER_ID` or `GITS_SCHEDULER__CALL_TIMEOUT_MS`.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.gits/gits.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::GitsError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("GITS_").split("__"))
    }
}

pub fn default_config_path() -> String {
    format!("{}/gits.toml", gits_home())
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use std::io::Write;

    // Every test runs inside a Jail so env overrides set by one test are
    // invisible to the others.

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|_| {
            let cfg = GitsConfig::load(Some("/nonexistent/gits.toml")).expect("defaults");
            assert_eq!(cfg.gateway.port, DEFAULT_PORT);
            assert_eq!(cfg.scheduler.call_timeout_ms, DEFAULT_CALL_TIMEOUT_MS);
            assert_eq!(cfg.scheduler.claim_lease_secs, DEFAULT_CLAIM_LEASE_SECS);
            assert_eq!(cfg.fire.auth_mode, FireAuthMode::None);
            assert!(cfg.gateway.local_clock);
            Ok(())
        });
    }

    #[test]
    fn toml_sections_are_read() {
        Jail::expect_with(|_| {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            writeln!(
                file,
                r#"
[gateway]
port = 9000
local_clock = false

[fire]
auth_mode = "bearer-token"
secret = "s3cr3t"

[client]
user_id = "u-1"
"#
            )
            .unwrap();

            let cfg = GitsConfig::load(file.path().to_str()).unwrap();
            assert_eq!(cfg.gateway.port, 9000);
            assert!(!cfg.gateway.local_clock);
            assert_eq!(cfg.fire.auth_mode, FireAuthMode::BearerToken);
            assert_eq!(cfg.fire.secret.as_deref(), Some("s3cr3t"));
            assert_eq!(cfg.client.user_id.as_deref(), Some("u-1"));
            assert_eq!(cfg.client.api_url, default_api_url());
            Ok(())
        });
    }

    #[test]
    fn underscored_fields_take_env_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file("gits.toml", "[client]\nuser_id = \"from-file\"\n")?;
            jail.set_env("GITS_CLIENT__USER_ID", "alice");
            jail.set_env("GITS_CLIENT__CREDENTIAL_REF", "github-pat");
            jail.set_env("GITS_SCHEDULER__CALL_TIMEOUT_MS", "42");
            jail.set_env("GITS_GIT__TIMEOUT_SECS", "7");
            jail.set_env("GITS_GATEWAY__LOCAL_CLOCK", "false");
            jail.set_env("GITS_FIRE__AUTH_MODE", "hmac-sha256");

            let cfg = GitsConfig::load(Some("gits.toml")).unwrap();
            assert_eq!(cfg.client.user_id.as_deref(), Some("alice"));
            assert_eq!(cfg.client.credential_ref.as_deref(), Some("github-pat"));
            assert_eq!(cfg.scheduler.call_timeout_ms, 42);
            assert_eq!(cfg.git.timeout_secs, 7);
            assert!(!cfg.gateway.local_clock);
            assert_eq!(cfg.fire.auth_mode, FireAuthMode::HmacSha256);
            Ok(())
        });
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        Jail::expect_with(|_| {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            writeln!(file, "[gateway]\nport = \"not-a-number\"").unwrap();
            let err = GitsConfig::load(file.path().to_str()).unwrap_err();
            assert_eq!(err.code(), "CONFIG_ERROR");
            Ok(())
        });
    }
}
