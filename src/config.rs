use config::Config;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

pub const IMPLICIT_TLS_PORT: u16 = 465;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Everything the sender and composer read from the environment.
///
/// Required fields stay optional here; the all-or-nothing check happens in
/// [`MailConfig::smtp`] so a missing value aborts a send instead of startup.
#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    pub smtp_server: Option<String>,
    #[serde(default = "default_port")]
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub from_email: Option<String>,
    pub to_email: Option<String>,
    #[serde(default = "default_to_name")]
    pub to_name: String,
    pub email_subject: Option<String>,
    pub email_plain: Option<String>,
    pub email_html: Option<String>,
    pub sentry_dsn: Option<String>,
}

/// Settings read before logging starts. Unlike [`MailConfig`] this ignores
/// every other variable, so a malformed mail setting cannot keep the error
/// reporter from starting.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportingConfig {
    pub sentry_dsn: Option<String>,
}

impl ReportingConfig {
    pub fn load() -> Self {
        dotenvy::dotenv().ok();
        Self::from_environment(config::Environment::default())
    }

    pub fn from_vars(vars: HashMap<String, String>) -> Self {
        Self::from_environment(config::Environment::default().source(Some(vars)))
    }

    fn from_environment(source: config::Environment) -> Self {
        Config::builder()
            .add_source(source)
            .build()
            .and_then(Config::try_deserialize)
            .unwrap_or_default()
    }

    pub fn sentry_dsn(&self) -> Option<&str> {
        present(&self.sentry_dsn)
    }
}

/// The validated subset needed to open a connection and address a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpSettings {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    pub to: String,
}

fn default_port() -> u16 {
    IMPLICIT_TLS_PORT
}

fn default_to_name() -> String {
    "Queen of Whimsies".to_string()
}

impl MailConfig {
    /// Loads `.env` (if present) into the process environment, then reads it.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_environment(config::Environment::default())
    }

    /// Reads from an explicit variable map instead of the process environment.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_environment(config::Environment::default().source(Some(vars)))
    }

    fn from_environment(source: config::Environment) -> Result<Self, ConfigError> {
        let settings = Config::builder().add_source(source).build()?;
        let cfg: MailConfig = settings.try_deserialize()?;
        Ok(cfg)
    }

    /// Returns the connection settings, or the names of every missing variable.
    pub fn smtp(&self) -> Result<SmtpSettings, Vec<&'static str>> {
        let mut missing = Vec::new();
        let mut take = |name: &'static str, value: &Option<String>| match present(value) {
            Some(v) => v.to_string(),
            None => {
                missing.push(name);
                String::new()
            }
        };

        let settings = SmtpSettings {
            server: take("SMTP_SERVER", &self.smtp_server),
            port: self.smtp_port,
            username: take("SMTP_USERNAME", &self.smtp_username),
            password: take("SMTP_PASSWORD", &self.smtp_password),
            from: take("FROM_EMAIL", &self.from_email),
            to: take("TO_EMAIL", &self.to_email),
        };

        if self.smtp_port == 0 {
            missing.push("SMTP_PORT");
        }

        if missing.is_empty() {
            Ok(settings)
        } else {
            Err(missing)
        }
    }

    pub fn sentry_dsn(&self) -> Option<&str> {
        present(&self.sentry_dsn)
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Directory holding `whimsy.log` and its backups.
///
/// `WHIMSY_LOG_DIR` wins; otherwise the platform local data dir.
pub fn log_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("WHIMSY_LOG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::data_local_dir()
        .map(|d| d.join("whimsy").join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}
