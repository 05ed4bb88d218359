use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

pub const DEFAULT_CHANNEL: &str = "stable";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// How a downloaded package is named when no output path is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputNaming {
    /// `{program}.zip`
    #[default]
    Fixed,
    /// `{program}-v{version}.zip`
    Version,
    /// `{program}-{YYYY-MM-DD}.zip`
    Date,
}

impl FromStr for OutputNaming {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "version" => Ok(Self::Version),
            "date" => Ok(Self::Date),
            other => Err(UpdateError::Config(format!(
                "unknown naming {other:?}: expected fixed, version or date"
            ))),
        }
    }
}

#[derive(Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub program_id: String,
    pub channel: String,
    /// Download-scoped bearer token.
    pub token: Option<String>,
    /// Base64 package key; packages are decrypted after download when set.
    pub encryption_key: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub save_path: PathBuf,
    pub naming: OutputNaming,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, program_id: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            program_id: program_id.into(),
            channel: DEFAULT_CHANNEL.to_owned(),
            token: None,
            encryption_key: None,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            save_path: PathBuf::from("./updates"),
            naming: OutputNaming::Fixed,
        }
    }

    pub fn validate(&self) -> Result<(), UpdateError> {
        if self.server_url.trim().is_empty() {
            return Err(UpdateError::Config("server url is required".into()));
        }
        if !self.server_url.starts_with("http://") && !self.server_url.starts_with("https://") {
            return Err(UpdateError::Config(format!(
                "server url must start with http:// or https://: {}",
                self.server_url
            )));
        }
        if self.program_id.trim().is_empty() {
            return Err(UpdateError::Config("program id is required".into()));
        }
        if self.channel.trim().is_empty() {
            return Err(UpdateError::Config("channel must not be empty".into()));
        }
        Ok(())
    }

    /// Server URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    /// Default output path for `version` under `save_path`.
    pub fn output_path(&self, version: &str, today: NaiveDate) -> PathBuf {
        let name = match self.naming {
            OutputNaming::Fixed => format!("{}.zip", self.program_id),
            OutputNaming::Version => format!("{}-v{}.zip", self.program_id, version),
            OutputNaming::Date => format!("{}-{}.zip", self.program_id, today.format("%Y-%m-%d")),
        };
        Path::new(&self.save_path).join(name)
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("ClientConfig")
            .field("server_url", &self.server_url)
            .field("program_id", &self.program_id)
            .field("channel", &self.channel)
            .field("token", &redact(&self.token))
            .field("encryption_key", &redact(&self.encryption_key))
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("save_path", &self.save_path)
            .field("naming", &self.naming)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        let mut c = ClientConfig::new("https://updates.example.com/", "app1");
        c.save_path = PathBuf::from("/tmp/updates");
        c
    }

    #[test]
    fn defaults() {
        let c = config();
        assert_eq!(c.channel, "stable");
        assert_eq!(c.timeout, Duration::from_secs(30));
        assert_eq!(c.max_retries, 3);
        assert_eq!(c.naming, OutputNaming::Fixed);
        assert_eq!(c.base_url(), "https://updates.example.com");
        assert!(c.validate().is_ok());
    }

    #[test]
    fn rejects_missing_fields() {
        let mut c = config();
        c.program_id = String::new();
        assert!(matches!(c.validate(), Err(UpdateError::Config(_))));

        let c = ClientConfig::new("updates.example.com", "app1");
        assert!(matches!(c.validate(), Err(UpdateError::Config(_))));
    }

    #[test]
    fn output_naming() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let mut c = config();
        assert_eq!(
            c.output_path("1.2.0", today),
            PathBuf::from("/tmp/updates/app1.zip")
        );
        c.naming = OutputNaming::Version;
        assert_eq!(
            c.output_path("1.2.0", today),
            PathBuf::from("/tmp/updates/app1-v1.2.0.zip")
        );
        c.naming = OutputNaming::Date;
        assert_eq!(
            c.output_path("1.2.0", today),
            PathBuf::from("/tmp/updates/app1-2024-03-09.zip")
        );
    }

    #[test]
    fn naming_parse() {
        assert_eq!("version".parse::<OutputNaming>().unwrap(), OutputNaming::Version);
        assert!("weekly".parse::<OutputNaming>().is_err());
    }

    #[test]
    fn debug_hides_secrets() {
        let mut c = config();
        c.token = Some("super-secret".into());
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("super-secret"));
        assert!(dbg.contains("<redacted>"));
    }
}
