use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use url::Url;

use crate::db::FormPolicy;

const DEFAULT_FILE: &str = "service_scraper";
const ENV_PREFIX: &str = "SERVICE_SCRAPER";

/// Runtime settings: defaults < config file < `SERVICE_SCRAPER_*` env vars.
/// CLI flags are applied on top by `main`.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub base_url: String,
    pub services_path: String,
    pub locations_path: String,
    pub db_path: PathBuf,
    pub concurrency: usize,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub user_agent: String,
    pub form_policy: FormPolicy,
}

impl Settings {
    /// Load settings. An explicit `path` must exist; otherwise
    /// `service_scraper.{toml,json,...}` in the working directory is used if present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_FILE).required(false),
        };

        let settings = Config::builder()
            .set_default("base_url", "https://service.berlin.de")?
            .set_default("services_path", "/dienstleistungen/")?
            .set_default("locations_path", "/standorte/")?
            .set_default("db_path", "data/services.sqlite")?
            .set_default("concurrency", 4_i64)?
            .set_default("request_timeout_secs", 30_i64)?
            .set_default("max_retries", 2_i64)?
            .set_default("retry_backoff_ms", 2000_i64)?
            .set_default(
                "user_agent",
                concat!("service_scraper/", env!("CARGO_PKG_VERSION")),
            )?
            .set_default("form_policy", "dedup")?
            .add_source(file)
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .context("Failed to load configuration")?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }

    pub fn base_url(&self) -> Result<Url> {
        Url::parse(&self.base_url).with_context(|| format!("Invalid base_url {:?}", self.base_url))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_without_file() {
        let s = Settings::load(None).unwrap();
        assert_eq!(s.services_path, "/dienstleistungen/");
        assert_eq!(s.locations_path, "/standorte/");
        assert!(s.concurrency >= 1);
        assert!(s.base_url().is_ok());
    }

    #[test]
    fn file_overrides_defaults() {
        let mut f = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            f,
            "concurrency = 1\nmax_retries = 0\nform_policy = \"append\"\ndb_path = \"/tmp/x.sqlite\""
        )
        .unwrap();

        let s = Settings::load(Some(f.path())).unwrap();
        assert_eq!(s.concurrency, 1);
        assert_eq!(s.max_retries, 0);
        assert_eq!(s.form_policy, FormPolicy::Append);
        assert_eq!(s.db_path, PathBuf::from("/tmp/x.sqlite"));
        // Untouched keys keep their defaults
        assert_eq!(s.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        assert!(Settings::load(Some(Path::new("/nonexistent/scraper.toml"))).is_err());
    }
}
