use std::env;
use std::path::PathBuf;

const DEFAULT_STORAGE_BACKEND: &str = "filesystem";
const DEFAULT_STORAGE_ROOT: &str = "./.s3";
const DEFAULT_SANDBOX_MODE: &str = "off";
const DEFAULT_S3_LISTEN: &str = "0.0.0.0:9000";
const DEFAULT_METRICS_LISTEN: &str = "0.0.0.0:9100";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Clone, Debug)]
pub struct Config {
    pub storage_backend: String,
    pub storage_root: PathBuf,
    pub sandbox_mode: String,
    pub s3_listen: String,
    pub metrics_listen: String,
    pub log_level: String,
}

impl Config {
    pub fn load() -> Result<Self, String> {
        let config = Self::from_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Self {
        Self {
            storage_backend: env_or("PS3_STORAGE_BACKEND", DEFAULT_STORAGE_BACKEND),
            storage_root: PathBuf::from(env_or("PS3_STORAGE_ROOT", DEFAULT_STORAGE_ROOT)),
            sandbox_mode: env_or("PS3_SANDBOX_MODE", DEFAULT_SANDBOX_MODE),
            s3_listen: env_or("PS3_S3_LISTEN", DEFAULT_S3_LISTEN),
            metrics_listen: env_or("PS3_METRICS_LISTEN", DEFAULT_METRICS_LISTEN),
            log_level: env_or("PS3_LOG_LEVEL", DEFAULT_LOG_LEVEL),
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self.sandbox_mode.as_str() {
            "off" | "auto" | "manual" => {}
            other => {
                return Err(format!(
                    "PS3_SANDBOX_MODE must be off, auto, or manual (got {other})"
                ))
            }
        }
        if self.s3_listen.trim().is_empty() {
            return Err("PS3_S3_LISTEN must not be empty".into());
        }
        if self.metrics_listen.trim().is_empty() {
            return Err("PS3_METRICS_LISTEN must not be empty".into());
        }
        Ok(())
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}
