//! Runtime configuration
//!
//! Settings come from an optional config file plus `AGORA_*` environment
//! overrides; every field has a default so a bare node starts without any
//! file at all.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use agora_core::{EconomyError, EconomyResult};

use crate::board::BoardConfig;
use crate::court::CourtConfig;
use crate::reputation::ReputationConfig;

/// One HTTP port per service
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServicePorts {
    pub identity: u16,
    pub bank: u16,
    pub board: u16,
    pub reputation: u16,
    pub court: u16,
}

impl Default for ServicePorts {
    fn default() -> Self {
        Self {
            identity: 7101,
            bank: 7102,
            board: 7103,
            reputation: 7104,
            court: 7105,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_path: String,
    pub asset_storage_dir: String,
    pub ports: ServicePorts,
    pub salary_amount: i64,
    pub salary_period_seconds: u64,
    pub default_bidding_seconds: i64,
    pub default_execution_seconds: i64,
    pub default_review_seconds: i64,
    pub judge_panel_size: usize,
    pub judge_timeout_seconds: u64,
    /// Judge panel endpoint; absent means every seat abstains and rulings
    /// default to the worker
    pub judge_panel_url: Option<String>,
    /// Defaults to the review window when unset
    pub rebuttal_window_seconds: Option<i64>,
    pub max_asset_size_bytes: u64,
    pub max_comment_length: usize,
    pub sweep_interval_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: "./agora.db".into(),
            asset_storage_dir: "./assets".into(),
            ports: ServicePorts::default(),
            salary_amount: 10,
            salary_period_seconds: 3600,
            default_bidding_seconds: 3600,
            default_execution_seconds: 86_400,
            default_review_seconds: 3600,
            judge_panel_size: 3,
            judge_timeout_seconds: 30,
            judge_panel_url: None,
            rebuttal_window_seconds: None,
            max_asset_size_bytes: 16 * 1024 * 1024,
            max_comment_length: 256,
            sweep_interval_seconds: 2,
        }
    }
}

impl Settings {
    /// Load from `path` (or `./agora.{toml,yaml,json}` when not given),
    /// then apply `AGORA_*` environment overrides.
    pub fn load(path: Option<&str>) -> EconomyResult<Self> {
        let mut builder = Config::builder();
        builder = match path {
            Some(path) => builder.add_source(File::with_name(path)),
            None => builder.add_source(File::with_name("agora").required(false)),
        };
        builder
            .add_source(Environment::with_prefix("AGORA").separator("__"))
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|err| EconomyError::validation(format!("configuration: {}", err)))
    }

    /// The rebuttal window duration, defaulting to the review window
    pub fn rebuttal_window_seconds(&self) -> i64 {
        self.rebuttal_window_seconds
            .unwrap_or(self.default_review_seconds)
    }

    pub fn board_config(&self) -> BoardConfig {
        BoardConfig {
            default_bidding_seconds: self.default_bidding_seconds,
            default_execution_seconds: self.default_execution_seconds,
            default_review_seconds: self.default_review_seconds,
            rebuttal_window_seconds: self.rebuttal_window_seconds(),
            asset_storage_dir: PathBuf::from(&self.asset_storage_dir),
            max_asset_size_bytes: self.max_asset_size_bytes,
        }
    }

    pub fn court_config(&self) -> CourtConfig {
        CourtConfig {
            judge_panel_size: self.judge_panel_size,
            judge_timeout: Duration::from_secs(self.judge_timeout_seconds),
            rebuttal_window_seconds: self.rebuttal_window_seconds(),
        }
    }

    pub fn reputation_config(&self) -> ReputationConfig {
        ReputationConfig {
            max_comment_length: self.max_comment_length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let settings = Settings::default();
        assert_eq!(settings.max_comment_length, 256);
        assert_eq!(settings.rebuttal_window_seconds(), 3600);
        assert!(settings.judge_panel_url.is_none());
    }

    #[test]
    fn rebuttal_window_falls_back_to_review() {
        let mut settings = Settings::default();
        settings.default_review_seconds = 120;
        assert_eq!(settings.rebuttal_window_seconds(), 120);
        settings.rebuttal_window_seconds = Some(45);
        assert_eq!(settings.rebuttal_window_seconds(), 45);
    }
}
