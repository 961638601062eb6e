//! Configuration management for the CLI
//!
//! Command-line flags win over the defaults file and `LONGHORNCTL_*`
//! environment variables, which win over the built-in defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;
use kube::config::{KubeConfigOptions, Kubeconfig};
use serde::Deserialize;
use thiserror::Error;

const ENV_PREFIX: &str = "LONGHORNCTL";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid log level \"{0}\" (expected trace, debug, info, warn or error)")]
    InvalidLogLevel(String),

    #[error("could not determine home directory")]
    NoHome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Result<Self, SettingsError> {
        <Self as ValueEnum>::from_str(value.trim(), true)
            .map_err(|_| SettingsError::InvalidLogLevel(value.to_string()))
    }
}

/// Defaults read from the config file and environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub image: Option<String>,
    pub image_registry: Option<String>,
    pub image_pull_secret: Option<String>,
    pub namespace: Option<String>,
    pub log_level: Option<String>,
}

impl Settings {
    /// Load settings from `path`, or from `~/.config/longhornctl/config.*`
    /// when no path is given
    ///
    /// An explicit path must exist. The default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(
                    config::File::with_name(&path.to_string_lossy()).required(true),
                );
            }
            None => {
                if let Ok(default) = default_config_path() {
                    builder = builder.add_source(
                        config::File::with_name(&default.to_string_lossy()).required(false),
                    );
                }
            }
        }

        builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    pub fn log_level(&self) -> Result<Option<LogLevel>, SettingsError> {
        self.log_level.as_deref().map(LogLevel::parse).transpose()
    }
}

/// Defaults file location, without extension
fn default_config_path() -> Result<PathBuf, SettingsError> {
    let home = dirs_next::home_dir().ok_or(SettingsError::NoHome)?;
    Ok(home.join(".config").join("longhornctl").join("config"))
}

/// Get kubeconfig path
pub fn kubeconfig_path(override_path: Option<&Path>) -> Result<PathBuf, SettingsError> {
    if let Some(path) = override_path {
        return Ok(path.to_path_buf());
    }

    if let Ok(path) = std::env::var("KUBECONFIG") {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    let home = dirs_next::home_dir().ok_or(SettingsError::NoHome)?;
    Ok(home.join(".kube").join("config"))
}

/// Build a Kubernetes client
///
/// An explicit kubeconfig must be readable. Otherwise the resolved path is
/// used when it exists, and in-cluster inference when it does not.
pub async fn kube_client(override_path: Option<&Path>) -> Result<kube::Client> {
    let path = kubeconfig_path(override_path).ok();
    let readable = path
        .as_ref()
        .filter(|path| override_path.is_some() || path.exists());

    let config = match readable {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .with_context(|| format!("Failed to load kubeconfig {}", path.display()))?
        }
        None => kube::Config::infer()
            .await
            .context("Failed to infer Kubernetes configuration")?,
    };

    kube::Client::try_from(config).context("Failed to create Kubernetes client")
}
