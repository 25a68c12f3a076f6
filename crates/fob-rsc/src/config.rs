//! Protocol configuration.

use crate::error::ConfigError;
use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable prefix read by [`RscConfig::load`].
pub const ENV_PREFIX: &str = "FOB_RSC_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RscConfig {
    /// URL prefix the application is mounted under
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// First path segment of component and function requests
    #[serde(default = "default_rsc_base")]
    pub rsc_base: String,

    #[serde(default = "default_dist_dir")]
    pub dist_dir: PathBuf,

    /// Subdirectory of `dist_dir` holding publicly served files
    #[serde(default = "default_public_dir")]
    pub public_dir: PathBuf,

    /// Query key that disables hydration script injection
    #[serde(default = "default_nojs_param")]
    pub nojs_param: String,

    /// Bytes one copy of a duplicated payload may run ahead of the other
    #[serde(default = "default_tee_buffer_limit")]
    pub tee_buffer_limit: usize,

    /// Middleware names, in execution order
    #[serde(default = "default_middleware")]
    pub middleware: Vec<String>,

    /// CSP nonce for injected scripts
    #[serde(default)]
    pub nonce: Option<String>,
}

fn default_base_path() -> String {
    "/".to_string()
}

fn default_rsc_base() -> String {
    "RSC".to_string()
}

fn default_dist_dir() -> PathBuf {
    PathBuf::from("dist")
}

fn default_public_dir() -> PathBuf {
    PathBuf::from("public")
}

fn default_nojs_param() -> String {
    "__nojs".to_string()
}

fn default_tee_buffer_limit() -> usize {
    8 * 1024 * 1024
}

fn default_middleware() -> Vec<String> {
    vec![
        "context".to_string(),
        "request-log".to_string(),
        "handler".to_string(),
    ]
}

impl Default for RscConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            rsc_base: default_rsc_base(),
            dist_dir: default_dist_dir(),
            public_dir: default_public_dir(),
            nojs_param: default_nojs_param(),
            tee_buffer_limit: default_tee_buffer_limit(),
            middleware: default_middleware(),
            nonce: None,
        }
    }
}

impl RscConfig {
    /// Load configuration.
    /// Priority: environment variables (`FOB_RSC_*`) > defaults
    pub fn load() -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX));
        Self::extract(figment)
    }

    /// Build a config from a JSON object, filling unset fields with defaults.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Serialized::defaults(value));
        Self::extract(figment)
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(|e| ConfigError::InvalidValue {
            field: "configuration".to_string(),
            value: e.to_string(),
            hint: "Check FOB_RSC_* environment variables and field types".to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Prefix of component and function request paths, e.g. `/RSC/`.
    pub fn rsc_prefix(&self) -> String {
        format!("{}{}/", self.base_path, self.rsc_base)
    }

    /// Directory static snapshots are written to.
    pub fn output_dir(&self) -> PathBuf {
        self.dist_dir.join(&self.public_dir)
    }

    /// Validate configuration for logical consistency.
    ///
    /// Middleware names are checked when the pipeline is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.base_path.starts_with('/') || !self.base_path.ends_with('/') {
            return Err(ConfigError::InvalidValue {
                field: "base_path".to_string(),
                value: self.base_path.clone(),
                hint: "Must start and end with '/' (e.g. \"/\" or \"/app/\")".to_string(),
            });
        }

        if self.rsc_base.is_empty() || self.rsc_base.contains('/') {
            return Err(ConfigError::InvalidValue {
                field: "rsc_base".to_string(),
                value: self.rsc_base.clone(),
                hint: "Must be a single non-empty path segment".to_string(),
            });
        }

        if self.tee_buffer_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "tee_buffer_limit".to_string(),
                value: "0".to_string(),
                hint: "Must be at least 1 byte".to_string(),
            });
        }

        if self.middleware.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "middleware".to_string(),
                value: "[]".to_string(),
                hint: "Include at least \"handler\"".to_string(),
            });
        }

        if let Some(nonce) = &self.nonce {
            if nonce.is_empty() || nonce.contains(['"', '<', '>']) {
                return Err(ConfigError::InvalidValue {
                    field: "nonce".to_string(),
                    value: nonce.clone(),
                    hint: "Must be a non-empty base64 token".to_string(),
                });
            }
        }

        Ok(())
    }
}
