//! Engine-level configuration — distinct from the per-project [`crate::project_config`].
//!
//! Grounded on the teacher's `config::GlobalConfig`: a TOML file with
//! `serde(default)` fields, merged with environment overrides through
//! `figment`.

use std::path::PathBuf;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct KilnSettings {
    #[serde(default = "default_plugin_dirs")]
    pub plugin_dirs: Vec<PathBuf>,

    /// Default `tracing` filter directive used when `RUST_LOG` is unset
    /// (spec §2 A2/A3).
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for KilnSettings {
    fn default() -> Self {
        Self {
            plugin_dirs: default_plugin_dirs(),
            log_filter: default_log_filter(),
        }
    }
}

fn default_plugin_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from(".kiln/plugins")]
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl KilnSettings {
    /// Load from `path` if given, falling back to `./kiln.toml`, then to
    /// defaults. Environment variables prefixed `KILN_` override file values,
    /// matching the teacher's layering of file-then-env configuration.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let mut figment = Figment::from(figment::providers::Serialized::defaults(
            KilnSettings::default(),
        ));

        let candidate = path.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("kiln.toml"));
        if candidate.exists() {
            figment = figment.merge(Toml::file(&candidate));
        }

        figment = figment.merge(Env::prefixed("KILN_"));

        figment
            .extract()
            .map_err(|e| crate::error::KilnError::ConfigMalformed(e.to_string()))
    }
}
