use std::path::PathBuf;

/// One variant per error kind from the spec's error-handling table (§7).
#[derive(Debug, thiserror::Error)]
pub enum KilnError {
    #[error("config malformed: {0}")]
    ConfigMalformed(String),

    #[error("no project config found under {0}")]
    ConfigNotFound(PathBuf),

    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("plugin '{id}' does not implement the {kind} interface")]
    PluginInterfaceInvalid { id: String, kind: &'static str },

    #[error("tree I/O error: {0}")]
    TreeIoError(String),

    #[error("plugin '{plugin}' failed: {message}")]
    PluginExecFailure { plugin: String, message: String },

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("path must be relative to the tree root, got absolute path: {0}")]
    PathInvalid(PathBuf),

    #[error("invalid state: {0}")]
    StateViolation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("glob pattern error: {0}")]
    Glob(#[from] globset::Error),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("{0}")]
    Context(String),
}

pub type Result<T> = std::result::Result<T, KilnError>;

/// Mirrors `anyhow::Context` so call sites can attach a message without
/// naming a specific `KilnError` variant.
pub trait KilnResultExt<T> {
    fn context(self, msg: impl std::fmt::Display) -> Result<T>;
}

impl<T, E: std::fmt::Display> KilnResultExt<T> for std::result::Result<T, E> {
    fn context(self, msg: impl std::fmt::Display) -> Result<T> {
        self.map_err(|e| KilnError::Context(format!("{}: {}", msg, e)))
    }
}
