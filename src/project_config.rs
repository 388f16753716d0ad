//! Parsed declarative project configuration (spec §3 `ProjectConfig`, §6
//! "Project config") and the loader described in spec §4.4.
//!
//! Grounded on the teacher's `config::GlobalConfig` for the `serde(default)`
//! idiom, and on `repo::source::SimpleResolver::load_from_config` for the
//! "try several named sources in order, first success wins" loader shape.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{KilnError, Result};

/// `string | { id, version?, chain?, requires? }` (spec §6 `<plugin-descriptor>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PluginDescriptor {
    Id(String),
    Full(DeployDescriptorSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeployDescriptorSpec {
    pub id: String,
    pub version: Option<String>,
    #[serde(default)]
    pub chain: ChainSpec,
    #[serde(default)]
    pub requires: RequiresSpec,
    /// Arbitrary plugin-specific settings (e.g. `combine`'s `output`/`ordering`)
    /// — spec §4.8's `DeployConfig` is itself handed to the plugin as its
    /// `settings` argument, so any field beyond the schema's own
    /// `id`/`version`/`chain`/`requires` passes through untouched.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChainSpec {
    #[serde(default)]
    pub predeploy: Vec<PluginDescriptor>,
    #[serde(default)]
    pub postdeploy: Vec<PluginDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RequiresSpec {
    #[serde(default)]
    pub build: Vec<PluginDescriptor>,
    #[serde(default)]
    pub deploy: Vec<PluginDescriptor>,
}

impl PluginDescriptor {
    pub fn id(&self) -> &str {
        match self {
            PluginDescriptor::Id(id) => id,
            PluginDescriptor::Full(spec) => &spec.id,
        }
    }

    pub fn version(&self) -> Option<&str> {
        match self {
            PluginDescriptor::Id(_) => None,
            PluginDescriptor::Full(spec) => spec.version.as_deref(),
        }
    }
}

/// `string | { id, version?, dev?, build?, handler? }` (spec §6 `<handler-descriptor>`).
///
/// Per the Open Question resolution recorded in DESIGN.md: `handler` (an
/// arbitrary embedded callable in the legacy system) is replaced by a closed
/// set of [`InlineHandler`] rule forms rather than kept as a scripting DSL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HandlerSpecFile {
    Id(String),
    Full {
        id: Option<String>,
        version: Option<String>,
        #[serde(default)]
        dev: bool,
        #[serde(default = "default_true")]
        build: bool,
        #[serde(default)]
        inline: Option<InlineHandlerSpec>,
        #[serde(flatten)]
        settings: HashMap<String, Value>,
    },
}

/// Restricted inline-rule form (spec §9 demotes the legacy's arbitrary
/// callable): `{match, replace}` for rename, or the bare `pass` marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InlineHandlerSpec {
    Pass,
    Rename { #[serde(rename = "match")] pattern: String, replace: String },
}

/// A single normalized handler descriptor the core dispatches on: either an
/// inline rule or an external plugin reference by id.
#[derive(Debug, Clone)]
pub struct HandlerDescriptor {
    pub spec: HandlerSpec,
    pub dev: bool,
    pub build: bool,
    /// Arbitrary settings bag passed to `plugin.exec(target, settings)`;
    /// `settings["path"]`, when present, rewrites `deploySourcePath`.
    pub settings: Value,
}

#[derive(Debug, Clone)]
pub enum HandlerSpec {
    Inline(InlineHandler),
    External { id: String, version: Option<String> },
}

#[derive(Debug, Clone)]
pub enum InlineHandler {
    Pass,
    Rename { pattern: regex::Regex, replace: String },
}

fn default_true() -> bool {
    true
}

impl HandlerDescriptor {
    pub fn from_file_spec(spec: &HandlerSpecFile) -> Result<Self> {
        match spec {
            HandlerSpecFile::Id(id) => Ok(HandlerDescriptor {
                spec: HandlerSpec::External { id: id.clone(), version: None },
                dev: false,
                build: true,
                settings: Value::Null,
            }),
            HandlerSpecFile::Full { id, version, dev, build, inline, settings } => {
                let handler_spec = if let Some(inline) = inline {
                    HandlerSpec::Inline(match inline {
                        InlineHandlerSpec::Pass => InlineHandler::Pass,
                        InlineHandlerSpec::Rename { pattern, replace } => InlineHandler::Rename {
                            pattern: regex::Regex::new(pattern)?,
                            replace: replace.clone(),
                        },
                    })
                } else {
                    let id = id.clone().ok_or_else(|| {
                        KilnError::ConfigMalformed("handler descriptor missing `id`".to_string())
                    })?;
                    HandlerSpec::External { id, version: version.clone() }
                };
                let settings = serde_json::to_value(settings).unwrap_or(Value::Null);
                Ok(HandlerDescriptor { spec: handler_spec, dev: *dev, build: *build, settings })
            }
        }
    }
}

/// A single `includes[]` entry before normalization into a `BuildInclude`
/// (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IncludeRule {
    #[serde(default)]
    pub r#match: Option<MatchList>,
    #[serde(default)]
    pub pattern: Option<MatchList>,
    #[serde(default)]
    pub exclude: Option<MatchList>,
    #[serde(default)]
    pub handlers: Vec<HandlerSpecFile>,
    #[serde(default)]
    pub options: HashMap<String, Value>,
    #[serde(default = "default_true")]
    pub build: bool,
}

/// `string | [string]` — a single pattern or a list of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MatchList {
    One(String),
    Many(Vec<String>),
}

impl MatchList {
    pub fn as_vec(&self) -> Vec<String> {
        match self {
            MatchList::One(s) => vec![s.clone()],
            MatchList::Many(v) => v.clone(),
        }
    }
}

/// The project config as parsed from disk (spec §3 `ProjectConfig`, §6 schema).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub base_path: Option<PathBuf>,
    pub build: PluginDescriptor,
    pub deploy: PluginDescriptor,
    #[serde(default)]
    pub includes: Vec<IncludeRule>,

    /// Diagnostic annotation naming which source file/type won the loader's
    /// fallback chain (spec §4.4: "annotated with `{info: {type, file}}`").
    #[serde(skip)]
    pub info: ConfigInfo,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigInfo {
    pub source_type: String,
    pub file: PathBuf,
}

/// Module-style (JSON/TOML, preferred) and `package.json`-style config
/// source file names tried in order (spec §4.4).
const MODULE_SOURCES: &[&str] = &["kiln.config.json", "kiln.config.toml", ".kilnrc.json"];
const JSON_FALLBACK_SOURCES: &[&str] = &["package.json"];

/// Loads the project config by trying, in order, the module-style sources
/// and then the JSON-fallback sources (`package.json`'s `"kiln"` key); the
/// first source that parses successfully wins (spec §4.4).
///
/// Reads go through [`crate::tree::Tree::get_blob`] rather than `std::fs`
/// directly, so the same loader serves both `PathTree` and `RepoTree`.
pub fn load_from_tree(tree: &dyn crate::tree::Tree) -> Result<ProjectConfig> {
    use std::io::Read;

    for name in MODULE_SOURCES {
        let Ok(mut reader) = tree.get_blob(Path::new(name)) else { continue };
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        let parsed = if name.ends_with(".toml") {
            toml::from_str::<ProjectConfig>(&text).map_err(KilnError::from)
        } else {
            serde_json::from_str::<ProjectConfig>(&text).map_err(KilnError::from)
        };
        if let Ok(mut cfg) = parsed {
            cfg.info = ConfigInfo { source_type: "module".to_string(), file: PathBuf::from(*name) };
            return Ok(cfg);
        }
    }

    for name in JSON_FALLBACK_SOURCES {
        let Ok(mut reader) = tree.get_blob(Path::new(name)) else { continue };
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        let root: Value = serde_json::from_str(&text)?;
        if let Some(sub) = root.get("kiln") {
            if let Ok(mut cfg) = serde_json::from_value::<ProjectConfig>(sub.clone()) {
                cfg.info = ConfigInfo { source_type: "json".to_string(), file: PathBuf::from(*name) };
                return Ok(cfg);
            }
        }
    }

    Err(KilnError::ConfigNotFound(PathBuf::from(tree.get_path().unwrap_or_default())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::path_tree::PathTree;
    use tempfile::TempDir;

    #[test]
    fn loads_module_style_json() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("kiln.config.json"),
            r#"{"build":"pass","deploy":"write","includes":[]}"#,
        )
        .unwrap();
        let tree = PathTree::new(dir.path().to_path_buf());
        let cfg = load_from_tree(&tree).unwrap();
        assert_eq!(cfg.build.id(), "pass");
        assert_eq!(cfg.info.source_type, "module");
    }

    #[test]
    fn falls_back_to_package_json() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"name":"proj","kiln":{"build":"pass","deploy":"write","includes":[]}}"#,
        )
        .unwrap();
        let tree = PathTree::new(dir.path().to_path_buf());
        let cfg = load_from_tree(&tree).unwrap();
        assert_eq!(cfg.deploy.id(), "write");
        assert_eq!(cfg.info.source_type, "json");
    }

    #[test]
    fn missing_config_is_fatal() {
        let dir = TempDir::new().unwrap();
        let tree = PathTree::new(dir.path().to_path_buf());
        assert!(matches!(load_from_tree(&tree), Err(KilnError::ConfigNotFound(_))));
    }
}
