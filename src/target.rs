//! The [`Target`] model — a unit flowing through the build pipeline — and
//! the [`DelayedTarget`] used during tree walking so file handles open only
//! once a target is actually admitted (spec §3, §4.2).

use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{KilnError, Result};
use crate::project_config::HandlerDescriptor;

/// A readable byte source for a target's content. Grounded on the teacher's
/// archive-reading code, which always hands back a boxed `Read` rather than
/// an owned buffer until the caller actually needs the bytes.
pub type TargetReader = Box<dyn Read + Send>;

/// Per spec §9's "ad-hoc variant types" note: a target either has a live
/// stream or has had it drained into an owned buffer, never both.
enum TargetBody {
    Source(TargetReader),
    Drained(Vec<u8>),
}

impl std::fmt::Debug for TargetBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetBody::Source(_) => write!(f, "Source(<stream>)"),
            TargetBody::Drained(buf) => write!(f, "Drained({} bytes)", buf.len()),
        }
    }
}

/// A unit flowing through the pipeline: name, source path, byte content,
/// options, remaining handler list, depth (spec §3 "Target").
#[derive(Debug)]
pub struct Target {
    source_path: PathBuf,
    name: String,
    body: TargetBody,
    deploy_source_path: PathBuf,
    deploy_path: Option<PathBuf>,
    pub options: HashMap<String, Value>,
    pub handlers: VecDeque<HandlerDescriptor>,
    pub level: u32,
    pub recursive: bool,
}

impl Target {
    /// Construct a target rooted at a tree-relative `source_path` directory
    /// and file `name`. Rejects absolute `source_path`s (spec §3, `PathInvalid`).
    pub fn new(source_path: impl Into<PathBuf>, name: impl Into<String>, reader: TargetReader) -> Result<Self> {
        let source_path = source_path.into();
        if source_path.is_absolute() {
            return Err(KilnError::PathInvalid(source_path));
        }
        Ok(Self {
            deploy_source_path: source_path.clone(),
            source_path,
            name: name.into(),
            body: TargetBody::Source(reader),
            deploy_path: None,
            options: HashMap::new(),
            handlers: VecDeque::new(),
            level: 1,
            recursive: false,
        })
    }

    /// Construct a target whose content is already in memory (used by
    /// [`Target::make_output_target`] and by plugins producing fresh bytes).
    pub fn from_bytes(source_path: impl Into<PathBuf>, name: impl Into<String>, content: Vec<u8>) -> Result<Self> {
        let source_path = source_path.into();
        if source_path.is_absolute() {
            return Err(KilnError::PathInvalid(source_path));
        }
        Ok(Self {
            deploy_source_path: source_path.clone(),
            source_path,
            name: name.into(),
            body: TargetBody::Drained(content),
            deploy_path: None,
            options: HashMap::new(),
            handlers: VecDeque::new(),
            level: 1,
            recursive: false,
        })
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn deploy_source_path(&self) -> &Path {
        &self.deploy_source_path
    }

    /// The `(sourcePath, targetName)` identity, joined into a single
    /// tree-relative path — used as the DependencyGraph node name and as
    /// the `DeployContext.map` lookup key.
    pub fn source_target_path(&self) -> PathBuf {
        self.source_path.join(&self.name)
    }

    pub fn deploy_source_target_path(&self) -> PathBuf {
        self.deploy_source_path.join(&self.name)
    }

    /// Drains the stream once and caches the bytes; subsequent calls return
    /// the cached content (spec §4.2 `loadContent`).
    pub fn load_content(&mut self) -> Result<&[u8]> {
        if let TargetBody::Source(reader) = &mut self.body {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            self.body = TargetBody::Drained(buf);
        }
        match &self.body {
            TargetBody::Drained(buf) => Ok(buf),
            TargetBody::Source(_) => unreachable!("drained above"),
        }
    }

    pub fn is_drained(&self) -> bool {
        matches!(self.body, TargetBody::Drained(_))
    }

    /// Overwrites the target's content with an in-memory buffer, as a
    /// deploy plugin does when synthesizing a product from removed parents
    /// (e.g. `combine`'s concatenated bytes).
    pub fn replace_content(&mut self, content: Vec<u8>) {
        self.body = TargetBody::Drained(content);
    }

    /// Consumes `self`, yielding a new Target that shares the underlying
    /// stream/content under a (possibly) new name/path — spec's pipeline
    /// "move" semantics (spec §4.2 `pass`).
    pub fn pass(mut self, new_name: Option<String>, new_path: Option<PathBuf>) -> Self {
        if let Some(name) = new_name {
            self.name = name;
        }
        if let Some(path) = new_path {
            self.deploy_source_path = path.clone();
            self.source_path = path;
        }
        self
    }

    /// Allocates a fresh, empty in-memory output target sharing this
    /// target's path identity unless overridden (spec §4.2 `makeOutputTarget`).
    pub fn make_output_target(&self, new_name: Option<String>, new_path: Option<PathBuf>) -> Result<Self> {
        let source_path = new_path.unwrap_or_else(|| self.source_path.clone());
        let name = new_name.unwrap_or_else(|| self.name.clone());
        let mut t = Target::from_bytes(source_path, name, Vec::new())?;
        t.options = self.options.clone();
        t.level = self.level;
        Ok(t)
    }

    /// Honors only `settings["path"]`, rewriting `deploySourcePath` — the
    /// only field of a handler's settings the core interprets (spec §4.2
    /// `applySettings`).
    pub fn apply_settings(&mut self, settings: &Value) {
        if let Some(path) = settings.get("path").and_then(Value::as_str) {
            self.deploy_source_path = PathBuf::from(path);
        }
    }

    /// Merges `options` into the target's option bag (spec §4.2 `applyOptions`).
    pub fn apply_options(&mut self, options: &HashMap<String, Value>) {
        for (k, v) in options {
            self.options.insert(k.clone(), v.clone());
        }
    }

    /// Inherits the parent's remaining handlers and increments level; the
    /// parent's handler list is cleared (spec §4.2 `setFromParent`).
    pub fn set_from_parent(&mut self, parent: &mut Target) {
        self.handlers = std::mem::take(&mut parent.handlers);
        self.level = parent.level + 1;
    }

    /// Sets `deployPath = join(base, deploySourcePath)`. Called exactly once
    /// per target (spec §3).
    pub fn set_deploy_path(&mut self, base: &Path) {
        self.deploy_path = Some(base.join(&self.deploy_source_path).join(&self.name));
    }

    pub fn has_deploy_path(&self) -> bool {
        self.deploy_path.is_some()
    }

    /// Requires [`Target::set_deploy_path`] to have run first (spec §3).
    pub fn get_deploy_target_path(&self) -> Result<&Path> {
        self.deploy_path
            .as_deref()
            .ok_or_else(|| KilnError::StateViolation(format!(
                "target {} has no deploy path set",
                self.source_target_path().display()
            )))
    }

    pub fn next_handler(&mut self) -> Option<HandlerDescriptor> {
        self.handlers.pop_front()
    }
}

/// A promise-of-Target used while walking a tree, so file handles open only
/// once the candidate is actually admitted (spec §3 `DelayedTarget`).
pub struct DelayedTarget {
    pub path: PathBuf,
    pub name: String,
    create_stream: Box<dyn FnOnce() -> Result<TargetReader> + Send>,
}

impl DelayedTarget {
    pub fn new(
        path: impl Into<PathBuf>,
        name: impl Into<String>,
        create_stream: impl FnOnce() -> Result<TargetReader> + Send + 'static,
    ) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            create_stream: Box::new(create_stream),
        }
    }

    /// Tree-relative path of the candidate, as matched against include rules.
    pub fn candidate_path(&self) -> PathBuf {
        self.path.join(&self.name)
    }

    /// Opens the underlying stream and constructs a real [`Target`]. This is
    /// the point at which the file handle is actually opened.
    pub fn resolve(self) -> Result<Target> {
        let reader = (self.create_stream)()?;
        Target::new(self.path, self.name, reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(bytes: &'static [u8]) -> TargetReader {
        Box::new(bytes)
    }

    #[test]
    fn rejects_absolute_source_path() {
        let err = Target::new("/etc", "a.js", reader(b"x")).unwrap_err();
        assert!(matches!(err, KilnError::PathInvalid(_)));
    }

    #[test]
    fn load_content_drains_once() {
        let mut t = Target::new("src", "a.js", reader(b"hello")).unwrap();
        assert_eq!(t.load_content().unwrap(), b"hello");
        assert!(t.is_drained());
        // Second call returns cached content without re-reading.
        assert_eq!(t.load_content().unwrap(), b"hello");
    }

    #[test]
    fn pass_renames_and_repaths() {
        let t = Target::new("src", "a.js", reader(b"x")).unwrap();
        let t2 = t.pass(Some("a.mjs".to_string()), None);
        assert_eq!(t2.name(), "a.mjs");
        assert_eq!(t2.source_path(), Path::new("src"));
    }

    #[test]
    fn apply_settings_rewrites_deploy_path_only() {
        let mut t = Target::new("src", "a.js", reader(b"x")).unwrap();
        let settings = serde_json::json!({"path": "out/a.js", "unrelated": true});
        t.apply_settings(&settings);
        assert_eq!(t.deploy_source_path(), Path::new("out/a.js"));
        assert_eq!(t.source_path(), Path::new("src"));
    }

    #[test]
    fn deploy_path_requires_set_deploy_path() {
        let t = Target::new("src", "a.js", reader(b"x")).unwrap();
        assert!(t.get_deploy_target_path().is_err());
    }

    #[test]
    fn set_from_parent_moves_handlers_and_increments_level() {
        let mut parent = Target::new("src", "a.js", reader(b"x")).unwrap();
        parent.level = 3;
        let mut child = Target::from_bytes("src", "a.out", Vec::new()).unwrap();
        child.set_from_parent(&mut parent);
        assert_eq!(child.level, 4);
        assert!(parent.handlers.is_empty());
    }
}
