//! kiln — an incremental build-and-deploy engine for file-tree projects.
//!
//! A project tree (a live filesystem directory or a snapshot taken from a
//! version-control repository) is walked for candidate files ("targets"),
//! each target is routed through a configured chain of build plugins, and the
//! resulting set of output targets is handed to a deploy plugin chain that
//! writes them out. Between runs a [`graph::DependencyGraph`] records which
//! source files produced which build products so later runs can skip
//! sources whose outputs are still current.

pub mod cancel;
pub mod error;
pub mod graph;
pub mod kernel;
pub mod plugin;
pub mod project_config;
pub mod settings;
pub mod storage;
pub mod target;
pub mod tree;

pub mod builder;
pub mod deploy;

pub use error::{KilnError, Result};
