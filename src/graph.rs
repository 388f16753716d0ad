//! The dependency graph recording source→product edges (spec §3, §4.1).
//!
//! The DFS-from-every-source resolution pattern is grounded on the teacher's
//! `resolver::topo::sort_dependencies` (visited/visiting `HashSet`s walked
//! recursively), adapted from "detect package dependency cycles" to "collapse
//! interior nodes out of the forward mapping".

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tree::Tree;

/// On-disk representation (spec §6): `{"map": {source: [leafProduct, ...]}}`.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct GraphStorageRepr {
    pub map: HashMap<PathBuf, Vec<PathBuf>>,
}

/// A product out of date relative to the last deploy, with the sources that
/// contributed to it (spec §4.1 `getOutOfDateProducts`).
#[derive(Debug, Clone)]
pub struct OutOfDateProduct {
    pub product: PathBuf,
    pub sources: Vec<PathBuf>,
}

/// Records raw source→product edges produced as a side effect of plugin
/// execution, and resolves them into forward/reverse leaf-closures (spec
/// §3 `DependencyGraph`).
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Raw edges, `node -> [node]`; multi-edges collapsed via `HashSet`,
    /// `A -> A` never recorded.
    connections: HashMap<PathBuf, HashSet<PathBuf>>,
    forward_mappings: Option<HashMap<PathBuf, HashSet<PathBuf>>>,
    reverse_mappings: Option<HashMap<PathBuf, HashSet<PathBuf>>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconstructs a graph from a persisted [`GraphStorageRepr`]: the
    /// stored map becomes both `connections` and `forwardMappings`, and
    /// `reverseMappings` is recomputed from it (spec §3: "Lifecycle").
    pub fn from_storage(repr: GraphStorageRepr) -> Self {
        let map: HashMap<PathBuf, HashSet<PathBuf>> = repr
            .map
            .into_iter()
            .map(|(k, v)| (k, v.into_iter().collect()))
            .collect();
        let reverse = reverse_of(&map);
        Self {
            connections: map.clone(),
            forward_mappings: Some(map),
            reverse_mappings: Some(reverse),
        }
    }

    /// True once both derived relations are present (spec §3: "'Loaded' means
    /// both derived relations are present").
    pub fn is_loaded(&self) -> bool {
        self.forward_mappings.is_some() && self.reverse_mappings.is_some()
    }

    /// No-op if `a == b`; otherwise records `b` as a product of `a`.
    /// Invalidates derived relations until the next [`DependencyGraph::resolve`].
    pub fn add_connection(&mut self, a: impl Into<PathBuf>, b: impl Into<PathBuf>) {
        let a = a.into();
        let b = b.into();
        if a == b {
            return;
        }
        self.connections.entry(a).or_default().insert(b);
        self.forward_mappings = None;
        self.reverse_mappings = None;
    }

    /// Computes `forwardMappings` and `reverseMappings` by DFS from every
    /// key of `connections`; idempotent on a stable edge set (spec §4.1).
    pub fn resolve(&mut self) {
        let mut forward: HashMap<PathBuf, HashSet<PathBuf>> = HashMap::new();
        let mut interior: HashSet<PathBuf> = HashSet::new();

        let roots: Vec<PathBuf> = self.connections.keys().cloned().collect();
        for root in &roots {
            let mut leaves = HashSet::new();
            let mut visiting = HashSet::new();
            self.collect_leaves(root, &mut leaves, &mut interior, &mut visiting, true);
            forward.insert(root.clone(), leaves);
        }

        // A node that appeared as an interior node of some traversal is not
        // a top-level source; drop it from forwardMappings' keys even if it
        // also has its own outgoing edges (spec §3).
        for node in &interior {
            forward.remove(node);
        }

        let reverse = reverse_of(&forward);
        self.forward_mappings = Some(forward);
        self.reverse_mappings = Some(reverse);
    }

    /// Depth-first walk from `node`; any node absent from `connections` is a
    /// leaf. `is_root` is false once we've descended past the starting node,
    /// marking everything below the root as interior.
    fn collect_leaves(
        &self,
        node: &Path,
        leaves: &mut HashSet<PathBuf>,
        interior: &mut HashSet<PathBuf>,
        visiting: &mut HashSet<PathBuf>,
        is_root: bool,
    ) {
        if !visiting.insert(node.to_path_buf()) {
            // A→…→A cycle beyond the direct collapse; stop descending.
            return;
        }
        if !is_root {
            interior.insert(node.to_path_buf());
        }
        match self.connections.get(node) {
            None => {
                leaves.insert(node.to_path_buf());
            }
            Some(children) => {
                for child in children {
                    self.collect_leaves(child, leaves, interior, visiting, false);
                }
            }
        }
        visiting.remove(node);
    }

    fn forward(&self) -> &HashMap<PathBuf, HashSet<PathBuf>> {
        self.forward_mappings.as_ref().expect("DependencyGraph::resolve must run before queries")
    }

    fn reverse(&self) -> &HashMap<PathBuf, HashSet<PathBuf>> {
        self.reverse_mappings.as_ref().expect("DependencyGraph::resolve must run before queries")
    }

    /// Union of reverse-mapping sources for every product reachable from
    /// `node` (spec §4.1 `calculateRequired`).
    pub fn calculate_required(&self, node: &Path) -> HashSet<PathBuf> {
        let mut required = HashSet::new();
        if let Some(products) = self.forward().get(node) {
            for product in products {
                if let Some(sources) = self.reverse().get(product) {
                    required.extend(sources.iter().cloned());
                }
            }
        }
        required
    }

    /// All leaf products (spec §4.1 `getProducts`).
    pub fn get_products(&self) -> Vec<PathBuf> {
        self.reverse().keys().cloned().collect()
    }

    /// For each product, ask the tree for its last mtime and whether any of
    /// its sources report modified since then (spec §4.1 `getOutOfDateProducts`).
    pub fn get_out_of_date_products(&self, tree: &dyn Tree) -> Result<Vec<OutOfDateProduct>> {
        let mut out = Vec::new();
        for (product, sources) in self.reverse() {
            let mtime = tree.get_mtime(product)?;
            let mut modified = false;
            for source in sources {
                if tree.is_blob_modified(source, Some(mtime))? {
                    modified = true;
                    break;
                }
            }
            if modified {
                out.push(OutOfDateProduct {
                    product: product.clone(),
                    sources: sources.iter().cloned().collect(),
                });
            }
        }
        Ok(out)
    }

    /// Sources reachable only by up-to-date products (spec §4.1 `getIgnoreSources`).
    pub fn get_ignore_sources(&self, tree: &dyn Tree) -> Result<HashSet<PathBuf>> {
        let mut ignore: HashSet<PathBuf> = self.forward().keys().cloned().collect();
        for out_of_date in self.get_out_of_date_products(tree)? {
            for source in out_of_date.sources {
                ignore.remove(&source);
            }
        }
        Ok(ignore)
    }

    pub fn has_product_for_source(&self, source: &Path) -> bool {
        self.forward().contains_key(source)
    }

    pub fn reset(&mut self) {
        self.connections.clear();
        self.forward_mappings = None;
        self.reverse_mappings = None;
    }

    /// Snapshot of `forwardMappings` for persistence (spec §4.1 `getStorageRepr`).
    pub fn get_storage_repr(&self) -> GraphStorageRepr {
        let map = self
            .forward()
            .iter()
            .map(|(k, v)| (k.clone(), v.iter().cloned().collect()))
            .collect();
        GraphStorageRepr { map }
    }
}

fn reverse_of(forward: &HashMap<PathBuf, HashSet<PathBuf>>) -> HashMap<PathBuf, HashSet<PathBuf>> {
    let mut reverse: HashMap<PathBuf, HashSet<PathBuf>> = HashMap::new();
    for (source, products) in forward {
        for product in products {
            reverse.entry(product.clone()).or_default().insert(source.clone());
        }
    }
    reverse
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::path_tree::PathTree;
    use tempfile::TempDir;

    #[test]
    fn self_loop_is_dropped() {
        let mut g = DependencyGraph::new();
        g.add_connection("a", "a");
        g.resolve();
        assert!(g.get_products().is_empty());
    }

    #[test]
    fn direct_leaf_edge() {
        let mut g = DependencyGraph::new();
        g.add_connection("src/a.js", "src/a.mjs");
        g.resolve();
        assert_eq!(g.get_products(), vec![PathBuf::from("src/a.mjs")]);
        assert_eq!(
            g.calculate_required(Path::new("src/a.js")),
            HashSet::from([PathBuf::from("src/a.js")])
        );
    }

    #[test]
    fn chain_collapses_interior_nodes() {
        let mut g = DependencyGraph::new();
        g.add_connection("a", "b");
        g.add_connection("b", "c");
        g.resolve();
        let repr = g.get_storage_repr();
        // `b` is interior (appeared as a child); only `a` remains a top-level key.
        assert!(!repr.map.contains_key(Path::new("b")));
        assert_eq!(repr.map.get(Path::new("a")).unwrap(), &vec![PathBuf::from("c")]);
    }

    #[test]
    fn round_trip_through_storage_repr() {
        let mut g = DependencyGraph::new();
        g.add_connection("a", "b");
        g.add_connection("c", "b");
        g.resolve();
        let repr = g.get_storage_repr();
        let mut g2 = DependencyGraph::from_storage(repr);
        g2.resolve();
        assert_eq!(g.get_storage_repr().map, g2.get_storage_repr().map);
    }

    #[test]
    fn resolve_is_idempotent() {
        let mut g = DependencyGraph::new();
        g.add_connection("a", "b");
        g.resolve();
        let first = g.get_storage_repr();
        g.resolve();
        let second = g.get_storage_repr();
        assert_eq!(first.map, second.map);
    }

    #[test]
    fn ignore_sources_excludes_out_of_date() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.js"), b"x").unwrap();
        std::fs::write(tmp.path().join("a.mjs"), b"x").unwrap();
        let tree = PathTree::new(tmp.path().to_path_buf());

        let mut g = DependencyGraph::new();
        g.add_connection("a.js", "a.mjs");
        g.resolve();

        let ignored = g.get_ignore_sources(&tree).unwrap();
        // Freshly-written files: product mtime >= source mtime, so nothing
        // should read as modified, and `a.js` should be ignorable.
        assert!(ignored.contains(Path::new("a.js")));
    }
}
