// src/graph.rs

//! Dependency graph over installed manifests and install candidates
//!
//! Nodes are package names; an edge `a -> b` means `a` depends on `b` after
//! resolving `b` against every node's `provides` list. The graph answers
//! install ordering (leaves first, deterministic lexicographic tie-break),
//! reverse dependencies, orphan detection, and rebuild sets.
//!
//! A JSON cache of the graph may be persisted for speed. The cache is never
//! authoritative: it is rebuilt from the manifest store whenever the two
//! disagree, and dropped entirely by `purge-cache`.

use crate::db::ManifestStore;
use crate::error::{Error, Result};
use crate::fsutil::write_atomic;
use crate::metafile::Metafile;
use crate::package::dep_name;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// One node of the dependency graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub version: String,
    #[serde(default)]
    pub provides: Vec<String>,
    /// Raw dependency tokens (predicates intact) from build and run lists
    #[serde(default)]
    pub depends: Vec<String>,
    /// Whether this node came from an installed manifest
    #[serde(default)]
    pub installed: bool,
}

/// Directed dependency graph keyed by package name
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DepGraph {
    nodes: BTreeMap<String, Node>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from every installed manifest in the store
    pub fn from_store(store: &ManifestStore) -> Result<Self> {
        let mut graph = Self::new();
        for entry in store.list(None)? {
            graph.nodes.insert(
                entry.name.clone(),
                Node {
                    version: entry.version.clone(),
                    provides: entry.provides.clone(),
                    depends: entry.depends.all().map(str::to_string).collect(),
                    installed: true,
                },
            );
        }
        Ok(graph)
    }

    /// Add an install candidate from its metafile
    pub fn add_metafile(&mut self, meta: &Metafile) {
        self.nodes.insert(
            meta.name.clone(),
            Node {
                version: meta.version.clone(),
                provides: meta.provides.clone(),
                depends: meta.depends.all().map(str::to_string).collect(),
                installed: false,
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Map each provided alias to its provider's node name
    fn provider_map(&self) -> BTreeMap<&str, &str> {
        let mut map = BTreeMap::new();
        for (name, node) in &self.nodes {
            for alias in &node.provides {
                map.entry(alias.as_str()).or_insert(name.as_str());
            }
        }
        map
    }

    /// Resolved dependency edges of one node: tokens stripped of predicates
    /// and mapped through provides, restricted to names present in the graph
    pub fn edges_of(&self, name: &str) -> BTreeSet<String> {
        let providers = self.provider_map();
        let mut out = BTreeSet::new();
        if let Some(node) = self.nodes.get(name) {
            for token in &node.depends {
                let dep = dep_name(token);
                let resolved = if self.nodes.contains_key(dep) {
                    dep
                } else if let Some(provider) = providers.get(dep) {
                    provider
                } else {
                    continue; // absent from the graph; callers decide policy
                };
                if resolved != name {
                    out.insert(resolved.to_string());
                }
            }
        }
        out
    }

    /// Dependency tokens of `name` that no node satisfies by name or
    /// provides
    pub fn unresolved_of(&self, name: &str) -> Vec<String> {
        let providers = self.provider_map();
        let mut out = Vec::new();
        if let Some(node) = self.nodes.get(name) {
            for token in &node.depends {
                let dep = dep_name(token);
                if !self.nodes.contains_key(dep) && !providers.contains_key(dep) {
                    out.push(token.clone());
                }
            }
        }
        out
    }

    /// Compute install order for the dependency closure of `targets`
    ///
    /// Returns names leaves-first; ties break lexicographically so the order
    /// is deterministic. With `skip_installed`, already-installed nodes are
    /// omitted from the result (their position is still honored). Fails with
    /// `Cycle` when the closure is not a DAG.
    pub fn order(&self, targets: &[String], skip_installed: bool) -> Result<Vec<String>> {
        for t in targets {
            if !self.nodes.contains_key(t) {
                return Err(Error::NotFound(format!("package '{t}' is not in the graph")));
            }
        }

        // closure of the targets
        let mut closure = BTreeSet::new();
        let mut queue: VecDeque<String> = targets.iter().cloned().collect();
        while let Some(name) = queue.pop_front() {
            if !closure.insert(name.clone()) {
                continue;
            }
            for dep in self.edges_of(&name) {
                queue.push_back(dep);
            }
        }

        // Kahn's algorithm; the ready set is a BTreeSet so the smallest
        // eligible name always comes out first
        let mut remaining_deps: BTreeMap<String, BTreeSet<String>> = closure
            .iter()
            .map(|n| (n.clone(), self.edges_of(n)))
            .collect();
        let mut ready: BTreeSet<String> = remaining_deps
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(n, _)| n.clone())
            .collect();

        let mut ordered = Vec::with_capacity(closure.len());
        while let Some(next) = ready.iter().next().cloned() {
            ready.remove(&next);
            remaining_deps.remove(&next);
            ordered.push(next.clone());
            for (name, deps) in remaining_deps.iter_mut() {
                if deps.remove(&next) && deps.is_empty() {
                    ready.insert(name.clone());
                }
            }
        }

        if !remaining_deps.is_empty() {
            return Err(Error::Cycle(self.name_cycle(&remaining_deps)));
        }

        if skip_installed {
            ordered.retain(|n| {
                targets.contains(n) || !self.nodes.get(n).map(|node| node.installed).unwrap_or(false)
            });
        }
        Ok(ordered)
    }

    /// Walk the stuck subgraph to produce one concrete cycle for the error
    fn name_cycle(&self, stuck: &BTreeMap<String, BTreeSet<String>>) -> Vec<String> {
        let start = stuck.keys().next().expect("stuck set is non-empty");
        let mut path = vec![start.clone()];
        let mut seen = BTreeSet::from([start.clone()]);
        let mut current = start.clone();
        loop {
            let Some(next) = stuck
                .get(&current)
                .and_then(|deps| deps.iter().find(|d| stuck.contains_key(*d)))
            else {
                return path;
            };
            if !seen.insert(next.clone()) {
                path.push(next.clone());
                // trim the lead-in so the path starts at the repeated node
                if let Some(pos) = path.iter().position(|n| n == next) {
                    return path[pos..].to_vec();
                }
                return path;
            }
            path.push(next.clone());
            current = next.clone();
        }
    }

    /// All ancestors of `name`: every node that depends on it, directly or
    /// transitively
    pub fn revdeps(&self, name: &str) -> Vec<String> {
        let mut reverse: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        let edge_sets: Vec<(String, BTreeSet<String>)> = self
            .nodes
            .keys()
            .map(|n| (n.clone(), self.edges_of(n)))
            .collect();
        for (from, deps) in &edge_sets {
            for dep in deps {
                reverse.entry(dep.as_str()).or_default().insert(from.as_str());
            }
        }

        let mut out = BTreeSet::new();
        let mut queue: VecDeque<&str> = reverse
            .get(name)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        while let Some(current) = queue.pop_front() {
            if !out.insert(current.to_string()) {
                continue;
            }
            if let Some(parents) = reverse.get(current) {
                queue.extend(parents.iter().copied());
            }
        }
        out.into_iter().collect()
    }

    /// Installed nodes nothing depends on, minus the explicitly-kept set
    pub fn orphans(&self, keep: &BTreeSet<String>) -> Vec<String> {
        let mut depended_on = BTreeSet::new();
        for name in self.nodes.keys() {
            for dep in self.edges_of(name) {
                depended_on.insert(dep);
            }
        }
        self.nodes
            .iter()
            .filter(|(name, node)| {
                node.installed && !depended_on.contains(*name) && !keep.contains(*name)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// The set of ancestors of `name` that should be rebuilt after it
    /// changes, in dependency order
    pub fn rebuild(&self, name: &str) -> Result<Vec<String>> {
        let ancestors = self.revdeps(name);
        if ancestors.is_empty() {
            return Ok(Vec::new());
        }
        let ordered = self.order(&ancestors, false)?;
        Ok(ordered
            .into_iter()
            .filter(|n| ancestors.contains(n))
            .collect())
    }

    /// Render the graph in DOT format for visualization
    ///
    /// Edges point from dependent to dependency, after provides
    /// resolution, so `dot -Tsvg` draws the same relation `order` sorts.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph dependencies {\n");
        for name in self.nodes.keys() {
            out.push_str(&format!("    \"{name}\";\n"));
        }
        for name in self.nodes.keys() {
            for dep in self.edges_of(name) {
                out.push_str(&format!("    \"{name}\" -> \"{dep}\";\n"));
            }
        }
        out.push_str("}\n");
        out
    }

    // ------------------------------------------------------------------
    // Cache
    // ------------------------------------------------------------------

    /// Persist the graph as a JSON cache
    pub fn save_cache(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json)?;
        debug!(cache = %path.display(), nodes = self.nodes.len(), "graph cache written");
        Ok(())
    }

    /// Load a cached graph; `None` when the cache is absent or unreadable
    pub fn load_cache(path: &Path) -> Option<Self> {
        let text = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&text) {
            Ok(graph) => Some(graph),
            Err(err) => {
                warn!(cache = %path.display(), error = %err, "graph cache unreadable, ignoring");
                None
            }
        }
    }

    /// Drop the persisted cache
    pub fn purge_cache(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(format!("removing {}", path.display()), e)),
        }
    }

    /// Rebuild from the store and persist; returns the fresh graph
    pub fn sync(store: &ManifestStore, cache_path: &Path) -> Result<Self> {
        let graph = Self::from_store(store)?;
        graph.save_cache(cache_path)?;
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(version: &str, depends: &[&str], provides: &[&str], installed: bool) -> Node {
        Node {
            version: version.into(),
            provides: provides.iter().map(|s| s.to_string()).collect(),
            depends: depends.iter().map(|s| s.to_string()).collect(),
            installed,
        }
    }

    fn graph(entries: &[(&str, Node)]) -> DepGraph {
        let mut g = DepGraph::new();
        for (name, n) in entries {
            g.nodes.insert(name.to_string(), n.clone());
        }
        g
    }

    #[test]
    fn test_order_leaves_first() {
        let g = graph(&[
            ("gcc", node("13", &["glibc", "binutils"], &[], false)),
            ("binutils", node("2.41", &["glibc"], &[], false)),
            ("glibc", node("2.38", &[], &[], false)),
        ]);
        let order = g.order(&["gcc".into()], false).unwrap();
        assert_eq!(order, vec!["glibc", "binutils", "gcc"]);
    }

    #[test]
    fn test_order_is_deterministic_lexicographic() {
        let g = graph(&[
            ("top", node("1", &["beta", "alpha", "gamma"], &[], false)),
            ("alpha", node("1", &[], &[], false)),
            ("beta", node("1", &[], &[], false)),
            ("gamma", node("1", &[], &[], false)),
        ]);
        let order = g.order(&["top".into()], false).unwrap();
        assert_eq!(order, vec!["alpha", "beta", "gamma", "top"]);
    }

    #[test]
    fn test_order_every_dep_before_dependent() {
        let g = graph(&[
            ("a", node("1", &["b", "c"], &[], false)),
            ("b", node("1", &["d"], &[], false)),
            ("c", node("1", &["d"], &[], false)),
            ("d", node("1", &[], &[], false)),
        ]);
        let order = g.order(&["a".into()], false).unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("d") < pos("b"));
        assert!(pos("d") < pos("c"));
        assert!(pos("b") < pos("a"));
        assert!(pos("c") < pos("a"));
    }

    #[test]
    fn test_cycle_detection_names_members() {
        let g = graph(&[
            ("a", node("1", &["b"], &[], false)),
            ("b", node("1", &["a"], &[], false)),
            ("standalone", node("1", &[], &[], false)),
        ]);
        let err = g.order(&["a".into()], false).unwrap_err();
        match err {
            Error::Cycle(members) => {
                assert!(members.contains(&"a".to_string()));
                assert!(members.contains(&"b".to_string()));
                assert!(!members.contains(&"standalone".to_string()));
            }
            other => panic!("expected Cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_provides_resolution() {
        let g = graph(&[
            ("mta-user", node("1", &["mta"], &[], false)),
            ("postfix", node("3.8", &[], &["mta"], false)),
        ]);
        let order = g.order(&["mta-user".into()], false).unwrap();
        assert_eq!(order, vec!["postfix", "mta-user"]);
        assert_eq!(g.edges_of("mta-user"), BTreeSet::from(["postfix".to_string()]));
    }

    #[test]
    fn test_skip_installed() {
        let g = graph(&[
            ("app", node("1", &["lib"], &[], false)),
            ("lib", node("1", &[], &[], true)),
        ]);
        let order = g.order(&["app".into()], true).unwrap();
        assert_eq!(order, vec!["app"]);
        let full = g.order(&["app".into()], false).unwrap();
        assert_eq!(full, vec!["lib", "app"]);
    }

    #[test]
    fn test_revdep_symmetry() {
        let g = graph(&[
            ("a", node("1", &["b"], &[], true)),
            ("b", node("1", &["c"], &[], true)),
            ("c", node("1", &[], &[], true)),
        ]);
        // b depends on c  <=>  b in revdeps(c)
        assert_eq!(g.revdeps("c"), vec!["a", "b"]);
        assert_eq!(g.revdeps("b"), vec!["a"]);
        assert!(g.revdeps("a").is_empty());
        for name in ["a", "b", "c"] {
            for dep in g.edges_of(name) {
                assert!(g.revdeps(&dep).contains(&name.to_string()));
            }
        }
    }

    #[test]
    fn test_orphans_soundness() {
        let g = graph(&[
            ("alpha", node("1", &[], &[], true)),
            ("beta", node("1", &["alpha"], &[], true)),
            ("gamma", node("1", &[], &[], true)),
        ]);
        let orphans = g.orphans(&BTreeSet::new());
        assert_eq!(orphans, vec!["beta", "gamma"]);
        for o in &orphans {
            assert!(g.revdeps(o).is_empty());
        }

        let keep = BTreeSet::from(["gamma".to_string()]);
        assert_eq!(g.orphans(&keep), vec!["beta"]);
    }

    #[test]
    fn test_rebuild_closure_in_order() {
        let g = graph(&[
            ("zlib", node("1.3", &[], &[], true)),
            ("libpng", node("1.6", &["zlib"], &[], true)),
            ("gd", node("2.3", &["libpng", "zlib"], &[], true)),
        ]);
        let rebuild = g.rebuild("zlib").unwrap();
        assert_eq!(rebuild, vec!["libpng", "gd"]);
        assert!(g.rebuild("gd").unwrap().is_empty());
    }

    #[test]
    fn test_unresolved_deps() {
        let g = graph(&[("app", node("1", &["missing>=2.0", "here"], &[], false)),
                        ("here", node("1", &[], &[], true))]);
        assert_eq!(g.unresolved_of("app"), vec!["missing>=2.0"]);
    }

    #[test]
    fn test_dot_export_lists_nodes_and_edges() {
        let g = graph(&[
            ("app", node("1", &["lib>=2"], &[], true)),
            ("lib", node("2", &[], &[], true)),
        ]);
        let dot = g.to_dot();
        assert!(dot.starts_with("digraph dependencies {"));
        assert!(dot.contains("    \"app\";\n"));
        assert!(dot.contains("    \"lib\";\n"));
        assert!(dot.contains("\"app\" -> \"lib\";"));
        assert!(dot.trim_end().ends_with('}'));
    }

    #[test]
    fn test_cache_roundtrip_and_purge() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("depgraph.json");
        let g = graph(&[("alpha", node("1.0", &[], &[], true))]);
        g.save_cache(&cache).unwrap();

        let loaded = DepGraph::load_cache(&cache).unwrap();
        assert!(loaded.contains("alpha"));
        assert_eq!(loaded.node("alpha").unwrap().version, "1.0");

        DepGraph::purge_cache(&cache).unwrap();
        assert!(!cache.exists());
        assert!(DepGraph::load_cache(&cache).is_none());
        // purging twice is fine
        DepGraph::purge_cache(&cache).unwrap();
    }
}
