//! Component A (Registry) and Component B (Dependency Resolver).
//!
//! Registration is process-wide and order-blind: extensions announce
//! themselves via `inventory::submit!` (emitted by the `#[extension(...)]`
//! macro) before `main` runs. `Registry::discover_and_build` drains that
//! table into a name-keyed map, the one place duplicate names are caught.
//! The resolver is a pure function over a snapshot of that map — it never
//! touches registry state and can be exercised without discovery.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::contracts::Extension;
use crate::errors::CoreError;

/// The function type submitted by the `#[extension(...)]` macro.
pub struct Registrator(pub fn(&mut RegistryBuilder));

inventory::collect!(Registrator);

/// Edge kind retained alongside the target name, for `Registry::graph`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Strong,
    Weak,
}

/// One dependency edge `from -> to` of the given kind.
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: &'static str,
    pub to: &'static str,
    pub kind: EdgeKind,
}

/// Builder fed by macro-emitted registrators before the final map exists.
#[derive(Default)]
pub struct RegistryBuilder {
    extensions: HashMap<&'static str, Arc<dyn Extension>>,
    errors: Vec<String>,
}

impl RegistryBuilder {
    pub fn register(&mut self, ext: Arc<dyn Extension>) {
        let name = ext.name();
        if self.extensions.contains_key(name) {
            self.errors
                .push(format!("extension '{name}' is already registered"));
            return;
        }
        self.extensions.insert(name, ext);
    }

    fn build(self) -> Result<Registry, CoreError> {
        if let Some(first) = self.errors.into_iter().next() {
            return Err(CoreError::AlreadyRegistered(first));
        }
        Ok(Registry {
            extensions: self.extensions,
        })
    }
}

/// The process-global, order-blind table of registered extensions.
#[derive(Default, Clone)]
pub struct Registry {
    extensions: HashMap<&'static str, Arc<dyn Extension>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the `inventory`-collected registrators into a fresh registry.
    pub fn discover_and_build() -> Result<Self, CoreError> {
        let mut builder = RegistryBuilder::default();
        for registrator in inventory::iter::<Registrator> {
            registrator.0(&mut builder);
        }
        builder.build()
    }

    /// Register a single extension directly (used by the plugin loader and
    /// by tests that don't want to depend on process-wide `inventory` state).
    pub fn register(&mut self, ext: Arc<dyn Extension>) -> Result<(), CoreError> {
        let name = ext.name();
        if self.extensions.contains_key(name) {
            return Err(CoreError::AlreadyRegistered(name.to_string()));
        }
        self.extensions.insert(name, ext);
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn Extension>> {
        self.extensions.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Extension>> {
        self.extensions.get(name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<dyn Extension>> {
        self.extensions.values().cloned().collect()
    }

    pub fn by_group(&self, group: &str) -> Vec<Arc<dyn Extension>> {
        self.extensions
            .values()
            .filter(|e| e.metadata().group == group)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Snapshot the declared dependency edges, filtered to names currently
    /// registered (a weak edge to an absent name is simply omitted).
    pub fn graph(&self) -> (Vec<&'static str>, Vec<Edge>) {
        let names: Vec<&'static str> = self.extensions.keys().copied().collect();
        let mut edges = Vec::new();
        for (&name, ext) in &self.extensions {
            let deps = ext.dependencies();
            for dep in deps.strong {
                edges.push(Edge {
                    from: name,
                    to: dep,
                    kind: EdgeKind::Strong,
                });
            }
            for dep in deps.weak {
                if self.extensions.contains_key(dep) {
                    edges.push(Edge {
                        from: name,
                        to: dep,
                        kind: EdgeKind::Weak,
                    });
                }
            }
        }
        (names, edges)
    }
}

/// Detect a cycle in the given adjacency (`dep -> dependent` direction,
/// i.e. the order edges run in after `Resolver::build_adjacency`), via DFS
/// with three-color marking. Returns one witness cycle if present.
fn detect_cycle(names: &[&'static str], adj: &[Vec<usize>]) -> Option<Vec<&'static str>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut colors = vec![Color::White; names.len()];
    let mut path = Vec::new();

    fn dfs(
        node: usize,
        names: &[&'static str],
        adj: &[Vec<usize>],
        colors: &mut [Color],
        path: &mut Vec<usize>,
    ) -> Option<Vec<&'static str>> {
        colors[node] = Color::Gray;
        path.push(node);

        for &neighbor in &adj[node] {
            match colors[neighbor] {
                Color::Gray => {
                    if let Some(start) = path.iter().position(|&n| n == neighbor) {
                        let mut cycle: Vec<&'static str> =
                            path[start..].iter().map(|&i| names[i]).collect();
                        cycle.push(names[neighbor]);
                        return Some(cycle);
                    }
                }
                Color::White => {
                    if let Some(cycle) = dfs(neighbor, names, adj, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        path.pop();
        colors[node] = Color::Black;
        None
    }

    for i in 0..names.len() {
        if colors[i] == Color::White {
            if let Some(cycle) = dfs(i, names, adj, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Pure dependency resolver: produces a total init order over a graph
/// snapshot, or fails with `CyclicDependency`.
///
/// Reserved names (e.g. a "linker"-style extension that must always come
/// last) are forced to the tail of the order, lexicographically among
/// themselves, regardless of their own edges.
pub struct Resolver;

impl Resolver {
    pub fn resolve(
        names: &[&'static str],
        edges: &[Edge],
        reserved: &[&'static str],
    ) -> Result<Vec<&'static str>, CoreError> {
        let reserved_set: HashSet<&'static str> = reserved.iter().copied().collect();

        let mut idx: HashMap<&'static str, usize> = HashMap::new();
        let mut ordered_names: Vec<&'static str> = names.to_vec();
        ordered_names.sort_unstable();
        for (i, &n) in ordered_names.iter().enumerate() {
            idx.insert(n, i);
        }

        // strong/weak edge lists, each `to -> from` (dependency before dependent)
        let mut strong: Vec<(usize, usize)> = Vec::new();
        let mut weak: Vec<(usize, usize)> = Vec::new();
        for e in edges {
            let from = match idx.get(e.from) {
                Some(&i) => i,
                None => continue,
            };
            let to = match idx.get(e.to) {
                Some(&i) => i,
                None => {
                    if e.kind == EdgeKind::Strong {
                        return Err(CoreError::MissingDependency {
                            module: e.from.to_string(),
                            dep: e.to.to_string(),
                        });
                    }
                    continue;
                }
            };
            match e.kind {
                EdgeKind::Strong => strong.push((to, from)),
                EdgeKind::Weak => weak.push((to, from)),
            }
        }

        // out-degree (total declared deps) per node, for the drop heuristic
        let mut out_degree = vec![0usize; ordered_names.len()];
        for &(_, from) in strong.iter().chain(weak.iter()) {
            out_degree[from] += 1;
        }

        let build_adj = |strong: &[(usize, usize)], weak: &[(usize, usize)]| {
            let mut adj = vec![Vec::<usize>::new(); ordered_names.len()];
            for &(to, from) in strong.iter().chain(weak.iter()) {
                adj[to].push(from);
            }
            adj
        };

        // Drop weak edges participating in a cycle until the full graph is
        // acyclic, preferring to drop the weak edge leaving the node with
        // the larger out-degree (tie-break: lexicographically larger name).
        let mut weak = weak;
        loop {
            let adj = build_adj(&strong, &weak);
            let Some(cycle) = detect_cycle(&ordered_names, &adj) else {
                break;
            };
            let cycle_set: HashSet<&'static str> = cycle.iter().copied().collect();
            let candidate = weak
                .iter()
                .enumerate()
                .filter(|(_, &(to, from))| {
                    cycle_set.contains(ordered_names[to]) && cycle_set.contains(ordered_names[from])
                })
                .max_by(|(_, &(_, a)), (_, &(_, b))| {
                    out_degree[a]
                        .cmp(&out_degree[b])
                        .then_with(|| ordered_names[a].cmp(ordered_names[b]))
                })
                .map(|(i, _)| i);

            match candidate {
                Some(i) => {
                    weak.remove(i);
                }
                None => {
                    // Cycle survives on strong edges alone.
                    return Err(CoreError::CyclicDependency {
                        path: cycle.into_iter().map(str::to_string).collect(),
                    });
                }
            }
        }

        let adj = build_adj(&strong, &weak);
        let mut indeg = vec![0usize; ordered_names.len()];
        for list in &adj {
            for &target in list {
                indeg[target] += 1;
            }
        }

        // Deterministic Kahn's algorithm: always pop the lexicographically
        // smallest ready node, with reserved names held back to the tail.
        let mut ready: VecDeque<usize> = VecDeque::new();
        let mut order = Vec::with_capacity(ordered_names.len());
        let is_ready = |i: usize, indeg: &[usize]| indeg[i] == 0;

        let mut remaining: Vec<usize> = (0..ordered_names.len()).collect();
        while !remaining.is_empty() {
            remaining.retain(|&i| indeg[i] != usize::MAX);
            let mut candidates: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|&i| is_ready(i, &indeg))
                .collect();
            if candidates.is_empty() {
                break;
            }
            // Among ready nodes, prefer non-reserved names first (reserved
            // stay ready but get pushed behind), each group lexicographic.
            candidates.sort_by(|&a, &b| {
                let ra = reserved_set.contains(ordered_names[a]);
                let rb = reserved_set.contains(ordered_names[b]);
                ra.cmp(&rb).then_with(|| ordered_names[a].cmp(ordered_names[b]))
            });
            let picked = candidates[0];
            order.push(picked);
            indeg[picked] = usize::MAX;
            for &target in &adj[picked] {
                indeg[target] -= 1;
            }
            ready.clear();
        }

        if order.len() != ordered_names.len() {
            // Leftover nodes never became ready: a strong-only cycle the
            // weak-edge pass above could not see because it touched edges
            // we already dropped. Surface the remaining names as the cycle.
            let leftover: Vec<String> = ordered_names
                .iter()
                .enumerate()
                .filter(|(i, _)| indeg[*i] != usize::MAX)
                .map(|(_, &n)| n.to_string())
                .collect();
            return Err(CoreError::CyclicDependency { path: leftover });
        }

        Ok(order.into_iter().map(|i| ordered_names[i]).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExtensionCtx;
    use async_trait::async_trait;

    struct Dummy {
        name: &'static str,
        strong: Vec<&'static str>,
        weak: Vec<&'static str>,
    }

    #[async_trait]
    impl Extension for Dummy {
        fn name(&self) -> &'static str {
            self.name
        }
        fn version(&self) -> &'static str {
            "0.0.0"
        }
        fn dependencies(&self) -> crate::contracts::Dependencies {
            crate::contracts::Dependencies::new(self.strong.clone(), self.weak.clone())
        }
        async fn init(&self, _ctx: &ExtensionCtx) -> anyhow::Result<()> {
            Ok(())
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn dummy(name: &'static str, strong: &[&'static str], weak: &[&'static str]) -> Arc<dyn Extension> {
        Arc::new(Dummy {
            name,
            strong: strong.to_vec(),
            weak: weak.to_vec(),
        })
    }

    #[test]
    fn linear_deps_resolve_in_order() {
        let mut reg = Registry::new();
        reg.register(dummy("a", &[], &[])).unwrap();
        reg.register(dummy("b", &["a"], &[])).unwrap();
        reg.register(dummy("c", &["b"], &[])).unwrap();

        let (names, edges) = reg.graph();
        let order = Resolver::resolve(&names, &edges, &[]).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn weak_edge_breaks_cycle() {
        let mut reg = Registry::new();
        reg.register(dummy("x", &["y"], &[])).unwrap();
        reg.register(dummy("y", &[], &["x"])).unwrap();

        let (names, edges) = reg.graph();
        let order = Resolver::resolve(&names, &edges, &[]).unwrap();
        assert_eq!(order, vec!["y", "x"]);
    }

    #[test]
    fn strong_cycle_is_unresolvable() {
        let mut reg = Registry::new();
        reg.register(dummy("p", &["q"], &[])).unwrap();
        reg.register(dummy("q", &["p"], &[])).unwrap();

        let (names, edges) = reg.graph();
        let err = Resolver::resolve(&names, &edges, &[]).unwrap_err();
        match err {
            CoreError::CyclicDependency { path } => {
                assert!(path.contains(&"p".to_string()));
                assert!(path.contains(&"q".to_string()));
            }
            other => panic!("expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn missing_strong_dependency_errors() {
        let mut reg = Registry::new();
        reg.register(dummy("a", &["missing"], &[])).unwrap();

        let (names, edges) = reg.graph();
        let err = Resolver::resolve(&names, &edges, &[]).unwrap_err();
        match err {
            CoreError::MissingDependency { module, dep } => {
                assert_eq!(module, "a");
                assert_eq!(dep, "missing");
            }
            other => panic!("expected MissingDependency, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut reg = Registry::new();
        reg.register(dummy("a", &[], &[])).unwrap();
        let err = reg.register(dummy("a", &[], &[])).unwrap_err();
        assert!(matches!(err, CoreError::AlreadyRegistered(_)));
    }

    #[test]
    fn reserved_names_forced_to_tail() {
        let mut reg = Registry::new();
        reg.register(dummy("linker", &[], &[])).unwrap();
        reg.register(dummy("a", &[], &[])).unwrap();
        reg.register(dummy("b", &[], &[])).unwrap();

        let (names, edges) = reg.graph();
        let order = Resolver::resolve(&names, &edges, &["linker"]).unwrap();
        assert_eq!(order, vec!["a", "b", "linker"]);
    }

    #[test]
    fn empty_registry_resolves_empty_plan() {
        let reg = Registry::new();
        let (names, edges) = reg.graph();
        let order = Resolver::resolve(&names, &edges, &[]).unwrap();
        assert!(order.is_empty());
    }
}
