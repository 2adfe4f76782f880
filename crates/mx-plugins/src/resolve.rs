//! Dependency resolution and load ordering.
//!
//! Builds an index-based graph over `depends_on` edges and produces a
//! deterministic load order via a cycle-detecting topological sort.
//! A cycle, or a reference to a plugin outside the candidate set,
//! excludes the affected plugins (and everything depending on them)
//! without failing the rest of the boot.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use mx_core::PluginId;

use crate::manifest::PluginManifest;

/// Why a plugin fell out of the load order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveFailure {
    /// The plugin depends on something outside the candidate set.
    UnresolvedDependency {
        /// The missing dependency.
        missing: PluginId,
    },
    /// The plugin participates in a dependency cycle.
    DependencyCycle {
        /// Every plugin in the cycle, sorted.
        members: Vec<PluginId>,
    },
    /// The plugin depends (transitively) on an excluded plugin.
    DependentExcluded {
        /// The excluded dependency that caused this.
        on: PluginId,
    },
}

impl std::fmt::Display for ResolveFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnresolvedDependency { missing } => {
                write!(f, "depends on '{missing}', which is not in the candidate set")
            },
            Self::DependencyCycle { members } => {
                let names: Vec<&str> = members.iter().map(PluginId::as_str).collect();
                write!(f, "dependency cycle: {}", names.join(" -> "))
            },
            Self::DependentExcluded { on } => {
                write!(f, "depends on excluded plugin '{on}'")
            },
        }
    }
}

/// The resolver's result: a load order plus per-plugin exclusions.
#[derive(Debug, Default)]
pub struct ResolveOutcome {
    /// Admitted plugins in dependency-then-lexical order.
    pub order: Vec<PluginId>,
    /// Excluded plugins with their diagnostics, sorted by id.
    pub excluded: Vec<(PluginId, ResolveFailure)>,
}

/// Compute a deterministic load order for the candidate manifests.
///
/// Independent subgraphs are ordered stably by plugin id. Exclusions
/// cascade: a plugin whose dependency is excluded is itself excluded
/// with [`ResolveFailure::DependentExcluded`].
#[must_use]
pub fn resolve_load_order(candidates: &[&PluginManifest]) -> ResolveOutcome {
    // Arena: plugin id -> index, adjacency as index lists.
    let ids: Vec<PluginId> = candidates.iter().map(|m| m.plugin_id.clone()).collect();
    let index_of: BTreeMap<&PluginId, usize> =
        ids.iter().enumerate().map(|(i, id)| (id, i)).collect();

    let mut excluded: BTreeMap<PluginId, ResolveFailure> = BTreeMap::new();

    // Dependencies as indices; unresolved references excluded up front.
    let mut deps: Vec<Vec<usize>> = vec![Vec::new(); candidates.len()];
    for (i, manifest) in candidates.iter().enumerate() {
        for dep in &manifest.depends_on {
            match index_of.get(dep) {
                Some(&j) => deps[i].push(j),
                None => {
                    excluded.insert(
                        ids[i].clone(),
                        ResolveFailure::UnresolvedDependency {
                            missing: dep.clone(),
                        },
                    );
                },
            }
        }
    }

    // Cascade exclusions to dependents until a fixpoint.
    loop {
        let mut changed = false;
        for (i, dep_list) in deps.iter().enumerate() {
            if excluded.contains_key(&ids[i]) {
                continue;
            }
            if let Some(&bad) = dep_list.iter().find(|&&j| excluded.contains_key(&ids[j])) {
                excluded.insert(
                    ids[i].clone(),
                    ResolveFailure::DependentExcluded {
                        on: ids[bad].clone(),
                    },
                );
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Kahn's algorithm over the surviving nodes, with a lexically
    // ordered ready set for deterministic output.
    let alive: BTreeSet<usize> = (0..candidates.len())
        .filter(|&i| !excluded.contains_key(&ids[i]))
        .collect();
    let mut remaining_deps: BTreeMap<usize, BTreeSet<usize>> = alive
        .iter()
        .map(|&i| {
            let ds: BTreeSet<usize> = deps[i].iter().copied().filter(|j| alive.contains(j)).collect();
            (i, ds)
        })
        .collect();

    let mut order = Vec::new();
    loop {
        let mut ready: Vec<usize> = remaining_deps
            .iter()
            .filter(|(_, ds)| ds.is_empty())
            .map(|(&i, _)| i)
            .collect();
        if ready.is_empty() {
            break;
        }
        ready.sort_by(|&a, &b| ids[a].cmp(&ids[b]));
        for i in ready {
            remaining_deps.remove(&i);
            for ds in remaining_deps.values_mut() {
                ds.remove(&i);
            }
            order.push(ids[i].clone());
        }
    }

    // Whatever is left chains into a cycle. Distinguish members (nodes
    // reachable from themselves) from mere dependents.
    if !remaining_deps.is_empty() {
        let stuck: BTreeSet<usize> = remaining_deps.keys().copied().collect();
        let members: BTreeSet<usize> = stuck
            .iter()
            .copied()
            .filter(|&i| reaches_self(i, &deps, &stuck))
            .collect();
        let member_ids: Vec<PluginId> = {
            let mut v: Vec<PluginId> = members.iter().map(|&i| ids[i].clone()).collect();
            v.sort();
            v
        };
        warn!(members = ?member_ids, "dependency cycle detected");

        for &i in &stuck {
            let failure = if members.contains(&i) {
                ResolveFailure::DependencyCycle {
                    members: member_ids.clone(),
                }
            } else {
                let on = deps[i]
                    .iter()
                    .copied()
                    .find(|j| stuck.contains(j))
                    .map_or_else(|| ids[i].clone(), |j| ids[j].clone());
                ResolveFailure::DependentExcluded { on }
            };
            excluded.insert(ids[i].clone(), failure);
        }
    }

    ResolveOutcome {
        order,
        excluded: excluded.into_iter().collect(),
    }
}

/// Depth-first search: can `start` reach itself through `deps` edges
/// restricted to the `within` set?
fn reaches_self(start: usize, deps: &[Vec<usize>], within: &BTreeSet<usize>) -> bool {
    let mut stack: Vec<usize> = deps[start]
        .iter()
        .copied()
        .filter(|j| within.contains(j))
        .collect();
    let mut visited = BTreeSet::new();
    while let Some(node) = stack.pop() {
        if node == start {
            return true;
        }
        if !visited.insert(node) {
            continue;
        }
        stack.extend(deps[node].iter().copied().filter(|j| within.contains(j)));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{
        Compat, Entrypoint, EntrypointKind, HashLock, Permissions, PluginManifest,
    };
    use mx_core::Version;
    use std::collections::BTreeMap;

    fn manifest(id: &str, depends_on: &[&str]) -> PluginManifest {
        PluginManifest {
            plugin_id: PluginId::new(id).unwrap(),
            version: Version::new(1, 0, 0),
            enabled: true,
            entrypoints: vec![Entrypoint {
                kind: EntrypointKind::Capability,
                id: format!("{id}.main"),
                path: "bin/host".into(),
                callable: "serve".into(),
            }],
            permissions: Permissions::default(),
            compat: Compat {
                requires_kernel: Version::new(0, 1, 0),
                requires_schema_versions: std::collections::BTreeSet::new(),
            },
            depends_on: depends_on.iter().map(|d| PluginId::new(d).unwrap()).collect(),
            hash_lock: HashLock {
                manifest_digest: "blake3:aa".into(),
                artifact_digest: "blake3:bb".into(),
            },
            required_capabilities: Vec::new(),
            filesystem_policy: crate::manifest::FilesystemPolicy::default(),
            settings_schema: None,
            default_settings: None,
            io_contracts: BTreeMap::new(),
        }
    }

    fn resolve(manifests: &[PluginManifest]) -> ResolveOutcome {
        let refs: Vec<&PluginManifest> = manifests.iter().collect();
        resolve_load_order(&refs)
    }

    #[test]
    fn dependencies_load_first() {
        let manifests = vec![
            manifest("plugin.consumer", &["plugin.storage"]),
            manifest("plugin.storage", &[]),
        ];
        let outcome = resolve(&manifests);
        assert_eq!(
            outcome.order,
            vec![
                PluginId::from_static("plugin.storage"),
                PluginId::from_static("plugin.consumer"),
            ]
        );
        assert!(outcome.excluded.is_empty());
    }

    #[test]
    fn independent_plugins_order_lexically() {
        let manifests = vec![
            manifest("plugin.zeta", &[]),
            manifest("plugin.alpha", &[]),
            manifest("plugin.mid", &[]),
        ];
        let outcome = resolve(&manifests);
        assert_eq!(
            outcome.order,
            vec![
                PluginId::from_static("plugin.alpha"),
                PluginId::from_static("plugin.mid"),
                PluginId::from_static("plugin.zeta"),
            ]
        );
    }

    #[test]
    fn cycle_excludes_members_but_not_others() {
        let manifests = vec![
            manifest("plugin.a", &["plugin.b"]),
            manifest("plugin.b", &["plugin.a"]),
            manifest("plugin.c", &[]),
        ];
        let outcome = resolve(&manifests);
        assert_eq!(outcome.order, vec![PluginId::from_static("plugin.c")]);
        assert_eq!(outcome.excluded.len(), 2);
        for (_, failure) in &outcome.excluded {
            assert!(matches!(failure, ResolveFailure::DependencyCycle { members }
                if members.len() == 2));
        }
    }

    #[test]
    fn dependent_of_cycle_is_excluded_separately() {
        let manifests = vec![
            manifest("plugin.a", &["plugin.b"]),
            manifest("plugin.b", &["plugin.a"]),
            manifest("plugin.leech", &["plugin.a"]),
        ];
        let outcome = resolve(&manifests);
        assert!(outcome.order.is_empty());

        let leech = PluginId::from_static("plugin.leech");
        let failure = outcome
            .excluded
            .iter()
            .find(|(id, _)| id == &leech)
            .map(|(_, f)| f)
            .unwrap();
        assert!(matches!(failure, ResolveFailure::DependentExcluded { .. }));
    }

    #[test]
    fn unresolved_dependency_cascades() {
        let manifests = vec![
            manifest("plugin.a", &["plugin.ghost"]),
            manifest("plugin.b", &["plugin.a"]),
            manifest("plugin.c", &[]),
        ];
        let outcome = resolve(&manifests);
        assert_eq!(outcome.order, vec![PluginId::from_static("plugin.c")]);

        let a = PluginId::from_static("plugin.a");
        let b = PluginId::from_static("plugin.b");
        let failure_a = outcome.excluded.iter().find(|(id, _)| id == &a).unwrap();
        let failure_b = outcome.excluded.iter().find(|(id, _)| id == &b).unwrap();
        assert!(matches!(
            &failure_a.1,
            ResolveFailure::UnresolvedDependency { missing } if missing.as_str() == "plugin.ghost"
        ));
        assert!(matches!(
            &failure_b.1,
            ResolveFailure::DependentExcluded { on } if on == &a
        ));
    }

    #[test]
    fn resolution_is_idempotent() {
        let manifests = vec![
            manifest("plugin.b", &["plugin.a"]),
            manifest("plugin.a", &[]),
            manifest("plugin.d", &["plugin.b"]),
            manifest("plugin.c", &[]),
        ];
        let first = resolve(&manifests);
        let second = resolve(&manifests);
        assert_eq!(first.order, second.order);
    }

    #[test]
    fn empty_candidate_set() {
        let outcome = resolve(&[]);
        assert!(outcome.order.is_empty());
        assert!(outcome.excluded.is_empty());
    }
}
