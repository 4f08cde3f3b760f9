//! Migration registry and path finding
//!
//! Migrations form a directed graph keyed by `from_version`. The shortest
//! path between two versions is found with a breadth-first search; edges are
//! explored in registration order so equal-length paths resolve
//! deterministically.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;

use super::migration::Migration;
use crate::error::{PersistError, PersistResult};
use crate::types::{StateData, StateVersion};

/// Explicit registry of migrations
#[derive(Default)]
pub struct MigrationRunner {
    graph: RwLock<HashMap<StateVersion, Vec<Arc<dyn Migration>>>>,
}

impl MigrationRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, migration: Arc<dyn Migration>) {
        tracing::debug!(
            from = %migration.from_version(),
            to = %migration.to_version(),
            "Registered migration"
        );
        self.graph
            .write()
            .entry(migration.from_version().clone())
            .or_default()
            .push(migration);
    }

    /// Number of registered migrations
    pub fn len(&self) -> usize {
        self.graph.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shortest forward path from `from` to `to`
    ///
    /// Empty when the versions are equal.
    pub fn find_path(&self, from: &StateVersion, to: &StateVersion) -> PersistResult<Vec<Arc<dyn Migration>>> {
        if from == to {
            return Ok(Vec::new());
        }

        let graph = self.graph.read();
        let mut visited: HashSet<StateVersion> = HashSet::new();
        let mut parents: HashMap<StateVersion, (StateVersion, Arc<dyn Migration>)> = HashMap::new();
        let mut queue = VecDeque::new();

        visited.insert(from.clone());
        queue.push_back(from.clone());

        while let Some(current) = queue.pop_front() {
            if &current == to {
                break;
            }
            for edge in graph.get(&current).into_iter().flatten() {
                let next = edge.to_version().clone();
                if visited.insert(next.clone()) {
                    parents.insert(next.clone(), (current.clone(), edge.clone()));
                    queue.push_back(next);
                }
            }
        }

        if !parents.contains_key(to) {
            return Err(PersistError::MigrationPathNotFound {
                from: from.clone(),
                to: to.clone(),
            });
        }

        let mut path = Vec::new();
        let mut cursor = to.clone();
        while let Some((previous, edge)) = parents.remove(&cursor) {
            path.push(edge);
            cursor = previous;
        }
        path.reverse();
        Ok(path)
    }

    /// Move `data` from one schema version to another
    ///
    /// Upgrades follow the forward path. When no forward path exists and the
    /// target is older, the forward path `to -> from` is rolled back in
    /// reverse.
    pub fn migrate(&self, data: StateData, from: &StateVersion, to: &StateVersion) -> PersistResult<StateData> {
        match self.find_path(from, to) {
            Ok(path) => {
                tracing::debug!(from = %from, to = %to, steps = path.len(), "Migrating state data");
                path.iter().try_fold(data, |data, step| step.migrate(data))
            }
            Err(PersistError::MigrationPathNotFound { .. }) if to < from => {
                let path = self.find_path(to, from).map_err(|_| PersistError::MigrationPathNotFound {
                    from: from.clone(),
                    to: to.clone(),
                })?;
                tracing::debug!(from = %from, to = %to, steps = path.len(), "Rolling back state data");
                path.iter().rev().try_fold(data, |data, step| step.rollback(data))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::versioning::bundled;
    use serde_json::json;

    fn v(major: u32) -> StateVersion {
        StateVersion::new(major, 0, 0)
    }

    #[test]
    fn test_bfs_prefers_direct_edge() {
        let runner = bundled::runner().unwrap();

        let path = runner.find_path(&v(1), &v(3)).unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].from_version(), &v(1));
        assert_eq!(path[0].to_version(), &v(3));

        assert_eq!(runner.find_path(&v(2), &v(3)).unwrap().len(), 1);
        assert!(runner.find_path(&v(3), &v(3)).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_version_has_no_path() {
        let runner = bundled::runner().unwrap();
        assert!(matches!(
            runner.find_path(&v(1), &v(9)),
            Err(PersistError::MigrationPathNotFound { .. })
        ));
        assert!(matches!(
            runner.migrate(StateData::new(), &v(7), &v(1)),
            Err(PersistError::MigrationPathNotFound { .. })
        ));
    }

    #[test]
    fn test_downgrade_rolls_back() {
        let runner = bundled::runner().unwrap();
        let v1 = json!({"score": 10, "difficulty": "hard"}).as_object().cloned().unwrap();

        let v3 = runner.migrate(v1.clone(), &v(1), &v(3)).unwrap();
        assert_eq!(v3.get("points"), Some(&json!(10)));

        let back = runner.migrate(v3, &v(3), &v(1)).unwrap();
        assert_eq!(back, v1);
    }
}
