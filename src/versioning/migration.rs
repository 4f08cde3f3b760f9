//! Schema migrations and migration chains

use std::sync::Arc;

use crate::error::{PersistError, PersistResult};
use crate::types::{StateData, StateVersion};

/// A declared transformation of state data between two schema versions
pub trait Migration: Send + Sync {
    fn from_version(&self) -> &StateVersion;

    fn to_version(&self) -> &StateVersion;

    fn description(&self) -> &str {
        ""
    }

    /// Transform data shaped for `from_version` into `to_version`
    fn migrate(&self, data: StateData) -> PersistResult<StateData>;

    /// Inverse of `migrate`
    fn rollback(&self, data: StateData) -> PersistResult<StateData>;
}

impl std::fmt::Debug for dyn Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("from_version", self.from_version())
            .field("to_version", self.to_version())
            .field("description", &self.description())
            .finish()
    }
}

/// A migration built from a pair of closures
pub struct FnMigration<M, R> {
    from: StateVersion,
    to: StateVersion,
    description: String,
    forward: M,
    backward: R,
}

impl<M, R> FnMigration<M, R>
where
    M: Fn(StateData) -> PersistResult<StateData> + Send + Sync,
    R: Fn(StateData) -> PersistResult<StateData> + Send + Sync,
{
    pub fn new(from: StateVersion, to: StateVersion, forward: M, backward: R) -> Self {
        Self {
            from,
            to,
            description: String::new(),
            forward,
            backward,
        }
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl<M, R> Migration for FnMigration<M, R>
where
    M: Fn(StateData) -> PersistResult<StateData> + Send + Sync,
    R: Fn(StateData) -> PersistResult<StateData> + Send + Sync,
{
    fn from_version(&self) -> &StateVersion {
        &self.from
    }

    fn to_version(&self) -> &StateVersion {
        &self.to
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn migrate(&self, data: StateData) -> PersistResult<StateData> {
        (self.forward)(data)
    }

    fn rollback(&self, data: StateData) -> PersistResult<StateData> {
        (self.backward)(data)
    }
}

/// A contiguous chain of migrations applied as one step
///
/// `steps[i].to_version() == steps[i + 1].from_version()` is checked when
/// the chain is built.
pub struct CompositeMigration {
    from: StateVersion,
    to: StateVersion,
    description: String,
    steps: Vec<Arc<dyn Migration>>,
}

impl CompositeMigration {
    pub fn new(steps: Vec<Arc<dyn Migration>>) -> PersistResult<Self> {
        let (first, last) = match (steps.first(), steps.last()) {
            (Some(first), Some(last)) => (first.from_version().clone(), last.to_version().clone()),
            _ => {
                return Err(PersistError::InvalidMigrationChain(
                    "a composite migration needs at least one step".to_string(),
                ))
            }
        };

        for pair in steps.windows(2) {
            if pair[0].to_version() != pair[1].from_version() {
                return Err(PersistError::InvalidMigrationChain(format!(
                    "step ending at {} is followed by a step starting at {}",
                    pair[0].to_version(),
                    pair[1].from_version()
                )));
            }
        }

        let description = steps
            .iter()
            .map(|s| format!("{}->{}", s.from_version(), s.to_version()))
            .collect::<Vec<_>>()
            .join(", ");

        Ok(Self {
            from: first,
            to: last,
            description,
            steps,
        })
    }

    pub fn steps(&self) -> &[Arc<dyn Migration>] {
        &self.steps
    }
}

impl Migration for CompositeMigration {
    fn from_version(&self) -> &StateVersion {
        &self.from
    }

    fn to_version(&self) -> &StateVersion {
        &self.to
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn migrate(&self, data: StateData) -> PersistResult<StateData> {
        self.steps.iter().try_fold(data, |data, step| step.migrate(data))
    }

    fn rollback(&self, data: StateData) -> PersistResult<StateData> {
        self.steps.iter().rev().try_fold(data, |data, step| step.rollback(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn add(from: u32, to: u32, key: &'static str) -> Arc<dyn Migration> {
        Arc::new(FnMigration::new(
            StateVersion::new(from, 0, 0),
            StateVersion::new(to, 0, 0),
            move |mut data: StateData| {
                data.insert(key.to_string(), Value::Bool(true));
                Ok(data)
            },
            move |mut data: StateData| {
                data.remove(key);
                Ok(data)
            },
        ))
    }

    #[test]
    fn test_composite_requires_contiguous_steps() {
        assert!(matches!(
            CompositeMigration::new(vec![]),
            Err(PersistError::InvalidMigrationChain(_))
        ));
        assert!(matches!(
            CompositeMigration::new(vec![add(1, 2, "a"), add(3, 4, "b")]),
            Err(PersistError::InvalidMigrationChain(_))
        ));
    }

    #[test]
    fn test_composite_applies_in_order_and_rolls_back() {
        let chain = CompositeMigration::new(vec![add(1, 2, "a"), add(2, 3, "b")]).unwrap();
        assert_eq!(chain.from_version(), &StateVersion::new(1, 0, 0));
        assert_eq!(chain.to_version(), &StateVersion::new(3, 0, 0));

        let original = json!({"round": 1}).as_object().cloned().unwrap();
        let migrated = chain.migrate(original.clone()).unwrap();
        assert_eq!(Value::Object(migrated.clone()), json!({"round": 1, "a": true, "b": true}));
        assert_eq!(chain.rollback(migrated).unwrap(), original);
    }
}
