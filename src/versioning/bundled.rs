//! Example schema chain for game state
//!
//! - 1.0.0 → 2.0.0: `score` is renamed to `points`
//! - 2.0.0 → 3.0.0: top-level `difficulty` moves under `settings`
//! - 1.0.0 → 3.0.0: both steps as a single edge

use std::sync::Arc;

use serde_json::{Map, Value};

use super::migration::{CompositeMigration, FnMigration, Migration};
use super::runner::MigrationRunner;
use crate::error::PersistResult;
use crate::types::{StateData, StateVersion};

pub fn v1() -> StateVersion {
    StateVersion::new(1, 0, 0)
}

pub fn v2() -> StateVersion {
    StateVersion::new(2, 0, 0)
}

pub fn v3() -> StateVersion {
    StateVersion::new(3, 0, 0)
}

fn rename(mut data: StateData, from: &str, to: &str) -> PersistResult<StateData> {
    if let Some(value) = data.remove(from) {
        data.insert(to.to_string(), value);
    }
    Ok(data)
}

pub fn score_to_points() -> Arc<dyn Migration> {
    Arc::new(
        FnMigration::new(
            v1(),
            v2(),
            |data| rename(data, "score", "points"),
            |data| rename(data, "points", "score"),
        )
        .described("rename score to points"),
    )
}

pub fn difficulty_into_settings() -> Arc<dyn Migration> {
    Arc::new(
        FnMigration::new(
            v2(),
            v3(),
            |mut data: StateData| {
                if let Some(difficulty) = data.remove("difficulty") {
                    let mut settings = Map::new();
                    settings.insert("difficulty".to_string(), difficulty);
                    data.insert("settings".to_string(), Value::Object(settings));
                }
                Ok(data)
            },
            |mut data: StateData| {
                let difficulty = match data.get_mut("settings") {
                    Some(Value::Object(settings)) => settings.remove("difficulty"),
                    _ => None,
                };
                if let Some(difficulty) = difficulty {
                    if matches!(data.get("settings"), Some(Value::Object(s)) if s.is_empty()) {
                        data.remove("settings");
                    }
                    data.insert("difficulty".to_string(), difficulty);
                }
                Ok(data)
            },
        )
        .described("move difficulty under settings"),
    )
}

/// A runner holding v1→v2, v2→v3 and the direct v1→v3 edge
pub fn runner() -> PersistResult<MigrationRunner> {
    let runner = MigrationRunner::new();
    let first = score_to_points();
    let second = difficulty_into_settings();
    let direct = CompositeMigration::new(vec![first.clone(), second.clone()])?;

    runner.register(first);
    runner.register(second);
    runner.register(Arc::new(direct));
    Ok(runner)
}
