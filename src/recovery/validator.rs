//! Validation of recovered state

use crate::error::{PersistError, PersistResult};
use crate::types::PersistedState;

/// Checks a recovered state before it is handed back
pub trait StateValidator: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, state: &PersistedState) -> PersistResult<()>;
}

/// Checks that the required fields are present and timestamps are sane
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralValidator;

impl StateValidator for StructuralValidator {
    fn name(&self) -> &str {
        "structural"
    }

    fn validate(&self, state: &PersistedState) -> PersistResult<()> {
        let mut problems = Vec::new();
        if state.state_machine_id.is_empty() {
            problems.push("missing state_machine_id");
        }
        if state.state_type.is_empty() {
            problems.push("missing state_type");
        }
        if state.current_state.is_empty() {
            problems.push("missing current_state");
        }
        if state.updated_at < state.created_at {
            problems.push("updated_at precedes created_at");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(PersistError::ValidationFailure(problems.join(", ")))
        }
    }
}

/// Adapts a closure into a `StateValidator`
pub struct FnValidator<F> {
    name: String,
    func: F,
}

impl<F> FnValidator<F>
where
    F: Fn(&PersistedState) -> PersistResult<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> StateValidator for FnValidator<F>
where
    F: Fn(&PersistedState) -> PersistResult<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, state: &PersistedState) -> PersistResult<()> {
        (self.func)(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_validation() {
        let mut state = PersistedState::new("g1");
        let err = StructuralValidator.validate(&state).unwrap_err();
        assert!(err.to_string().contains("current_state"));

        state.current_state = "playing".to_string();
        assert!(StructuralValidator.validate(&state).is_ok());
    }
}
