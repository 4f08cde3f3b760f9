//! Event handlers notified after a successful append

use async_trait::async_trait;

use crate::error::PersistResult;
use crate::types::{EventType, StateEvent};

/// Receives events once they are durable and visible
///
/// A failing handler is logged by the store; it never rolls back the append.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    fn handles(&self, _event_type: EventType) -> bool {
        true
    }

    async fn handle(&self, event: &StateEvent) -> PersistResult<()>;
}

/// Adapts a synchronous closure into an `EventHandler`
pub struct FnEventHandler<F> {
    name: String,
    event_types: Option<Vec<EventType>>,
    func: F,
}

impl<F> FnEventHandler<F>
where
    F: Fn(&StateEvent) -> PersistResult<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            event_types: None,
            func,
        }
    }

    /// Only receive the given event types
    pub fn only(mut self, event_types: Vec<EventType>) -> Self {
        self.event_types = Some(event_types);
        self
    }
}

#[async_trait]
impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&StateEvent) -> PersistResult<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handles(&self, event_type: EventType) -> bool {
        self.event_types
            .as_ref()
            .map(|types| types.contains(&event_type))
            .unwrap_or(true)
    }

    async fn handle(&self, event: &StateEvent) -> PersistResult<()> {
        (self.func)(event)
    }
}
