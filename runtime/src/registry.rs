//! Immutable mapping from event kind to its ordered handlers.
//!
//! The registry is assembled once at startup and never mutated afterwards.
//! Handlers for a kind run in registration order.

use crate::handler::EventHandler;
use eventline_core::handler::HandlerId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while building a registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Two handlers for the same kind share an id.
    #[error("Duplicate handler id '{handler_id}' for event kind '{event_kind}'")]
    DuplicateHandler {
        /// The event kind.
        event_kind: String,
        /// The repeated id.
        handler_id: String,
    },
}

/// A handler together with its id.
pub struct RegisteredHandler<E> {
    id: HandlerId,
    handler: Arc<dyn EventHandler<E>>,
}

impl<E> RegisteredHandler<E> {
    /// The handler id.
    #[must_use]
    pub const fn id(&self) -> &HandlerId {
        &self.id
    }

    /// The handler.
    #[must_use]
    pub fn handler(&self) -> &Arc<dyn EventHandler<E>> {
        &self.handler
    }
}

impl<E> Clone for RegisteredHandler<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

/// Event kind → ordered list of handlers.
pub struct HandlerRegistry<E> {
    handlers: HashMap<String, Vec<RegisteredHandler<E>>>,
}

impl<E> HandlerRegistry<E> {
    /// Start building a registry.
    #[must_use]
    pub fn builder() -> HandlerRegistryBuilder<E> {
        HandlerRegistryBuilder {
            entries: Vec::new(),
        }
    }

    /// A registry without handlers. Every event settles immediately.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Handlers registered for `event_kind`, in registration order.
    #[must_use]
    pub fn handlers_for(&self, event_kind: &str) -> &[RegisteredHandler<E>] {
        self.handlers
            .get(event_kind)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Ids of the handlers registered for `event_kind`.
    #[must_use]
    pub fn handler_ids(&self, event_kind: &str) -> Vec<HandlerId> {
        self.handlers_for(event_kind)
            .iter()
            .map(|registered| registered.id.clone())
            .collect()
    }

    /// Every kind with at least one handler.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Total number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Builder for [`HandlerRegistry`].
pub struct HandlerRegistryBuilder<E> {
    entries: Vec<(String, Arc<dyn EventHandler<E>>)>,
}

impl<E> HandlerRegistryBuilder<E> {
    /// Register a handler for an event kind.
    #[must_use]
    pub fn register(
        mut self,
        event_kind: impl Into<String>,
        handler: impl EventHandler<E> + 'static,
    ) -> Self {
        let handler: Arc<dyn EventHandler<E>> = Arc::new(handler);
        self.entries.push((event_kind.into(), handler));
        self
    }

    /// Register a shared handler for an event kind.
    #[must_use]
    pub fn register_arc(
        mut self,
        event_kind: impl Into<String>,
        handler: Arc<dyn EventHandler<E>>,
    ) -> Self {
        self.entries.push((event_kind.into(), handler));
        self
    }

    /// Build the registry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateHandler`] if two handlers of the same
    /// kind share an id.
    pub fn build(self) -> Result<HandlerRegistry<E>, RegistryError> {
        let mut handlers: HashMap<String, Vec<RegisteredHandler<E>>> = HashMap::new();
        let mut seen: HashSet<(String, HandlerId)> = HashSet::new();

        for (event_kind, handler) in self.entries {
            let id = HandlerId::new(handler.id());
            if !seen.insert((event_kind.clone(), id.clone())) {
                return Err(RegistryError::DuplicateHandler {
                    event_kind,
                    handler_id: id.to_string(),
                });
            }
            handlers
                .entry(event_kind)
                .or_default()
                .push(RegisteredHandler { id, handler });
        }

        Ok(HandlerRegistry { handlers })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::handler::HandlerContext;
    use eventline_core::handler::{HandlerError, HandlerOutcome};
    use std::future::Future;
    use std::pin::Pin;

    struct Named(&'static str);

    impl EventHandler<()> for Named {
        fn id(&self) -> &str {
            self.0
        }

        fn handle<'a>(
            &'a self,
            _ctx: &'a HandlerContext,
            _event: &'a (),
        ) -> Pin<Box<dyn Future<Output = Result<HandlerOutcome, HandlerError>> + Send + 'a>>
        {
            Box::pin(async { Ok(HandlerOutcome::Success) })
        }
    }

    #[test]
    fn preserves_registration_order_per_kind() {
        let registry = HandlerRegistry::builder()
            .register("A.v1", Named("first"))
            .register("B.v1", Named("other"))
            .register("A.v1", Named("second"))
            .build()
            .unwrap();

        let ids: Vec<_> = registry
            .handler_ids("A.v1")
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        assert_eq!(ids, vec!["first", "second"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn unknown_kind_has_no_handlers() {
        let registry = HandlerRegistry::<()>::empty();
        assert!(registry.handlers_for("Missing.v1").is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn rejects_duplicate_id_within_kind() {
        let result = HandlerRegistry::builder()
            .register("A.v1", Named("same"))
            .register("A.v1", Named("same"))
            .build();

        assert_eq!(
            result.err(),
            Some(RegistryError::DuplicateHandler {
                event_kind: "A.v1".to_string(),
                handler_id: "same".to_string(),
            })
        );
    }

    #[test]
    fn same_id_allowed_across_kinds() {
        let registry = HandlerRegistry::builder()
            .register("A.v1", Named("audit"))
            .register("B.v1", Named("audit"))
            .build()
            .unwrap();

        assert_eq!(registry.handler_ids("B.v1"), vec![HandlerId::new("audit")]);
    }
}
