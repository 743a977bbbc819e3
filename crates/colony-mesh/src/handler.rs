//! Business event handlers and the per-agent table that routes to them

use async_trait::async_trait;
use colony_core::{Event, EventKind};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

use crate::error::{MeshError, MeshResult};
use crate::runtime::AgentContext;

/// Events a handler wants dispatched, or the reason it gave up
pub type HandlerResult = Result<Vec<Event>, HandlerError>;

/// Failure reported by a handler. Logged by the runtime; never fatal to the agent.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<colony_core::CoreError> for HandlerError {
    fn from(err: colony_core::CoreError) -> Self {
        Self(err.to_string())
    }
}

impl From<MeshError> for HandlerError {
    fn from(err: MeshError) -> Self {
        Self(err.to_string())
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: AgentContext, event: Event) -> HandlerResult;
}

/// Adapter turning an async closure into an [`EventHandler`]
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(AgentContext, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(AgentContext, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: AgentContext, event: Event) -> HandlerResult {
        (self.0)(ctx, event).await
    }
}

#[derive(Clone)]
pub struct NamedHandler {
    name: Arc<str>,
    handler: Arc<dyn EventHandler>,
}

impl NamedHandler {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &Arc<dyn EventHandler> {
        &self.handler
    }
}

impl std::fmt::Debug for NamedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("NamedHandler").field(&self.name).finish()
    }
}

/// Mapping from event kind to the ordered handlers invoked for it
#[derive(Debug, Clone, Default)]
pub struct HandlerTable {
    routes: BTreeMap<EventKind, Vec<NamedHandler>>,
}

impl HandlerTable {
    pub fn builder() -> HandlerTableBuilder {
        HandlerTableBuilder::default()
    }

    /// Handlers for a kind in registration order; empty if none
    pub fn handlers_for(&self, kind: &EventKind) -> &[NamedHandler] {
        self.routes.get(kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn kinds(&self) -> impl Iterator<Item = &EventKind> {
        self.routes.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[derive(Default)]
pub struct HandlerTableBuilder {
    entries: Vec<(EventKind, String, Arc<dyn EventHandler>)>,
}

impl HandlerTableBuilder {
    pub fn on(
        mut self,
        kind: impl Into<EventKind>,
        name: impl Into<String>,
        handler: impl EventHandler,
    ) -> Self {
        let handler: Arc<dyn EventHandler> = Arc::new(handler);
        self.entries.push((kind.into(), name.into(), handler));
        self
    }

    pub fn on_shared(
        mut self,
        kind: impl Into<EventKind>,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        self.entries.push((kind.into(), name.into(), handler));
        self
    }

    /// Validate and freeze the table
    ///
    /// # Errors
    ///
    /// [`MeshError::InvalidHandlerTable`] for an empty kind or name, a kind the
    /// runtime handles itself, or the same handler name twice under one kind.
    pub fn build(self) -> MeshResult<HandlerTable> {
        let mut routes: BTreeMap<EventKind, Vec<NamedHandler>> = BTreeMap::new();
        let mut seen: HashSet<(EventKind, String)> = HashSet::new();

        for (kind, name, handler) in self.entries {
            if kind.as_str().trim().is_empty() {
                return Err(MeshError::InvalidHandlerTable("empty event kind".into()));
            }
            if name.trim().is_empty() {
                return Err(MeshError::InvalidHandlerTable(format!(
                    "handler for '{kind}' has an empty name"
                )));
            }
            if kind.is_infrastructure() {
                return Err(MeshError::InvalidHandlerTable(format!(
                    "'{kind}' is handled by the runtime and cannot be overridden"
                )));
            }
            if !seen.insert((kind.clone(), name.clone())) {
                return Err(MeshError::InvalidHandlerTable(format!(
                    "handler '{name}' registered twice for '{kind}'"
                )));
            }
            routes.entry(kind).or_default().push(NamedHandler {
                name: name.into(),
                handler,
            });
        }

        Ok(HandlerTable { routes })
    }
}
