//! Notification handlers and their registration per channel.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use chanq_core::BindingRegistry;
use chanq_proto::ChangeRecord;

use crate::error::{Error, HandlerError};

/// Callback invoked once per delivered change record.
///
/// Returning an error leaves the record queued for another attempt. On
/// unlocked channels the same record may be delivered more than once, so
/// handlers there must be idempotent.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Process one change record.
    async fn handle(&self, record: &ChangeRecord) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`NotificationHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> NotificationHandler for FnHandler<F>
where
    F: Fn(ChangeRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, record: &ChangeRecord) -> Result<(), HandlerError> {
        (self.f)(record.clone()).await
    }
}

/// Wrap an async closure as a handler.
///
/// ```ignore
/// consumers.on_notification("CveRecord", handler_fn(|record| async move {
///     println!("{} {}", record.operation, record.primary_key);
///     Ok(())
/// }))?;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ChangeRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

/// Handlers keyed by the channel they consume.
pub struct ConsumerRegistry {
    bindings: Arc<BindingRegistry>,
    handlers: HashMap<String, Arc<dyn NotificationHandler>>,
}

impl ConsumerRegistry {
    /// Create an empty registry over a set of bindings.
    pub fn new(bindings: Arc<BindingRegistry>) -> Self {
        Self {
            bindings,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for an entity type's channel.
    ///
    /// Fails with `UnknownEntity` if the entity type has no binding. A
    /// second registration for the same channel replaces the first.
    pub fn on_notification<H>(&mut self, entity_type: &str, handler: H) -> Result<&mut Self, Error>
    where
        H: NotificationHandler + 'static,
    {
        let channel = self.bindings.resolve(entity_type)?.name.clone();
        if self.handlers.insert(channel.clone(), Arc::new(handler)).is_some() {
            tracing::warn!(channel = %channel, entity_type, "replaced existing notification handler");
        } else {
            tracing::debug!(channel = %channel, entity_type, "notification handler registered");
        }
        Ok(self)
    }

    /// Handler consuming a channel, if any.
    pub fn handler_for(&self, channel: &str) -> Option<Arc<dyn NotificationHandler>> {
        self.handlers.get(channel).cloned()
    }

    /// Bindings the handlers are registered against.
    pub fn bindings(&self) -> &Arc<BindingRegistry> {
        &self.bindings
    }

    /// Number of channels with a handler.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
