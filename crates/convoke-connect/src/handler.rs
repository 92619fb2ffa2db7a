// ABOUTME: Task handler trait and the action-keyed handler registry.
// ABOUTME: Handlers are opaque async functions; panics are caught and turned into errors.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::HandlerError;

/// Context provided to task handlers.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Id of the task being processed.
    pub task_id: String,
    /// Action the task asked for.
    pub action: String,
    /// Agent the task came from, when the sender identified itself.
    pub sender: Option<String>,
    /// This connector's agent id.
    pub agent_id: String,
    /// Cancelled when the task is cancelled or its connection drops.
    pub cancel: CancellationToken,
}

/// Processes the tasks for one action.
///
/// # Example
///
/// ```ignore
/// struct Reviewer;
///
/// #[async_trait]
/// impl TaskHandler for Reviewer {
///     async fn handle(&self, ctx: TaskContext, payload: Value) -> Result<Value, HandlerError> {
///         let query = payload["query"].as_str().unwrap_or_default();
///         Ok(json!({ "papers": search(query).await? }))
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: TaskContext, payload: Value) -> Result<Value, HandlerError>;
}

/// Adapts an async closure into a [`TaskHandler`].
pub struct FnHandler<F> {
    callback: F,
}

impl<F> FnHandler<F> {
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: TaskContext, payload: Value) -> Result<Value, HandlerError> {
        (self.callback)(ctx, payload).await
    }
}

/// Handlers keyed by action name.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous handler for the action.
    pub fn insert(&mut self, action: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(action.into(), handler);
    }

    pub fn insert_fn<F, Fut>(&mut self, action: impl Into<String>, callback: F)
    where
        F: Fn(TaskContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.insert(action, Arc::new(FnHandler::new(callback)));
    }

    pub fn get(&self, action: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(action).cloned()
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// Registered action names, sorted.
    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self.handlers.keys().cloned().collect();
        actions.sort();
        actions
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("actions", &self.actions())
            .finish()
    }
}

/// Run a handler, converting a panic into [`HandlerError::Panicked`] and
/// cancellation into [`HandlerError::Cancelled`].
pub async fn invoke(
    handler: Arc<dyn TaskHandler>,
    ctx: TaskContext,
    payload: Value,
) -> Result<Value, HandlerError> {
    let cancel = ctx.cancel.clone();
    let run = AssertUnwindSafe(handler.handle(ctx, payload)).catch_unwind();

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HandlerError::Cancelled),
        outcome = run => match outcome {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
        },
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
