//! Job handlers and the registry that maps job types to them.
//!
//! Implement [`JobHandler`] (or wrap an async closure with [`handler_fn`]) and
//! register it under a job type before the scheduler starts. Jobs whose type
//! is not registered are rejected at submission.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::types::{JobId, QueueName};

/// Errors returned by job handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Handler failed with a message.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// Arguments could not be decoded into the handler's input type.
    #[error("invalid arguments: {0}")]
    InvalidArguments(#[from] serde_json::Error),

    /// Handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// No handler is registered for the job type.
    #[error("no handler registered for job type: {0}")]
    NotRegistered(String),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::ExecutionFailed(message.into())
    }
}

/// What a handler sees of the job it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: String,
    pub queue: QueueName,
    /// 1-based attempt number.
    pub attempt: u32,
    pub arguments: Value,
}

impl JobContext {
    /// Decode the job arguments.
    pub fn arguments<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_value(self.arguments.clone())?)
    }
}

/// Executes jobs of one type.
///
/// # Example
///
/// ```ignore
/// use stint::{JobContext, JobHandler, HandlerError};
/// use async_trait::async_trait;
///
/// struct Greet;
///
/// #[async_trait]
/// impl JobHandler for Greet {
///     async fn execute(&self, ctx: &JobContext) -> Result<(), HandlerError> {
///         let name: String = ctx.arguments()?;
///         println!("Hello, {}", name);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one attempt of the job.
    async fn execute(&self, ctx: &JobContext) -> Result<(), HandlerError>;
}

/// Handler backed by an async closure.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn execute(&self, ctx: &JobContext) -> Result<(), HandlerError> {
        (self.f)(ctx.clone()).await
    }
}

/// Cap on simultaneous executions of jobs sharing a concurrency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyLimit {
    pub max_concurrent: usize,
    /// How long a job waits for a slot before it is requeued.
    pub timeout: Duration,
}

impl ConcurrencyLimit {
    pub fn new(max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            max_concurrent,
            timeout,
        }
    }

    /// One execution at a time.
    pub fn exclusive(timeout: Duration) -> Self {
        Self::new(1, timeout)
    }
}

/// A handler together with its optional concurrency limit.
#[derive(Clone)]
pub struct RegisteredHandler {
    pub handler: Arc<dyn JobHandler>,
    pub limit: Option<ConcurrencyLimit>,
}

impl fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

/// Maps job types to handlers.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, RegisteredHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler without a concurrency limit.
    ///
    /// Registering the same type again replaces the previous handler.
    pub fn register(
        &mut self,
        job_type: impl Into<String>,
        handler: impl JobHandler + 'static,
    ) -> &mut Self {
        self.insert(job_type.into(), Arc::new(handler), None)
    }

    /// Register a handler whose executions are capped by `limit`.
    pub fn register_with_limit(
        &mut self,
        job_type: impl Into<String>,
        handler: impl JobHandler + 'static,
        limit: ConcurrencyLimit,
    ) -> &mut Self {
        self.insert(job_type.into(), Arc::new(handler), Some(limit))
    }

    /// Register an already shared handler.
    pub fn register_arc(
        &mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        limit: Option<ConcurrencyLimit>,
    ) -> &mut Self {
        self.insert(job_type.into(), handler, limit)
    }

    fn insert(
        &mut self,
        job_type: String,
        handler: Arc<dyn JobHandler>,
        limit: Option<ConcurrencyLimit>,
    ) -> &mut Self {
        self.handlers
            .insert(job_type, RegisteredHandler { handler, limit });
        self
    }

    /// Set or replace the limit of a registered type.
    ///
    /// Returns false when the type is not registered.
    pub fn set_limit(&mut self, job_type: &str, limit: ConcurrencyLimit) -> bool {
        match self.handlers.get_mut(job_type) {
            Some(registered) => {
                registered.limit = Some(limit);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, job_type: &str) -> Option<&RegisteredHandler> {
        self.handlers.get(job_type)
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn limit(&self, job_type: &str) -> Option<ConcurrencyLimit> {
        self.handlers.get(job_type).and_then(|r| r.limit)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
