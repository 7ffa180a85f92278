//! In-process agents.
//!
//! Handlers are async closures registered per agent name. This is how
//! embedding applications plug their own agents in, and how the tests drive
//! the scheduler.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

use super::executor::{AgentInvoker, Invocation};
use crate::error::{OrchestratorError, Result};

type Handler = Arc<dyn Fn(Invocation, CancellationToken) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

#[derive(Default)]
pub struct LocalInvoker {
    handlers: RwLock<HashMap<String, Handler>>,
    fallback: RwLock<Option<Handler>>,
}

impl LocalInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    fn boxed<F, Fut>(f: F) -> Handler
    where
        F: Fn(Invocation, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Arc::new(
            move |call: Invocation, cancel: CancellationToken| -> BoxFuture<'static, Result<Value>> {
                Box::pin(f(call, cancel))
            },
        )
    }

    /// Install the handler for one agent.
    pub fn register<F, Fut>(&self, agent: &str, f: F)
    where
        F: Fn(Invocation, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(agent.to_string(), Self::boxed(f));
    }

    /// Install a handler for agents without their own.
    pub fn set_fallback<F, Fut>(&self, f: F)
    where
        F: Fn(Invocation, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        *self.fallback.write().unwrap_or_else(|e| e.into_inner()) = Some(Self::boxed(f));
    }

    fn handler_for(&self, agent: &str) -> Option<Handler> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(agent).cloned().or_else(|| {
            self.fallback
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        })
    }
}

#[async_trait]
impl AgentInvoker for LocalInvoker {
    fn name(&self) -> &str {
        "local"
    }

    async fn invoke(&self, call: &Invocation, cancel: CancellationToken) -> Result<Value> {
        let handler = self.handler_for(&call.agent.name).ok_or_else(|| {
            OrchestratorError::Invocation(format!(
                "no in-process handler for agent '{}'",
                call.agent.name
            ))
        })?;
        handler(call.clone(), cancel).await
    }
}
