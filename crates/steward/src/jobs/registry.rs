use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type HandlerFn = dyn Fn(HandlerContext, Value) -> HandlerFuture + Send + Sync;

/// What a handler gets to work with. The cancellation token is detached
/// from the worker's poll loop: it fires only when the handler's own
/// execution window (the shutdown timeout) is being torn down.
#[derive(Clone)]
pub struct HandlerContext {
    pub db: PgPool,
    pub cancel: CancellationToken,
}

/// `job_type -> handler` map. Registration happens at startup; dispatch is
/// the hot path, so reads go through the read half of the lock.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<HandlerFn>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&self, job_type: &str, handler: F)
    where
        F: Fn(HandlerContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let boxed: Arc<HandlerFn> =
            Arc::new(move |ctx, payload| Box::pin(handler(ctx, payload)) as HandlerFuture);

        self.handlers
            .write()
            .expect("handler registry lock poisoned")
            .insert(job_type.to_string(), boxed);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<HandlerFn>> {
        self.handlers
            .read()
            .expect("handler registry lock poisoned")
            .get(job_type)
            .cloned()
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .expect("handler registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}
