//! Handler registry: `job_type` → handler.
//!
//! Lookup is read-mostly; registration happens at process start. The lock
//! is never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use lxp_errors::CoreResult;

use crate::context::ExecutionContext;

/// One unit of background work. Handlers own their success/failure via
/// the context; the pool only enforces a safety net.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: ExecutionContext) -> CoreResult<()>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    inner: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Duplicate registration overwrites the previous handler.
    pub fn register(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let job_type = job_type.into();
        let mut map = self.inner.write().expect("registry lock poisoned");
        if map.insert(job_type.clone(), handler).is_some() {
            tracing::warn!(job_type, "handler registration overwrote an existing handler");
        }
    }

    pub fn resolve(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .get(job_type)
            .cloned()
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .inner
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder;

    #[async_trait]
    impl JobHandler for Recorder {
        async fn run(&self, _ctx: ExecutionContext) -> CoreResult<()> {
            Ok(())
        }
    }

    #[test]
    fn resolve_unknown_type_is_none() {
        let reg = HandlerRegistry::new();
        assert!(reg.resolve("reindex_content").is_none());
    }

    #[test]
    fn duplicate_registration_overwrites() {
        let reg = HandlerRegistry::new();
        let first: Arc<dyn JobHandler> = Arc::new(Recorder);
        let second: Arc<dyn JobHandler> = Arc::new(Recorder);

        reg.register("chat_respond", Arc::clone(&first));
        reg.register("chat_respond", Arc::clone(&second));

        assert_eq!(reg.registered_types(), vec!["chat_respond".to_string()]);
        let resolved = reg.resolve("chat_respond").expect("handler registered");
        assert!(
            Arc::ptr_eq(&resolved, &second),
            "latest registration must win"
        );
    }
}
