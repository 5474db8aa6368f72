//! Action handler registry.
//!
//! Both endpoints keep a runtime-mutable map from action name to an async
//! handler. Payloads cross the wire as self-describing JSON; the typed
//! [`HandlerRegistry::register`] wrapper decodes the request into the
//! handler's parameter type and encodes its return value back to JSON.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Future returned by a registered handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

type BoxHandler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// Concurrent map from action name to handler function.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<String, BoxHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler taking and returning raw JSON values.
    pub fn register_raw<F>(&self, action: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> HandlerFuture + Send + Sync + 'static,
    {
        self.handlers.insert(action.into(), Arc::new(handler));
    }

    /// Register a handler with typed request and response values.
    ///
    /// The request payload is decoded into `Req` before the handler runs;
    /// a payload that does not match is reported as a handler failure, not
    /// a missing handler.
    pub fn register<Req, Resp, F, Fut>(&self, action: impl Into<String>, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        let action = action.into();
        let handler = Arc::new(handler);
        self.register_raw(action.clone(), move |data: Value| {
            let handler = handler.clone();
            let action = action.clone();
            Box::pin(async move {
                let request: Req = serde_json::from_value(data)
                    .with_context(|| format!("Invalid payload for action: {}", action))?;
                let response = handler(request).await?;
                serde_json::to_value(response)
                    .with_context(|| format!("Unencodable result from action: {}", action))
            })
        });
    }

    /// Remove a handler; returns whether one was registered.
    pub fn unregister(&self, action: &str) -> bool {
        self.handlers.remove(action).is_some()
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// Run the handler for `action`, or `None` when nothing is registered.
    ///
    /// The handler reference is cloned out of the map before awaiting so
    /// concurrent register/unregister calls never block on a running
    /// handler.
    pub async fn dispatch(&self, action: &str, data: Value) -> Option<anyhow::Result<Value>> {
        let handler = self.handlers.get(action).map(|h| h.value().clone())?;
        Some(handler(data).await)
    }

    pub fn actions(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("actions", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct EchoRequest {
        val: i64,
    }

    #[derive(Debug, Serialize)]
    struct EchoResponse {
        echoed: i64,
    }

    #[tokio::test]
    async fn typed_dispatch() {
        let registry = HandlerRegistry::new();
        registry.register("echo", |req: EchoRequest| async move {
            Ok(EchoResponse { echoed: req.val })
        });

        let result = registry
            .dispatch("echo", serde_json::json!({"val": 42}))
            .await
            .expect("handler registered")
            .expect("handler succeeded");
        assert_eq!(result, serde_json::json!({"echoed": 42}));
    }

    #[tokio::test]
    async fn missing_handler_is_none() {
        let registry = HandlerRegistry::new();
        assert!(registry.dispatch("nope", Value::Null).await.is_none());
    }

    #[tokio::test]
    async fn bad_payload_is_handler_failure() {
        let registry = HandlerRegistry::new();
        registry.register("echo", |req: EchoRequest| async move {
            Ok(EchoResponse { echoed: req.val })
        });

        let result = registry
            .dispatch("echo", serde_json::json!({"wrong": true}))
            .await
            .expect("handler registered");
        let err = result.expect_err("payload should not decode");
        assert!(err.to_string().contains("Invalid payload"));
    }

    #[tokio::test]
    async fn unregister_removes() {
        let registry = HandlerRegistry::new();
        registry.register_raw("once", |_| Box::pin(async { Ok(Value::Null) }));
        assert!(registry.contains("once"));
        assert!(registry.unregister("once"));
        assert!(!registry.unregister("once"));
        assert!(registry.dispatch("once", Value::Null).await.is_none());
    }
}
