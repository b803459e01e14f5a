//! Capability handlers and the per-endpoint capability table.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::protocol::Params;

/// Capability trait for handling requests by method name.
#[async_trait::async_trait]
pub trait Capability: Send + Sync {
    /// Invoke the capability with the request parameters.
    async fn invoke(&self, params: Params) -> Result<Value>;
}

/// Handler for a subscribed notification method.
#[async_trait::async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Handle one notification.
    async fn notify(&self, params: Params) -> Result<()>;
}

/// Capability backed by an async closure over raw parameters.
pub struct FnCapability<F> {
    f: F,
}

impl<F, Fut> FnCapability<F>
where
    F: Fn(Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait::async_trait]
impl<F, Fut> Capability for FnCapability<F>
where
    F: Fn(Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn invoke(&self, params: Params) -> Result<Value> {
        (self.f)(params).await
    }
}

/// Capability with statically typed arguments and result.
///
/// Parameters that do not deserialize into `P` fail with
/// [`Error::InvalidParams`] before the closure runs.
pub struct TypedCapability<P, R, F> {
    f: F,
    _marker: PhantomData<fn(P) -> R>,
}

impl<P, R, F, Fut> TypedCapability<P, R, F>
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    /// Wrap a typed closure.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<P, R, F, Fut> Capability for TypedCapability<P, R, F>
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    async fn invoke(&self, params: Params) -> Result<Value> {
        let args: P = serde_json::from_value(Value::Object(params))
            .map_err(|e| Error::InvalidParams(e.to_string()))?;
        let result = (self.f)(args).await?;
        Ok(serde_json::to_value(result)?)
    }
}

/// Notification handler backed by an async closure.
pub struct FnNotificationHandler<F> {
    f: F,
}

impl<F, Fut> FnNotificationHandler<F>
where
    F: Fn(Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait::async_trait]
impl<F, Fut> NotificationHandler for FnNotificationHandler<F>
where
    F: Fn(Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn notify(&self, params: Params) -> Result<()> {
        (self.f)(params).await
    }
}

/// Registry of capabilities keyed by method name.
#[derive(Default)]
pub struct CapabilityTable {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability. Re-registering a method replaces the previous
    /// handler.
    pub fn register(
        &mut self,
        method: impl Into<String>,
        capability: Arc<dyn Capability>,
    ) -> Result<Option<Arc<dyn Capability>>> {
        let method = method.into();
        if method.trim().is_empty() {
            return Err(Error::InvalidParams("method name must not be empty".into()));
        }
        Ok(self.capabilities.insert(method, capability))
    }

    /// Remove a capability.
    pub fn remove(&mut self, method: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.remove(method)
    }

    /// Look up a capability.
    pub fn get(&self, method: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(method).cloned()
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.capabilities.keys().cloned().collect();
        methods.sort();
        methods
    }
}
