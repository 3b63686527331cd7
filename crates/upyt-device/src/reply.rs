//! Handler results.

use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use serde_json::Value;

use crate::error::{DeviceError, DeviceResult};

/// A boxed future that stays on the listener's thread.
pub type LocalBoxFuture<T> = Pin<Box<dyn Future<Output = T>>>;

/// What a handler hands back to the listener.
///
/// A `Deferred` reply is awaited by the listener before the acknowledgement
/// goes out, so a handler can suspend without blocking other local tasks.
pub enum Reply {
    /// Completed. `None` (or a `null` value) means no response line.
    Ready(Option<Value>),
    /// Still running.
    Deferred(LocalBoxFuture<DeviceResult<Option<Value>>>),
}

impl Reply {
    /// A reply with no response line.
    pub fn none() -> Self {
        Reply::Ready(None)
    }

    /// A reply carrying a value.
    pub fn value(value: impl Into<Value>) -> Self {
        Reply::Ready(Some(value.into()))
    }

    /// A reply carrying any serializable value.
    pub fn serialize<T: Serialize>(value: &T) -> DeviceResult<Self> {
        let value = serde_json::to_value(value)
            .map_err(|e| DeviceError::failed(format!("cannot encode reply: {}", e)))?;
        Ok(Reply::value(value))
    }

    /// A reply that completes later.
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = DeviceResult<Option<Value>>> + 'static,
    {
        Reply::Deferred(Box::pin(future))
    }

    /// Wait for completion. `null` is folded into `None`.
    pub async fn resolve(self) -> DeviceResult<Option<Value>> {
        let value = match self {
            Reply::Ready(value) => value,
            Reply::Deferred(future) => future.await?,
        };
        Ok(value.filter(|v| !v.is_null()))
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Reply::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}
