//! Host-side handles to device-side objects.

use std::sync::Arc;

use serde::{Serialize, Serializer};
use serde_json::Value;
use upyt_wire::{Args, ObjectRef, Request};

use crate::engine::{Channel, Pending};
use crate::error::HostResult;

/// A live object on the device, created by
/// [`Connection::instantiate`](crate::Connection::instantiate).
///
/// Passing a handle as a call argument sends `{"cls": ..., "idx": ...}`,
/// which the device resolves back to the object.
#[derive(Debug, Clone)]
pub struct RemoteObject {
    class: String,
    id: u64,
    channel: Arc<Channel>,
}

impl RemoteObject {
    pub(crate) fn new(class: impl Into<String>, id: u64, channel: Arc<Channel>) -> Self {
        RemoteObject {
            class: class.into(),
            id,
            channel,
        }
    }

    /// Remote class name.
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Device-side instance id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Call a method on the object.
    pub fn call(&self, method: &str, args: Args) -> HostResult<Pending> {
        self.channel.send(&Request::method(self.id, method, args))
    }

    /// The reference sent when this handle is used as an argument.
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.class.clone(), self.id)
    }
}

impl Serialize for RemoteObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.object_ref().serialize(serializer)
    }
}

impl From<&RemoteObject> for Value {
    fn from(object: &RemoteObject) -> Self {
        object.object_ref().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use serde_json::json;

    #[test]
    fn test_serialises_as_reference() {
        let channel = Arc::new(Channel::new("test", LinkConfig::default()));
        let object = RemoteObject::new("VirtualPin", 3, channel);
        assert_eq!(
            serde_json::to_value(&object).unwrap(),
            json!({"cls": "VirtualPin", "idx": 3})
        );
        assert_eq!(Value::from(&object), json!({"cls": "VirtualPin", "idx": 3}));
        let args = Args::new().arg(&object);
        assert_eq!(args.positional[0]["idx"], 3);
    }
}
