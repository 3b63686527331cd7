//! Request shapes sent from the host to a device.
//!
//! Three shapes exist, distinguished by which keys the JSON object carries:
//!
//! | Shape | Keys |
//! |-------|------|
//! | Remote method call | `rid`, `i`, `a`?, `k`? |
//! | Remote construction | `rc`, `a`?, `k`? |
//! | Instruction call | `i`, `a`?, `k`? |
//!
//! Devices check the keys in exactly that order, so a line carrying both
//! `rid` and `i` is a method call, never an instruction call.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{WireError, WireResult};

/// Positional (`a`) and keyword (`k`) arguments of a call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    /// Positional arguments, in call order.
    pub positional: Vec<Value>,
    /// Keyword arguments.
    pub keyword: Map<String, Value>,
}

impl Args {
    /// Create an empty argument list.
    pub fn new() -> Self {
        Args::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a keyword argument.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }

    /// Append a positional argument of any serializable type.
    pub fn try_arg<T: Serialize>(self, value: &T) -> WireResult<Self> {
        Ok(self.arg(serde_json::to_value(value)?))
    }

    /// True when there are neither positional nor keyword arguments.
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    /// Look up a parameter by keyword `name`, falling back to position `index`.
    ///
    /// Returns `Ok(None)` when the parameter is absent or `null`.
    pub fn get<T: DeserializeOwned>(&self, index: usize, name: &str) -> WireResult<Option<T>> {
        let value = self
            .keyword
            .get(name)
            .or_else(|| self.positional.get(index));
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(value) => T::deserialize(value)
                .map(Some)
                .map_err(|e| WireError::InvalidArgument {
                    name: name.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    /// Like [`Args::get`], but a missing parameter is an error.
    pub fn require<T: DeserializeOwned>(&self, index: usize, name: &str) -> WireResult<T> {
        self.get(index, name)?
            .ok_or_else(|| WireError::MissingArgument(name.to_string()))
    }

    /// Like [`Args::get`], with a default for a missing parameter.
    pub fn get_or<T: DeserializeOwned>(&self, index: usize, name: &str, default: T) -> WireResult<T> {
        Ok(self.get(index, name)?.unwrap_or(default))
    }

    fn from_parts(a: Option<Value>, k: Option<Value>) -> WireResult<Self> {
        let positional = match a {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(WireError::MalformedRequest(format!(
                    "'a' must be an array, got {}",
                    other
                )))
            }
        };
        let keyword = match k {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(WireError::MalformedRequest(format!(
                    "'k' must be an object, got {}",
                    other
                )))
            }
        };
        Ok(Args {
            positional,
            keyword,
        })
    }
}

/// A request line, before encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Call a registered instruction by name.
    Instruction {
        /// Instruction name.
        name: String,
        /// Call arguments.
        args: Args,
    },
    /// Create a new instance of a remote class.
    Construct {
        /// Remote class name.
        class: String,
        /// Constructor arguments.
        args: Args,
    },
    /// Call a method on a live remote instance.
    Method {
        /// Instance id returned by the construction.
        id: u64,
        /// Method name.
        name: String,
        /// Call arguments.
        args: Args,
    },
}

impl Request {
    /// Build an instruction call.
    pub fn instruction(name: impl Into<String>, args: Args) -> Self {
        Request::Instruction {
            name: name.into(),
            args,
        }
    }

    /// Build a remote construction.
    pub fn construct(class: impl Into<String>, args: Args) -> Self {
        Request::Construct {
            class: class.into(),
            args,
        }
    }

    /// Build a remote method call.
    pub fn method(id: u64, name: impl Into<String>, args: Args) -> Self {
        Request::Method {
            id,
            name: name.into(),
            args,
        }
    }

    /// The call arguments.
    pub fn args(&self) -> &Args {
        match self {
            Request::Instruction { args, .. }
            | Request::Construct { args, .. }
            | Request::Method { args, .. } => args,
        }
    }

    /// Classify a decoded JSON value as a request.
    ///
    /// Returns `Ok(None)` for shapes that are not requests at all (including
    /// non-objects), which devices ignore.
    pub fn from_value(value: Value) -> WireResult<Option<Request>> {
        let Value::Object(mut obj) = value else {
            return Ok(None);
        };

        if let Some(rid) = obj.get("rid") {
            let id = rid.as_u64().ok_or_else(|| {
                WireError::MalformedRequest(format!("'rid' must be an unsigned integer, got {}", rid))
            })?;
            let name = string_field(&obj, "i")?;
            let args = Args::from_parts(obj.remove("a"), obj.remove("k"))?;
            return Ok(Some(Request::Method { id, name, args }));
        }
        if obj.contains_key("rc") {
            let class = string_field(&obj, "rc")?;
            let args = Args::from_parts(obj.remove("a"), obj.remove("k"))?;
            return Ok(Some(Request::Construct { class, args }));
        }
        if obj.contains_key("i") {
            let name = string_field(&obj, "i")?;
            let args = Args::from_parts(obj.remove("a"), obj.remove("k"))?;
            return Ok(Some(Request::Instruction { name, args }));
        }
        Ok(None)
    }
}

fn string_field(obj: &Map<String, Value>, key: &str) -> WireResult<String> {
    match obj.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(WireError::MalformedRequest(format!(
            "'{}' must be a string, got {}",
            key, other
        ))),
        None => Err(WireError::MalformedRequest(format!("missing '{}'", key))),
    }
}

// Field order here is the key order on the wire.
#[derive(Serialize)]
struct RawRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    rid: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rc: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    i: Option<&'a str>,
    #[serde(skip_serializing_if = "is_empty_slice")]
    a: &'a [Value],
    #[serde(skip_serializing_if = "is_empty_map")]
    k: &'a Map<String, Value>,
}

fn is_empty_slice(a: &&[Value]) -> bool {
    a.is_empty()
}

fn is_empty_map(k: &&Map<String, Value>) -> bool {
    k.is_empty()
}

impl Serialize for Request {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let raw = match self {
            Request::Instruction { name, args } => RawRequest {
                rid: None,
                rc: None,
                i: Some(name.as_str()),
                a: &args.positional,
                k: &args.keyword,
            },
            Request::Construct { class, args } => RawRequest {
                rid: None,
                rc: Some(class.as_str()),
                i: None,
                a: &args.positional,
                k: &args.keyword,
            },
            Request::Method { id, name, args } => RawRequest {
                rid: Some(*id),
                rc: None,
                i: Some(name.as_str()),
                a: &args.positional,
                k: &args.keyword,
            },
        };
        raw.serialize(serializer)
    }
}

/// Serialised handle to a live device-side object: `{"cls": ..., "idx": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Remote class name.
    pub cls: String,
    /// Instance id.
    pub idx: u64,
}

impl ObjectRef {
    /// Create a reference.
    pub fn new(cls: impl Into<String>, idx: u64) -> Self {
        ObjectRef {
            cls: cls.into(),
            idx,
        }
    }

    /// Interpret a value as an object reference, if it has that shape.
    pub fn from_value(value: &Value) -> Option<ObjectRef> {
        let obj = value.as_object()?;
        let cls = obj.get("cls")?.as_str()?;
        let idx = obj.get("idx")?.as_u64()?;
        Some(ObjectRef::new(cls, idx))
    }
}

impl From<ObjectRef> for Value {
    fn from(r: ObjectRef) -> Self {
        serde_json::json!({ "cls": r.cls, "idx": r.idx })
    }
}
