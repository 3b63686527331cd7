//! The table of calls a device offers, filled in by capability discovery.

use std::collections::BTreeMap;

use upyt_wire::{Args, Request};

use crate::error::{HostError, HostResult};

/// Which namespace a name lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// A device instruction.
    Instruction,
    /// A remote class.
    RemoteClass,
}

/// Builds the request for one named call.
#[derive(Debug, Clone, Copy)]
pub struct CallEntry {
    /// Namespace of the entry.
    pub kind: CallKind,
    build: fn(&str, Args) -> Request,
}

impl CallEntry {
    fn instruction() -> Self {
        CallEntry {
            kind: CallKind::Instruction,
            build: |name, args| Request::instruction(name, args),
        }
    }

    fn remote_class() -> Self {
        CallEntry {
            kind: CallKind::RemoteClass,
            build: |class, args| Request::construct(class, args),
        }
    }

    /// Build the request for a call of `name`.
    pub fn request(&self, name: &str, args: Args) -> Request {
        (self.build)(name, args)
    }
}

/// Instructions and remote classes of one device. Instruction and class
/// names are separate namespaces, as on the device.
#[derive(Debug, Clone, Default)]
pub struct CallTable {
    instructions: BTreeMap<String, CallEntry>,
    classes: BTreeMap<String, CallEntry>,
}

impl CallTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A table from discovered names.
    pub fn from_discovery<I, C>(instructions: I, classes: C) -> Self
    where
        I: IntoIterator<Item = String>,
        C: IntoIterator<Item = String>,
    {
        CallTable {
            instructions: instructions
                .into_iter()
                .map(|name| (name, CallEntry::instruction()))
                .collect(),
            classes: classes
                .into_iter()
                .map(|name| (name, CallEntry::remote_class()))
                .collect(),
        }
    }

    /// Request for an instruction call.
    pub fn instruction_request(&self, name: &str, args: Args) -> HostResult<Request> {
        self.instructions
            .get(name)
            .map(|entry| entry.request(name, args))
            .ok_or_else(|| HostError::UnknownInstruction(name.to_string()))
    }

    /// Request for a remote construction.
    pub fn construct_request(&self, class: &str, args: Args) -> HostResult<Request> {
        self.classes
            .get(class)
            .map(|entry| entry.request(class, args))
            .ok_or_else(|| HostError::UnknownClass(class.to_string()))
    }

    /// True when the device offers this instruction.
    pub fn has_instruction(&self, name: &str) -> bool {
        self.instructions.contains_key(name)
    }

    /// Instruction names, sorted.
    pub fn instructions(&self) -> Vec<String> {
        self.instructions.keys().cloned().collect()
    }

    /// Remote class names, sorted.
    pub fn remote_classes(&self) -> Vec<String> {
        self.classes.keys().cloned().collect()
    }

    /// True when nothing has been discovered.
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty() && self.classes.is_empty()
    }
}
