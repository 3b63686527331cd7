//! Name-to-handler tables for instructions and remote classes.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use upyt_wire::Args;

use crate::builtins;
use crate::error::{DeviceResult, RegistrationError};
use crate::instances::{Constructor, InstanceTable, RemoteObject};
use crate::listener::KeepAlive;
use crate::reply::Reply;

/// Handler stored for an instruction.
pub type InstructionFn = Box<dyn Fn(&mut Context<'_>, Args) -> DeviceResult<Reply>>;

/// What an instruction handler can reach while it runs.
pub struct Context<'a> {
    pub(crate) registry: &'a Registry,
    pub(crate) instances: &'a mut InstanceTable,
    pub(crate) keepalive: &'a KeepAlive,
    pub(crate) started: Instant,
}

impl<'a> Context<'a> {
    /// The registry the listener dispatches through.
    pub fn registry(&self) -> &Registry {
        self.registry
    }

    /// The live instance table.
    pub fn instances(&mut self) -> &mut InstanceTable {
        self.instances
    }

    /// The listener's keep-alive flag.
    pub fn keepalive(&self) -> &KeepAlive {
        self.keepalive
    }

    /// Time since the listener was created.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Immutable dispatch tables, built once at startup.
pub struct Registry {
    instructions: BTreeMap<String, InstructionFn>,
    classes: BTreeMap<String, Constructor>,
}

impl Registry {
    /// Start a registry with the always-present instructions
    /// (`list_instructions`, `list_remote_classes`, `clean_remote_classes`,
    /// `break_loop`).
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Look up an instruction.
    pub fn resolve_instruction(&self, name: &str) -> Option<&InstructionFn> {
        self.instructions.get(name)
    }

    /// Look up a remote class constructor.
    pub fn resolve_class(&self, name: &str) -> Option<&Constructor> {
        self.classes.get(name)
    }

    /// Registered instruction names, sorted.
    pub fn instruction_names(&self) -> Vec<String> {
        self.instructions.keys().cloned().collect()
    }

    /// Registered remote class names, sorted.
    pub fn class_names(&self) -> Vec<String> {
        self.classes.keys().cloned().collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("instructions", &self.instruction_names())
            .field("classes", &self.class_names())
            .finish()
    }
}

/// Collects registrations. Duplicate or malformed names are rejected
/// immediately.
pub struct RegistryBuilder {
    instructions: BTreeMap<String, InstructionFn>,
    classes: BTreeMap<String, Constructor>,
}

impl RegistryBuilder {
    fn new() -> Self {
        let mut builder = RegistryBuilder {
            instructions: BTreeMap::new(),
            classes: BTreeMap::new(),
        };
        builtins::register_core(&mut builder);
        builder
    }

    /// Register an instruction under `name`.
    pub fn register_instruction<F>(
        &mut self,
        name: impl Into<String>,
        handler: F,
    ) -> Result<&mut Self, RegistrationError>
    where
        F: Fn(&mut Context<'_>, Args) -> DeviceResult<Reply> + 'static,
    {
        let name = checked_name(name.into())?;
        if self.instructions.contains_key(&name) {
            return Err(RegistrationError::DuplicateName {
                kind: "instruction",
                name,
            });
        }
        log::trace!("registered instruction {}", name);
        self.instructions.insert(name, Box::new(handler));
        Ok(self)
    }

    /// Register a remote class under `name`.
    ///
    /// The constructor receives the call arguments and the live instance
    /// table (for object-reference arguments).
    pub fn register_remote_class<T, F>(
        &mut self,
        name: impl Into<String>,
        constructor: F,
    ) -> Result<&mut Self, RegistrationError>
    where
        T: RemoteObject + 'static,
        F: Fn(Args, &InstanceTable) -> DeviceResult<T> + 'static,
    {
        let name = checked_name(name.into())?;
        if self.classes.contains_key(&name) {
            return Err(RegistrationError::DuplicateName {
                kind: "remote class",
                name,
            });
        }
        log::trace!("registered remote class {}", name);
        self.classes.insert(
            name,
            Box::new(move |args: Args, peers: &InstanceTable| -> DeviceResult<Box<dyn RemoteObject>> {
                let object: Box<dyn RemoteObject> = Box::new(constructor(args, peers)?);
                Ok(object)
            }),
        );
        Ok(self)
    }

    pub(crate) fn insert_builtin(&mut self, name: &'static str, handler: InstructionFn) {
        self.instructions.insert(name.to_string(), handler);
    }

    /// Freeze the tables.
    pub fn build(self) -> Registry {
        Registry {
            instructions: self.instructions,
            classes: self.classes,
        }
    }
}

fn checked_name(name: String) -> Result<String, RegistrationError> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(RegistrationError::InvalidName(name));
    }
    Ok(name)
}
