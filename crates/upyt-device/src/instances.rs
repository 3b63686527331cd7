//! Live remote-class instances, addressed by integer id.

use std::cell::RefCell;
use std::collections::BTreeMap;

use upyt_wire::{Args, ObjectRef};

use crate::error::{DeviceError, DeviceResult};
use crate::reply::Reply;

/// A device-side object created on request of the host.
///
/// The host drives it only through [`RemoteObject::invoke`]; it never sees the
/// object itself, just its id.
pub trait RemoteObject {
    /// Invoke a method by name.
    ///
    /// `peers` gives access to the other live instances, for methods that
    /// take object references as arguments. Implementations return
    /// [`DeviceError::NotCallable`] for names they do not handle.
    fn invoke(&mut self, method: &str, args: Args, peers: &InstanceTable) -> DeviceResult<Reply>;

    /// Release hardware or other resources. Called when the table is cleared.
    fn teardown(&mut self) {}
}

/// Constructor stored for a remote class.
pub type Constructor = Box<dyn Fn(Args, &InstanceTable) -> DeviceResult<Box<dyn RemoteObject>>>;

struct Slot {
    class: String,
    object: RefCell<Box<dyn RemoteObject>>,
}

/// The table of live instances.
///
/// Ids come from a counter that starts at 0 and is never reset, so an id is
/// never reused for the lifetime of the device even after
/// [`InstanceTable::destroy_all`].
#[derive(Default)]
pub struct InstanceTable {
    slots: BTreeMap<u64, Slot>,
    next_id: u64,
}

impl InstanceTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct an instance with `constructor` and store it under a fresh id.
    ///
    /// The id is only consumed when construction succeeds.
    pub fn create(&mut self, class: &str, constructor: &Constructor, args: Args) -> DeviceResult<u64> {
        let object = constructor(args, self)?;
        let id = self.next_id;
        self.next_id += 1;
        self.slots.insert(
            id,
            Slot {
                class: class.to_string(),
                object: RefCell::new(object),
            },
        );
        log::debug!("created {} instance {}", class, id);
        Ok(id)
    }

    /// Call a method on the instance with id `id`.
    pub fn invoke(&self, id: u64, method: &str, args: Args) -> DeviceResult<Reply> {
        let slot = self.slots.get(&id).ok_or(DeviceError::UnknownInstance(id))?;
        let mut object = slot
            .object
            .try_borrow_mut()
            .map_err(|_| DeviceError::InstanceBusy(id))?;
        object.invoke(method, args, self)
    }

    /// Look up the instance an object reference points at, checking its class.
    pub fn resolve(&self, reference: &ObjectRef) -> DeviceResult<&RefCell<Box<dyn RemoteObject>>> {
        let slot = self
            .slots
            .get(&reference.idx)
            .ok_or(DeviceError::UnknownInstance(reference.idx))?;
        if slot.class != reference.cls {
            return Err(DeviceError::ReferenceMismatch {
                idx: reference.idx,
                expected: reference.cls.clone(),
                actual: slot.class.clone(),
            });
        }
        Ok(&slot.object)
    }

    /// Call a method on the instance an object reference points at.
    pub fn invoke_ref(&self, reference: &ObjectRef, method: &str, args: Args) -> DeviceResult<Reply> {
        let mut object = self
            .resolve(reference)?
            .try_borrow_mut()
            .map_err(|_| DeviceError::InstanceBusy(reference.idx))?;
        object.invoke(method, args, self)
    }

    /// Tear down and forget every instance. The id counter is kept.
    pub fn destroy_all(&mut self) {
        let count = self.slots.len();
        for (_, mut slot) in std::mem::take(&mut self.slots) {
            slot.object.get_mut().teardown();
        }
        log::debug!("destroyed {} remote instances", count);
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when no instance is live.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Id the next successful construction will receive.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }
}

impl std::fmt::Debug for InstanceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceTable")
            .field("live", &self.slots.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}
