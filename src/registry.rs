//! Opaque handle registry for objects crossing the C ABI.
//!
//! A token is only ever resolved through the registry, which checks the
//! slot signature and the recorded type before handing out the object.
//! Tokens are never reused, so a stale copy of a destroyed token stays
//! invalid forever.

use crate::{Kinect2Error, Result};
use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

const HANDLE_SIGNATURE: u32 = 0xFF00_F0A5;

/// Live handles across every registry in the process.
static OUTSTANDING: AtomicUsize = AtomicUsize::new(0);

/// Number of live handles in the process. Hosts use this to decide when the
/// library may be unloaded; it does not keep any object alive.
pub fn outstanding_handles() -> usize {
    OUTSTANDING.load(Ordering::SeqCst)
}

/// Integer token identifying a registered object. Zero is never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleToken(u64);

impl HandleToken {
    pub fn from_raw(raw: u64) -> Self {
        HandleToken(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

struct Slot {
    signature: u32,
    type_id: TypeId,
    type_name: &'static str,
    object: Arc<dyn Any + Send + Sync>,
}

impl Slot {
    fn is_valid_for<T: Any>(&self) -> bool {
        self.signature == HANDLE_SIGNATURE && self.type_id == TypeId::of::<T>()
    }
}

pub struct HandleRegistry {
    slots: Mutex<BTreeMap<u64, Slot>>,
    next: AtomicU64,
}

impl HandleRegistry {
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new(BTreeMap::new()),
            next: AtomicU64::new(1),
        }
    }

    /// Take ownership of `object` and return its token.
    pub fn wrap<T: Any + Send + Sync>(&self, object: T) -> HandleToken {
        let raw = self.next.fetch_add(1, Ordering::SeqCst);
        let slot = Slot {
            signature: HANDLE_SIGNATURE,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            object: Arc::new(object),
        };
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(raw, slot);
        OUTSTANDING.fetch_add(1, Ordering::SeqCst);
        log::trace!("Wrapped {} as handle {}", std::any::type_name::<T>(), raw);
        HandleToken(raw)
    }

    /// Resolve `token` to its object if it is live and of type `T`.
    pub fn get<T: Any + Send + Sync>(&self, token: HandleToken) -> Result<Arc<T>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.get(&token.0).ok_or(Kinect2Error::InvalidHandle)?;
        if !slot.is_valid_for::<T>() {
            log::debug!(
                "Handle {} holds {}, requested {}",
                token.0,
                slot.type_name,
                std::any::type_name::<T>()
            );
            return Err(Kinect2Error::InvalidHandle);
        }
        slot.object
            .clone()
            .downcast::<T>()
            .map_err(|_| Kinect2Error::InvalidHandle)
    }

    /// Invalidate `token` and release the object it owns.
    ///
    /// The object is dropped once the last outstanding `Arc` from
    /// [`get`](Self::get) goes away.
    pub fn destroy<T: Any + Send + Sync>(&self, token: HandleToken) -> Result<()> {
        let mut slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            match slots.get(&token.0) {
                Some(slot) if slot.is_valid_for::<T>() => {}
                _ => return Err(Kinect2Error::InvalidHandle),
            }
            slots.remove(&token.0).ok_or(Kinect2Error::InvalidHandle)?
        };
        slot.signature = 0;
        OUTSTANDING.fetch_sub(1, Ordering::SeqCst);
        log::trace!("Destroyed handle {} ({})", token.0, slot.type_name);
        // Dropped outside the registry lock: object teardown may block.
        drop(slot);
        Ok(())
    }

    /// Live handles in this registry.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
