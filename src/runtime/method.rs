//! Live method handles and their entry points.

use std::fmt;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::descriptor::MethodToken;

bitflags! {
    /// Runtime attributes consulted before redirecting a method.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodAttrs: u32 {
        /// Compiled under a mode that forbids entry-point redirection.
        /// Such methods are skipped, not failed.
        const NO_REDIRECT = 1 << 0;
        /// Runtime-internal method shape that cannot take a detour
        /// (per-instantiation generic thunks, special constructors).
        const SPECIAL_RUNTIME = 1 << 1;
    }
}

/// One parameter of a method signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamType {
    /// Fully qualified parameter type name.
    pub type_name: String,
    /// Whether the parameter is passed by reference (ref/out).
    pub by_ref: bool,
}

impl ParamType {
    /// Creates a by-value parameter of the given type.
    pub fn by_value(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            by_ref: false,
        }
    }

    /// Creates a by-reference parameter of the given type.
    pub fn by_ref(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            by_ref: true,
        }
    }
}

/// Shape of a method as its callers see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSig {
    /// Parameter shapes in declaration order, excluding the receiver.
    pub params: Vec<ParamType>,
    /// Whether the method is static (no receiver on the stack).
    pub is_static: bool,
}

/// Where invocations of a method enter it.
#[derive(Debug)]
pub enum EntryPoint {
    /// The runtime dispatches calls through a swappable slot. Covers methods
    /// not yet compiled: the slot is repointed whether or not the body behind
    /// it has been JIT-compiled.
    Slot(Arc<AtomicPtr<u8>>),
    /// Direct JIT-compiled entry; redirection must patch the code itself.
    Native(*mut u8),
}

/// A method loaded in the running VM.
#[derive(Debug)]
pub struct MethodImage {
    /// Token of the method within its module.
    token: MethodToken,
    /// Display name for logs.
    name: String,
    /// Signature as callers see it.
    sig: MethodSig,
    /// Runtime attributes.
    attrs: MethodAttrs,
    /// Entry point invocations go through.
    entry: EntryPoint,
}

// Safety: the raw entry pointer is only ever mutated through atomic slot
// swaps or page-protected patches, never through shared references.
unsafe impl Send for MethodImage {}
unsafe impl Sync for MethodImage {}

impl MethodImage {
    /// Creates a method image.
    pub fn new(
        token: MethodToken,
        name: impl Into<String>,
        sig: MethodSig,
        attrs: MethodAttrs,
        entry: EntryPoint,
    ) -> Self {
        Self {
            token,
            name: name.into(),
            sig,
            attrs,
            entry,
        }
    }
}

/// A cheap, clonable handle to a live method.
///
/// Clones share identity: [`MethodHandle::key`] is stable across every handle
/// resolved from the same underlying image, which is what keys the engine's
/// redirection table.
#[derive(Clone)]
pub struct MethodHandle(Arc<MethodImage>);

impl MethodHandle {
    /// Wraps a method image in a handle.
    pub fn new(image: MethodImage) -> Self {
        Self(Arc::new(image))
    }

    /// Token of the method within its module.
    pub fn token(&self) -> MethodToken {
        self.0.token
    }

    /// Display name for logs.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Signature as callers see it.
    pub fn sig(&self) -> &MethodSig {
        &self.0.sig
    }

    /// Runtime attributes.
    pub fn attrs(&self) -> MethodAttrs {
        self.0.attrs
    }

    /// Entry point invocations go through.
    pub fn entry(&self) -> &EntryPoint {
        &self.0.entry
    }

    /// The executable entry pointer as of this call.
    pub fn entry_ptr(&self) -> *const u8 {
        match &self.0.entry {
            EntryPoint::Slot(slot) => slot.load(Ordering::Acquire) as *const u8,
            EntryPoint::Native(code) => *code as *const u8,
        }
    }

    /// Identity key for this live method.
    pub fn key(&self) -> MethodKey {
        MethodKey(Arc::as_ptr(&self.0) as usize)
    }
}

impl fmt::Debug for MethodHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodHandle")
            .field("token", &self.0.token)
            .field("name", &self.0.name)
            .field("attrs", &self.0.attrs)
            .finish()
    }
}

/// Identity of a live method handle, stable across clones and re-resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodKey(usize);

#[cfg(test)]
mod tests {
    use super::*;

    fn image(entry: EntryPoint) -> MethodImage {
        MethodImage::new(
            MethodToken(0x0600_0001),
            "Game.Player.Update()",
            MethodSig {
                params: vec![ParamType::by_value("System.Single")],
                is_static: false,
            },
            MethodAttrs::empty(),
            entry,
        )
    }

    #[test]
    fn clones_share_identity() {
        let handle = MethodHandle::new(image(EntryPoint::Native(std::ptr::null_mut())));
        let clone = handle.clone();
        assert_eq!(handle.key(), clone.key());

        let other = MethodHandle::new(image(EntryPoint::Native(std::ptr::null_mut())));
        assert_ne!(handle.key(), other.key());
    }

    #[test]
    fn slot_entry_ptr_follows_the_slot() {
        let slot = Arc::new(AtomicPtr::new(0x1000 as *mut u8));
        let handle = MethodHandle::new(image(EntryPoint::Slot(Arc::clone(&slot))));
        assert_eq!(handle.entry_ptr() as usize, 0x1000);

        slot.store(0x2000 as *mut u8, Ordering::Release);
        assert_eq!(handle.entry_ptr() as usize, 0x2000);
    }
}
