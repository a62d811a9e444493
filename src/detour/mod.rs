//! # Detour
//!
//! This module covers detours, which redirect all future invocations of one
//! live method into another, reversibly.
//!
//! The capability is deliberately narrow: a [`Detour`] installs a redirect and
//! hands back a [`DetourGuard`] whose drop restores the original entry point.
//! Platform-specific redirection mechanics live behind this seam so the
//! orchestration engine never touches them directly. Two backends ship with
//! the crate: [`slot::SlotDetour`] for runtimes that dispatch calls through a
//! swappable entry slot, and [`jmp::JmpDetour`] for patching JIT-compiled
//! native entries in place.

#[cfg(target_arch = "x86_64")]
pub mod jmp;
pub mod slot;

use thiserror::Error;

use crate::descriptor::MethodDescriptor;
use crate::runtime::MethodHandle;

/// Errors that can occur while installing a detour.
#[derive(Debug, Error)]
pub enum DetourError {
    /// The method has a runtime-internal shape that cannot take a detour.
    #[error("method '{0}' has a runtime-internal shape that cannot take a detour")]
    IneligibleMethod(String),
    /// The method's entry point kind is not supported by this backend.
    #[error("entry point kind of '{0}' is not supported by this detour backend")]
    UnsupportedEntry(String),
    /// Not enough decodable code at the entry to hold a redirect.
    #[error("entry point of '{0}' is too small to hold a redirect")]
    EntryTooSmall(String),
    /// The bytes at the entry do not decode as instructions.
    #[error("could not decode instructions at entry point of '{0}'")]
    UndecodableEntry(String),
    /// The platform refused to alter code page protections. Ahead-of-time
    /// compiled runtimes land here; a known unsupported configuration.
    #[error("error adjusting code page protections: {0}")]
    Protection(#[from] region::Error),
}

/// Capability for redirecting one live method into another.
///
/// # Safety
///
/// Implementations mutate live executable state. They must install and remove
/// the redirect atomically with respect to the method's entry point, so that
/// reverting while the method is on some call stack cannot corrupt control
/// flow.
pub unsafe trait Detour {
    /// Redirects all future invocations of `original` into `replacement`.
    ///
    /// On success, every call site of `original`, including ones already
    /// JIT-compiled, transparently executes `replacement`'s body until the
    /// returned guard is dropped.
    ///
    /// # Safety
    ///
    /// Both handles must refer to live methods of the running VM, and
    /// `replacement` must already have passed the ABI gate for `original`.
    unsafe fn install(
        &self,
        original: &MethodHandle,
        replacement: &MethodHandle,
    ) -> Result<Box<dyn DetourGuard>, DetourError>;
}

/// Reversible record of one installed detour.
///
/// # Safety
///
/// Dropping the guard must fully restore the original entry point, whether or
/// not [`DetourGuard::revert`] was called.
pub unsafe trait DetourGuard {
    /// Restores the original entry point.
    fn revert(self: Box<Self>) {
        // most guards implement all functionality in [`Drop::drop`]
    }
}

/// One currently-active method redirection, tracked by the engine.
///
/// Created when a detour installation succeeds; reverted when a later patch
/// supersedes the same method or an explicit undo is requested. Never torn
/// down on shutdown; process exit discards it naturally.
pub struct RedirectionRecord {
    /// Descriptor of the original method, as delivered by the producer.
    method: MethodDescriptor,
    /// Token offset the back-off search matched at.
    offset: i32,
    /// Guard holding the live redirect.
    guard: Box<dyn DetourGuard>,
}

impl RedirectionRecord {
    /// Creates a record for a freshly installed detour.
    pub fn new(method: MethodDescriptor, offset: i32, guard: Box<dyn DetourGuard>) -> Self {
        Self {
            method,
            offset,
            guard,
        }
    }

    /// Descriptor of the redirected method.
    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    /// Token offset the back-off search matched at.
    pub fn offset(&self) -> i32 {
        self.offset
    }

    /// Restores the original method.
    pub fn revert(self) {
        self.guard.revert();
    }
}
