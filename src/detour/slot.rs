//! Detour backend for slot-dispatched methods.
//!
//! Runtimes that route invocations through a per-method entry slot let us
//! redirect without touching code at all: swap the slot to the replacement's
//! entry and swap it back on revert. Both operations are single atomic
//! pointer writes, so they are safe with respect to methods currently
//! executing on other threads.

use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use super::{Detour, DetourError, DetourGuard};
use crate::runtime::{EntryPoint, MethodAttrs, MethodHandle};

/// Detour that redirects by swapping a method's dispatch slot.
#[derive(Default)]
pub struct SlotDetour;

impl SlotDetour {
    /// Creates a new slot detour backend.
    pub fn new() -> Self {
        Self
    }
}

unsafe impl Detour for SlotDetour {
    unsafe fn install(
        &self,
        original: &MethodHandle,
        replacement: &MethodHandle,
    ) -> Result<Box<dyn DetourGuard>, DetourError> {
        if original.attrs().contains(MethodAttrs::SPECIAL_RUNTIME) {
            return Err(DetourError::IneligibleMethod(original.name().to_owned()));
        }
        let slot = match original.entry() {
            EntryPoint::Slot(slot) => Arc::clone(slot),
            EntryPoint::Native(_) => {
                return Err(DetourError::UnsupportedEntry(original.name().to_owned()))
            }
        };

        let installed = replacement.entry_ptr() as *mut u8;
        let previous = slot.swap(installed, Ordering::AcqRel);

        Ok(Box::new(SlotGuard {
            slot,
            previous,
            installed,
        }))
    }
}

/// Guard restoring a swapped entry slot.
struct SlotGuard {
    /// The dispatch slot that was redirected.
    slot: Arc<AtomicPtr<u8>>,
    /// Entry pointer the slot held before the redirect.
    previous: *mut u8,
    /// Entry pointer this guard installed.
    installed: *mut u8,
}

unsafe impl DetourGuard for SlotGuard {}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // Restore only if the slot still holds our redirect; a later writer
        // owns the slot otherwise.
        let _ = self.slot.compare_exchange(
            self.installed,
            self.previous,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::MethodToken;
    use crate::runtime::{MethodImage, MethodSig};
    use std::mem;

    extern "C" fn returns_11() -> i32 {
        11
    }

    extern "C" fn returns_22() -> i32 {
        22
    }

    fn slot_method(token: i32, attrs: MethodAttrs, body: extern "C" fn() -> i32) -> MethodHandle {
        let slot = Arc::new(AtomicPtr::new(body as *mut u8));
        MethodHandle::new(MethodImage::new(
            MethodToken(token),
            format!("M{token}"),
            MethodSig {
                params: Vec::new(),
                is_static: true,
            },
            attrs,
            EntryPoint::Slot(slot),
        ))
    }

    /// Calls through the method's current entry pointer.
    unsafe fn invoke(method: &MethodHandle) -> i32 {
        let f: extern "C" fn() -> i32 = mem::transmute(method.entry_ptr());
        f()
    }

    #[test]
    fn swaps_and_restores_the_slot() {
        let original = slot_method(1, MethodAttrs::empty(), returns_11);
        let replacement = slot_method(2, MethodAttrs::empty(), returns_22);

        unsafe {
            assert_eq!(invoke(&original), 11);

            let guard = SlotDetour::new().install(&original, &replacement).unwrap();
            assert_eq!(invoke(&original), 22);

            guard.revert();
            assert_eq!(invoke(&original), 11);
        }
    }

    #[test]
    fn drop_restores_like_revert() {
        let original = slot_method(1, MethodAttrs::empty(), returns_11);
        let replacement = slot_method(2, MethodAttrs::empty(), returns_22);

        unsafe {
            {
                let _guard = SlotDetour::new().install(&original, &replacement).unwrap();
                assert_eq!(invoke(&original), 22);
            }
            assert_eq!(invoke(&original), 11);
        }
    }

    #[test]
    fn stale_guard_leaves_a_newer_redirect_alone() {
        let original = slot_method(1, MethodAttrs::empty(), returns_11);
        let replacement = slot_method(2, MethodAttrs::empty(), returns_22);

        unsafe {
            let stale = SlotDetour::new().install(&original, &replacement).unwrap();
            // Someone else repoints the slot after us.
            if let EntryPoint::Slot(slot) = original.entry() {
                slot.store(returns_11 as *mut u8, Ordering::Release);
            }
            stale.revert();
            assert_eq!(invoke(&original), 11);
        }
    }

    #[test]
    fn special_runtime_methods_are_ineligible() {
        let original = slot_method(1, MethodAttrs::SPECIAL_RUNTIME, returns_11);
        let replacement = slot_method(2, MethodAttrs::empty(), returns_22);

        let result = unsafe { SlotDetour::new().install(&original, &replacement) };
        assert!(matches!(result, Err(DetourError::IneligibleMethod(_))));
    }

    #[test]
    fn native_entries_are_unsupported() {
        let original = MethodHandle::new(MethodImage::new(
            MethodToken(1),
            "M1",
            MethodSig {
                params: Vec::new(),
                is_static: true,
            },
            MethodAttrs::empty(),
            EntryPoint::Native(returns_11 as *mut u8),
        ));
        let replacement = slot_method(2, MethodAttrs::empty(), returns_22);

        let result = unsafe { SlotDetour::new().install(&original, &replacement) };
        assert!(matches!(result, Err(DetourError::UnsupportedEntry(_))));
    }
}
