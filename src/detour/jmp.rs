//! Detour backend that patches native entry points with an absolute jump.
//!
//! For methods the JIT has already compiled to a fixed native entry, the only
//! way to redirect every existing call site is to overwrite the first bytes
//! of the entry itself with a jump to the replacement. The original bytes are
//! saved and written back on revert.
//!
//! x86-64 only. The write is not a single atomic store; hosts must quiesce
//! threads that could be executing the first [`JMP_SIZE`] bytes of the entry
//! while installing or reverting.

use std::mem;
use std::ptr;
use std::slice;

use iced_x86::{Decoder, DecoderOptions};
use region::Protection;

use super::{Detour, DetourError, DetourGuard};
use crate::runtime::{EntryPoint, MethodAttrs, MethodHandle};

/// Struct helper for generating an absolute jump.
#[repr(packed)]
#[allow(dead_code)]
struct JmpAbs {
    /// Absolute jmp instruction (`jmp [rip + 0]`).
    jmp: [u8; 6],
    /// Absolute address to jump to, read from the 8 bytes after the jmp.
    target: usize,
}

/// Size of the redirect written at a method entry.
pub const JMP_SIZE: usize = mem::size_of::<JmpAbs>();

/// Bytes read when validating an entry point: the redirect itself plus the
/// largest x86 instruction minus one, so a decode started on the last
/// redirect byte can still complete.
const DECODE_WINDOW: usize = JMP_SIZE + 14;

/// Generates an absolute jump to `target` and returns its bytecode.
fn jmp_abs(target: usize) -> [u8; JMP_SIZE] {
    unsafe {
        mem::transmute(JmpAbs {
            jmp: [0xff, 0x25, 0x00, 0x00, 0x00, 0x00],
            target,
        })
    }
}

/// Detour that overwrites a native entry point with an absolute jump.
#[derive(Default)]
pub struct JmpDetour;

impl JmpDetour {
    /// Creates a new jmp detour backend.
    pub fn new() -> Self {
        Self
    }
}

unsafe impl Detour for JmpDetour {
    unsafe fn install(
        &self,
        original: &MethodHandle,
        replacement: &MethodHandle,
    ) -> Result<Box<dyn DetourGuard>, DetourError> {
        if original.attrs().contains(MethodAttrs::SPECIAL_RUNTIME) {
            return Err(DetourError::IneligibleMethod(original.name().to_owned()));
        }
        let location = match original.entry() {
            EntryPoint::Native(code) => *code,
            EntryPoint::Slot(_) => {
                return Err(DetourError::UnsupportedEntry(original.name().to_owned()))
            }
        };

        validate_entry(location, original.name())?;

        let patch = jmp_abs(replacement.entry_ptr() as usize);
        let guard = EntryPatch::write(location, &patch)?;
        Ok(Box::new(guard))
    }
}

/// Checks that `location` starts with enough decodable instructions to hold
/// the redirect.
///
/// Inlined-away methods and runtime thunks often leave entries shorter than
/// [`JMP_SIZE`]; overwriting past them would corrupt whatever follows.
///
/// # Safety
///
/// `location` must be readable for [`DECODE_WINDOW`] bytes.
unsafe fn validate_entry(location: *const u8, name: &str) -> Result<(), DetourError> {
    let window = slice::from_raw_parts(location, DECODE_WINDOW);
    let mut decoder = Decoder::with_ip(64, window, location as u64, DecoderOptions::NONE);
    let mut covered = 0usize;
    while covered < JMP_SIZE {
        if !decoder.can_decode() {
            return Err(DetourError::EntryTooSmall(name.to_owned()));
        }
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(DetourError::UndecodableEntry(name.to_owned()));
        }
        covered += instruction.len();
    }
    Ok(())
}

/// Saved-bytes patch over a method entry, restored on drop.
struct EntryPatch {
    /// Original code from `location`.
    original: Vec<u8>,
    /// Entry point that was patched.
    location: *mut u8,
}

impl EntryPatch {
    /// Overwrites `patch.len()` bytes at `location`, flipping page
    /// protections around the write.
    ///
    /// # Safety
    ///
    /// `location` must be valid for the full length of the patch, and no
    /// other thread may be executing through those bytes during the write.
    unsafe fn write(location: *mut u8, patch: &[u8]) -> Result<Self, region::Error> {
        let _handle =
            region::protect_with_handle(location, patch.len(), Protection::READ_WRITE_EXECUTE)?;
        let mut original = vec![0u8; patch.len()];
        ptr::copy(location, original.as_mut_ptr(), patch.len());
        ptr::copy(patch.as_ptr(), location, patch.len());
        Ok(Self { original, location })
    }
}

unsafe impl DetourGuard for EntryPatch {}

impl Drop for EntryPatch {
    fn drop(&mut self) {
        // Safety: location was valid when the patch was written; restore the
        // saved bytes under the same protections. A failed protect here means
        // the pages are gone, in which case writing would be worse than
        // leaking the redirect.
        unsafe {
            if let Ok(_handle) = region::protect_with_handle(
                self.location,
                self.original.len(),
                Protection::READ_WRITE_EXECUTE,
            ) {
                ptr::copy(self.original.as_ptr(), self.location, self.original.len());
            }
        }
    }
}
