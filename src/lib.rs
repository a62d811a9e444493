//! # libpatch
//!
//! Live method patching ("hot reload") for managed-runtime hosts.
//!
//! An external producer compiles modified source into replacement assemblies
//! and describes each changed method portably (assembly name, display name,
//! metadata token, generic arguments). This crate owns everything that happens
//! after that hand-off:
//!
//! 1. [`resolver::SymbolResolver`] maps a portable descriptor to a live,
//!    loaded method handle, tolerating token drift between recompiles.
//! 2. [`compat`] decides whether redirecting one method's callers into another
//!    is memory-safe.
//! 3. [`detour`] performs the reversible entry-point redirection.
//! 4. [`engine::CodePatcher`] orchestrates the pending queue, the token
//!    back-off search, redirection bookkeeping, undo, and history persistence.
//!
//! Nothing in an apply pass is allowed to escape as an error to the caller:
//! every failure is caught at the narrowest possible scope, logged via
//! `tracing`, and converted into a per-method skip. A partially-applied batch
//! is a normal, stable end state.
//!
//! The crate never talks to the compiler server, the editor UI, or the
//! network; hosts supply a [`runtime::AssemblyLoader`] and a
//! [`detour::Detour`] backend and feed [`batch::PatchBatch`] values into the
//! engine.

#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod batch;
pub mod compat;
pub mod descriptor;
pub mod detour;
pub mod engine;
pub mod persist;
pub mod resolver;
pub mod runtime;

pub use batch::{PatchBatch, PatchUnit};
pub use descriptor::{MethodDescriptor, MethodToken, TypeDescriptor};
pub use engine::CodePatcher;
pub use persist::PersistError;
pub use resolver::{ResolveError, SymbolResolver};
