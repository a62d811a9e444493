//! # Runtime
//!
//! The seam between the patch engine and the live virtual machine.
//!
//! The engine never inspects VM internals directly; it sees loaded assemblies
//! as [`AssemblyImage`] values whose modules resolve metadata tokens to
//! [`MethodHandle`]s, and it loads replacement assemblies through the host's
//! [`AssemblyLoader`]. Hosts back these traits with their actual runtime
//! bindings; the test suite backs them with token maps.

pub mod method;

pub use method::{
    EntryPoint, MethodAttrs, MethodHandle, MethodImage, MethodKey, MethodSig, ParamType,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::descriptor::MethodToken;

/// Why a token did not resolve within one module.
///
/// The two cases drive different behaviour in the engine's back-off search:
/// `OutOfRange` permanently prunes a search direction, `NotFound` does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    /// The token falls entirely outside the module's metadata table.
    OutOfRange,
    /// The token is within the table but no method lives at it.
    NotFound,
}

/// One module of a loaded assembly, resolvable by metadata token.
///
/// Implementations must be stable: resolving the same token twice yields
/// handles sharing the same underlying method image, so that handle identity
/// can key the engine's redirection table.
pub trait ModuleImage: Send + Sync {
    /// Resolves the method at `token`.
    fn resolve_method(&self, token: MethodToken) -> Result<MethodHandle, TokenError>;
}

/// A loaded assembly instance.
///
/// One simple name may map to several live instances (reload scenarios);
/// the resolver considers all of them.
pub struct AssemblyImage {
    /// Simple assembly name, the key the resolver indexes by.
    name: String,
    /// On-disk location, when the assembly was loaded from a file.
    location: Option<PathBuf>,
    /// Modules of this assembly. Patch assemblies have exactly one.
    modules: Vec<Arc<dyn ModuleImage>>,
}

impl AssemblyImage {
    /// Creates an assembly image from its name, optional location and modules.
    pub fn new(
        name: impl Into<String>,
        location: Option<PathBuf>,
        modules: Vec<Arc<dyn ModuleImage>>,
    ) -> Self {
        Self {
            name: name.into(),
            location,
            modules,
        }
    }

    /// Simple assembly name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// On-disk location, when known.
    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    /// All modules of this assembly.
    pub fn modules(&self) -> &[Arc<dyn ModuleImage>] {
        &self.modules
    }

    /// The module that patch-assembly tokens resolve against.
    pub fn primary_module(&self) -> Option<&Arc<dyn ModuleImage>> {
        self.modules.first()
    }
}

/// Error loading a replacement assembly into the process.
#[derive(Debug, Error)]
pub enum LoadError {
    /// No assembly image exists under the requested name.
    #[error("assembly image not found: {0}")]
    NotFound(String),
    /// The runtime refused to load the image.
    #[error("assembly image rejected by the runtime: {0}")]
    Rejected(String),
    /// Reading the image from disk failed.
    #[error("I/O error loading assembly: {0}")]
    Io(#[from] std::io::Error),
}

/// Loads replacement assemblies by name.
///
/// Loading must be idempotent per name: the engine may request the same
/// assembly again on a later apply pass and expects the same image back.
pub trait AssemblyLoader {
    /// Loads the assembly image registered under `name`.
    fn load(&self, name: &str) -> Result<Arc<AssemblyImage>, LoadError>;
}
