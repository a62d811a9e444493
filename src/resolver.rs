//! # Symbol resolver
//!
//! Maps portable method descriptors to live, loaded method handles.
//!
//! The resolver is built once per session from a snapshot of the currently
//! loaded assemblies, indexed by simple name. One name may map to several
//! live instances (assembly reload scenarios); resolution considers all of
//! them. Patch assemblies are registered incrementally as they are loaded.
//!
//! Lookups are safe from any thread once construction is done; registering a
//! new assembly takes the write lock and is synchronized against concurrent
//! reads.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::descriptor::{MethodDescriptor, MethodToken};
use crate::runtime::{AssemblyImage, MethodHandle, TokenError};

/// Why a descriptor did not resolve to a live method.
///
/// `TokenOutOfRange` and `NotFound` are deliberately distinct variants: the
/// engine's back-off search prunes a whole probe direction on the first
/// out-of-range result, while not-found keeps the direction alive. This is a
/// tagged return value rather than an unwinding error because it is consulted
/// on a hot path, up to 100,000 times per search.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// No assembly with this simple name is loaded.
    #[error("assembly not loaded: {0}")]
    AssemblyNotLoaded(String),
    /// The token fell outside the metadata table of every candidate module.
    #[error("token {token} out of range for every module of {assembly}")]
    TokenOutOfRange {
        /// Simple name of the assembly searched.
        assembly: String,
        /// The token probed.
        token: MethodToken,
    },
    /// The token is in range for at least one module, but no method lives
    /// at it.
    #[error("no method at token {token} in {assembly}")]
    NotFound {
        /// Simple name of the assembly searched.
        assembly: String,
        /// The token probed.
        token: MethodToken,
    },
}

/// Index of loaded assemblies, resolvable by descriptor.
pub struct SymbolResolver {
    /// Live assembly instances keyed by simple name.
    assemblies: RwLock<HashMap<String, Vec<Arc<AssemblyImage>>>>,
    /// Directories of on-disk assemblies, for the host's compiler collaborator.
    search_paths: RwLock<BTreeSet<PathBuf>>,
}

impl SymbolResolver {
    /// Builds a resolver from a snapshot of the currently loaded assemblies.
    pub fn new(snapshot: impl IntoIterator<Item = Arc<AssemblyImage>>) -> Self {
        let resolver = Self {
            assemblies: RwLock::new(HashMap::new()),
            search_paths: RwLock::new(BTreeSet::new()),
        };
        for assembly in snapshot {
            resolver.add_assembly(assembly);
        }
        resolver
    }

    /// Registers a newly loaded assembly without rebuilding the index.
    pub fn add_assembly(&self, assembly: Arc<AssemblyImage>) {
        if let Some(dir) = assembly.location().and_then(|path| path.parent()) {
            self.search_paths.write().unwrap().insert(dir.to_owned());
        }
        self.assemblies
            .write()
            .unwrap()
            .entry(assembly.name().to_owned())
            .or_default()
            .push(assembly);
    }

    /// Directories containing the on-disk assemblies seen so far.
    pub fn assembly_search_paths(&self) -> Vec<PathBuf> {
        self.search_paths.read().unwrap().iter().cloned().collect()
    }

    /// Resolves a descriptor to a live method handle.
    ///
    /// Every instance registered under the descriptor's assembly name is
    /// tried, module by module, at the exact token. The first hit wins.
    pub fn resolve(&self, method: &MethodDescriptor) -> Result<MethodHandle, ResolveError> {
        let assemblies = self.assemblies.read().unwrap();
        let instances = assemblies
            .get(&method.assembly_name)
            .ok_or_else(|| ResolveError::AssemblyNotLoaded(method.assembly_name.clone()))?;

        let mut token_in_range = false;
        for assembly in instances {
            for module in assembly.modules() {
                match module.resolve_method(method.metadata_token) {
                    Ok(handle) => return Ok(handle),
                    Err(TokenError::NotFound) => token_in_range = true,
                    Err(TokenError::OutOfRange) => {}
                }
            }
        }

        if token_in_range {
            Err(ResolveError::NotFound {
                assembly: method.assembly_name.clone(),
                token: method.metadata_token,
            })
        } else {
            Err(ResolveError::TokenOutOfRange {
                assembly: method.assembly_name.clone(),
                token: method.metadata_token,
            })
        }
    }
}
