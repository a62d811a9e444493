//! # Engine
//!
//! The patch application engine: owns the pending queue, runs the token
//! back-off search, tracks active redirections, and keeps the patch history.
//!
//! All mutation goes through `&mut self`, so the single-threaded-mutation
//! discipline the detour backends require is enforced by the borrow checker.
//! Hosts that apply patches from multiple sources marshal calls onto one
//! logical thread, exactly as they must marshal onto the runtime's main
//! thread before touching live JIT state.
//!
//! Nothing in an apply pass escapes as an error: every per-method and
//! per-unit failure is logged and converted into a skip, and a
//! partially-applied batch is a normal, stable end state.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::batch::{PatchBatch, PatchUnit};
use crate::compat;
use crate::descriptor::MethodDescriptor;
use crate::detour::{Detour, RedirectionRecord};
use crate::persist;
use crate::persist::PersistError;
use crate::resolver::{ResolveError, SymbolResolver};
use crate::runtime::{AssemblyLoader, MethodHandle, MethodKey, ModuleImage};

/// Upper bound on the token offsets probed by the back-off search.
const MAX_TOKEN_OFFSET: i32 = 100_000;

/// Searches slower than this get a log line.
const SLOW_SEARCH: Duration = Duration::from_millis(500);

/// Hook invoked once per apply pass when at least one method was patched.
type ReloadHook = Box<dyn FnMut(&[MethodDescriptor])>;

/// Result of probing one token offset during the back-off search.
enum Probe {
    /// Resolved and ABI-compatible; the search is over.
    Match(MethodHandle),
    /// Nothing usable at this token; keep searching.
    Miss,
    /// The token ran off the module's metadata table in this direction.
    OutOfRange,
}

/// The live method-patch application engine.
///
/// Constructed once per session by the host and handed to collaborators by
/// reference; there is no global instance. The resolver snapshot, the
/// assembly loader and the detour backend are injected at construction.
pub struct CodePatcher {
    /// Apply immediately on [`CodePatcher::register_patches`].
    auto_apply: bool,
    /// When set, history is re-saved here after every apply pass.
    persistence_path: Option<PathBuf>,
    /// Number of completed apply passes this session.
    patches_applied: u32,
    /// Batches registered but not yet applied.
    pending: Vec<PatchBatch>,
    /// Append-only record of every batch consumed by an apply pass.
    history: Vec<PatchBatch>,
    /// Active redirections, at most one per live method handle.
    records: HashMap<MethodKey, RedirectionRecord>,
    /// Every method successfully redirected this session, deduplicated by
    /// token after each apply pass.
    patched_methods: Vec<MethodDescriptor>,
    /// Symbol index over the loaded assemblies.
    resolver: SymbolResolver,
    /// Loads replacement assemblies by name.
    loader: Box<dyn AssemblyLoader>,
    /// Installs entry-point redirections.
    detour: Box<dyn Detour>,
    /// Fired once per apply pass when something was patched.
    reload_hook: Option<ReloadHook>,
}

impl CodePatcher {
    /// Creates an engine over a resolver snapshot, an assembly loader and a
    /// detour backend. Auto-apply starts enabled.
    pub fn new(
        resolver: SymbolResolver,
        loader: Box<dyn AssemblyLoader>,
        detour: Box<dyn Detour>,
    ) -> Self {
        Self {
            auto_apply: true,
            persistence_path: None,
            patches_applied: 0,
            pending: Vec::new(),
            history: Vec::new(),
            records: HashMap::new(),
            patched_methods: Vec::new(),
            resolver,
            loader,
            detour,
            reload_hook: None,
        }
    }

    /// Whether registering a batch triggers an immediate apply pass.
    pub fn auto_apply(&self) -> bool {
        self.auto_apply
    }

    /// Enables or disables apply-on-register.
    pub fn set_auto_apply(&mut self, auto_apply: bool) {
        self.auto_apply = auto_apply;
    }

    /// Sets where history is saved after each apply pass; `None` disables
    /// auto-saving.
    pub fn set_persistence_path(&mut self, path: Option<PathBuf>) {
        self.persistence_path = path;
    }

    /// Registers a hook fired once per apply pass with the methods newly
    /// patched by that pass.
    pub fn set_reload_hook(&mut self, hook: impl FnMut(&[MethodDescriptor]) + 'static) {
        self.reload_hook = Some(Box::new(hook));
    }

    /// Every method successfully redirected this session, deduplicated by
    /// token.
    pub fn patched_methods(&self) -> &[MethodDescriptor] {
        &self.patched_methods
    }

    /// Batches registered but not yet applied.
    pub fn pending_patches(&self) -> &[PatchBatch] {
        &self.pending
    }

    /// Number of batches registered but not yet applied.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of completed apply passes this session.
    pub fn patches_applied(&self) -> u32 {
        self.patches_applied
    }

    /// Number of currently-active redirections.
    pub fn redirection_count(&self) -> usize {
        self.records.len()
    }

    /// Directories containing the on-disk assemblies seen by the resolver.
    pub fn assembly_search_paths(&self) -> Vec<PathBuf> {
        self.resolver.assembly_search_paths()
    }

    /// The symbol resolver backing this engine.
    pub fn resolver(&self) -> &SymbolResolver {
        &self.resolver
    }

    /// Enqueues a batch; applies immediately when auto-apply is enabled.
    pub fn register_patches(&mut self, batch: PatchBatch) {
        info!(
            "registering patch batch '{}': {} units, {} methods",
            batch.id,
            batch.units.len(),
            batch.method_count()
        );
        for failure in &batch.failures {
            warn!("patch producer reported: {}", failure);
        }
        self.pending.push(batch);
        if self.auto_apply {
            self.apply_patches();
        }
    }

    /// Removes the most recently registered pending batch with this id.
    /// Already-applied batches are unaffected.
    pub fn remove_patch(&mut self, id: &str) {
        if let Some(pos) = self.pending.iter().rposition(|batch| batch.id == id) {
            self.pending.remove(pos);
        }
    }

    /// Runs one apply pass over the pending queue. Idempotent when the queue
    /// is empty.
    pub fn apply_patches(&mut self) {
        info!("applying patches; {} batches pending", self.pending.len());

        let batches: Vec<PatchBatch> = self.pending.drain(..).collect();
        let already_patched = self.patched_methods.len();

        for batch in &batches {
            for unit in &batch.units {
                self.handle_unit(unit);
            }
        }

        let newly_patched = self.patched_methods[already_patched..].to_vec();
        self.dedup_patched_methods();
        self.history.extend(batches);

        if !newly_patched.is_empty() {
            if let Some(hook) = self.reload_hook.as_mut() {
                hook(&newly_patched);
            }
        }

        if let Some(path) = self.persistence_path.clone() {
            persist::save_in_background(path, self.history.clone());
        }

        self.patches_applied += 1;
    }

    /// Reverses one previously installed redirection.
    ///
    /// Best effort: when the descriptor no longer re-resolves, any active
    /// redirection recorded under the same token is reverted directly, so the
    /// engine never holds a redirect it cannot get rid of. Undoing a method
    /// that is not patched is a no-op.
    pub fn undo_patch(&mut self, method: &MethodDescriptor) {
        match self.resolver.resolve(method) {
            Ok(handle) => self.revert_record(&handle),
            Err(err) => {
                warn!(
                    "could not re-resolve {} for undo ({}); reverting by token",
                    method.display_name, err
                );
                self.revert_records_by_token(method);
            }
        }
        self.patched_methods
            .retain(|m| m.metadata_token != method.metadata_token);
    }

    /// Resets the patched-methods log and the applied-pass counter for a
    /// fresh session. Active redirections stay installed.
    pub fn clear_patched_methods(&mut self) {
        self.patched_methods.clear();
        self.patches_applied = 0;
    }

    /// Persists the full applied-batch history to `path` on a background
    /// thread.
    ///
    /// Only path preconditions fail fast; write failures are logged and
    /// swallowed. The returned handle may be joined or dropped.
    pub fn save_applied_patches(&self, path: &Path) -> Result<JoinHandle<()>, PersistError> {
        persist::validate_path(path)?;
        Ok(persist::save_in_background(
            path.to_owned(),
            self.history.clone(),
        ))
    }

    /// Restores a previously saved history by replaying every batch through
    /// [`CodePatcher::register_patches`], synchronously. Returns the number
    /// of batches replayed.
    ///
    /// A missing or unreadable history file yields zero batches; only path
    /// preconditions fail fast.
    pub fn load_patches_blocked(&mut self, path: &Path) -> Result<usize, PersistError> {
        persist::validate_path(path)?;
        info!("loading patches from {}", path.display());
        let batches = persist::load_history(path);
        let count = batches.len();
        for batch in batches {
            self.register_patches(batch);
        }
        Ok(count)
    }

    /// Applies one patch unit: loads its assembly, registers new methods,
    /// then redirects each (modified, replacement) pair.
    ///
    /// A unit that fails to load is skipped without affecting other units.
    fn handle_unit(&mut self, unit: &PatchUnit) {
        let assembly = match self.loader.load(&unit.patch_assembly) {
            Ok(assembly) => assembly,
            Err(err) => {
                warn!(
                    "failed to load patch assembly '{}' for patch '{}': {}",
                    unit.patch_assembly, unit.id, err
                );
                return;
            }
        };
        let module = match assembly.primary_module() {
            Some(module) => Arc::clone(module),
            None => {
                warn!("patch assembly '{}' has no modules", unit.patch_assembly);
                return;
            }
        };

        for method in &unit.new_methods {
            match module.resolve_method(method.metadata_token) {
                Ok(handle) => debug!(
                    "registered new method {} at {}",
                    handle.name(),
                    method.metadata_token
                ),
                Err(err) => warn!(
                    "new method {} did not resolve in patch assembly '{}': {:?}",
                    method.display_name, unit.patch_assembly, err
                ),
            }
        }
        self.resolver.add_assembly(Arc::clone(&assembly));

        if !unit.is_well_formed() {
            warn!(
                "patch '{}' has mismatched modified/patch method lists ({} vs {}); skipping unit",
                unit.id,
                unit.modified_methods.len(),
                unit.patch_methods.len()
            );
            return;
        }
        for (original, replacement) in unit.method_pairs() {
            self.patch_method(&module, original, replacement);
        }
    }

    /// Redirects one modified method to its replacement. Every failure mode
    /// is logged and converted into a skip.
    fn patch_method(
        &mut self,
        module: &Arc<dyn ModuleImage>,
        original: &MethodDescriptor,
        patch: &MethodDescriptor,
    ) {
        let replacement = match module.resolve_method(patch.metadata_token) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(
                    "replacement method {} did not resolve at {} in its patch assembly: {:?}",
                    patch.display_name, patch.metadata_token, err
                );
                return;
            }
        };

        let started = Instant::now();
        let outcome = self.resolve_with_backoff(original, &replacement);
        if started.elapsed() > SLOW_SEARCH {
            info!(
                "method resolution for {} took {} ms",
                original.display_name,
                started.elapsed().as_millis()
            );
        }

        let (target, offset) = match outcome {
            Ok(Some(found)) => found,
            Ok(None) => {
                warn!(
                    "method mismatch: {}, patch: {}. This can have multiple reasons:\n\
                     1. The same project is open in several editor instances through \
                     symlinks, and the change was made from the symlinked copy\n\
                     2. A bug in the patch producer; please report a reproduction \
                     (code before/after)",
                    original.simple_name,
                    replacement.name()
                );
                return;
            }
            Err(err) => {
                warn!(
                    "failed to resolve {} in assembly {}: {}",
                    original.display_name, original.assembly_name, err
                );
                return;
            }
        };

        if compat::forbids_redirection(&target) {
            info!(
                "skipped live patch for '{}': compiled without redirection support",
                original.display_name
            );
            return;
        }

        // At most one active redirection per handle: supersede before install.
        self.revert_record(&target);

        debug!(
            "detouring method {} -> {}, token offset {}",
            original.metadata_token,
            replacement.name(),
            offset
        );
        // SAFETY: both handles were resolved from live images, and the
        // replacement passed the ABI gate during the back-off search.
        let installed = unsafe { self.detour.install(&target, &replacement) };
        match installed {
            Ok(guard) => {
                self.records.insert(
                    target.key(),
                    RedirectionRecord::new(original.clone(), offset, guard),
                );
                self.patched_methods.push(original.clone());
            }
            Err(err) => {
                warn!(
                    "failed to install detour for {} in assembly {}: {}",
                    original.display_name, original.assembly_name, err
                );
            }
        }
    }

    /// Token back-off search.
    ///
    /// Tokens drift by small deltas between recompiles, so the real method is
    /// searched at offsets `0, +1, -1, +2, -2, ...` up to
    /// [`MAX_TOKEN_OFFSET`]. The first candidate that resolves and passes the
    /// ABI gate wins. An out-of-range result permanently disables its probe
    /// direction: once a direction runs off the end of the module it can
    /// never re-enter range.
    fn resolve_with_backoff(
        &self,
        original: &MethodDescriptor,
        replacement: &MethodHandle,
    ) -> Result<Option<(MethodHandle, i32)>, ResolveError> {
        match self.probe(original, replacement, 0)? {
            Probe::Match(handle) => return Ok(Some((handle, 0))),
            // The unmodified token being out of range does not prune either
            // direction; lower offsets may still land back in the table.
            Probe::Miss | Probe::OutOfRange => {}
        }

        let mut offset = 1;
        let mut try_higher = true;
        let mut try_lower = true;
        while offset <= MAX_TOKEN_OFFSET && (try_higher || try_lower) {
            if try_higher {
                match self.probe(original, replacement, offset)? {
                    Probe::Match(handle) => return Ok(Some((handle, offset))),
                    Probe::OutOfRange => try_higher = false,
                    Probe::Miss => {}
                }
            }
            if try_lower {
                match self.probe(original, replacement, -offset)? {
                    Probe::Match(handle) => return Ok(Some((handle, -offset))),
                    Probe::OutOfRange => try_lower = false,
                    Probe::Miss => {}
                }
            }
            offset += 1;
        }
        Ok(None)
    }

    /// Probes one token offset: resolve, then gate on ABI compatibility.
    fn probe(
        &self,
        original: &MethodDescriptor,
        replacement: &MethodHandle,
        offset: i32,
    ) -> Result<Probe, ResolveError> {
        let candidate = original.with_token(original.metadata_token.offset_by(offset));
        match self.resolver.resolve(&candidate) {
            Ok(handle) => {
                if compat::are_compatible(&handle, replacement) {
                    Ok(Probe::Match(handle))
                } else {
                    Ok(Probe::Miss)
                }
            }
            Err(ResolveError::NotFound { .. }) => Ok(Probe::Miss),
            Err(ResolveError::TokenOutOfRange { .. }) => Ok(Probe::OutOfRange),
            Err(err @ ResolveError::AssemblyNotLoaded(_)) => Err(err),
        }
    }

    /// Fallback undo path for descriptors that no longer resolve: reverts
    /// every active redirection recorded under the same metadata token.
    fn revert_records_by_token(&mut self, method: &MethodDescriptor) {
        let keys: Vec<MethodKey> = self
            .records
            .iter()
            .filter(|(_, record)| record.method().metadata_token == method.metadata_token)
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            if let Some(record) = self.records.remove(&key) {
                debug!(
                    "reverting unresolvable redirection for {}",
                    record.method().display_name
                );
                record.revert();
            }
        }
    }

    /// Reverts and forgets any active redirection for this exact handle.
    fn revert_record(&mut self, handle: &MethodHandle) {
        if let Some(record) = self.records.remove(&handle.key()) {
            debug!(
                "reverting redirection for {}",
                record.method().display_name
            );
            record.revert();
        }
    }

    /// Drops all but the most recently applied entry per metadata token,
    /// preserving the order of the surviving entries.
    fn dedup_patched_methods(&mut self) {
        let mut seen = HashSet::new();
        let mut kept: Vec<MethodDescriptor> = self
            .patched_methods
            .drain(..)
            .rev()
            .filter(|method| seen.insert(method.metadata_token))
            .collect();
        kept.reverse();
        self.patched_methods = kept;
    }
}
