//! # Batches
//!
//! Units of work delivered by the patch producer.
//!
//! A [`PatchBatch`] is created by the external producer, enqueued into the
//! engine's pending list, consumed exactly once during an apply pass, then
//! moved to the append-only history list. It is never mutated after creation.

use serde::{Deserialize, Serialize};

use crate::descriptor::MethodDescriptor;

/// An immutable batch of method patches, delivered together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchBatch {
    /// Producer-assigned identifier, used to remove a pending batch.
    pub id: String,
    /// The patch units making up this batch.
    #[serde(default)]
    pub units: Vec<PatchUnit>,
    /// Failure and warning text reported by the producer, passed through to
    /// logs and UI verbatim.
    #[serde(default)]
    pub failures: Vec<String>,
}

impl PatchBatch {
    /// Total number of modified methods across all units.
    pub fn method_count(&self) -> usize {
        self.units.iter().map(|u| u.modified_methods.len()).sum()
    }
}

/// One replacement assembly and the method redirections it carries.
///
/// `modified_methods` and `patch_methods` are parallel lists of equal length:
/// index `i` of the first is redirected to index `i` of the second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchUnit {
    /// Producer-assigned identifier for this unit.
    pub id: String,
    /// Name of the compiled replacement assembly, resolvable by the host's
    /// assembly loader.
    pub patch_assembly: String,
    /// Brand-new methods introduced by this patch.
    #[serde(default)]
    pub new_methods: Vec<MethodDescriptor>,
    /// Original methods to redirect.
    #[serde(default)]
    pub modified_methods: Vec<MethodDescriptor>,
    /// Replacement methods inside `patch_assembly`, parallel to
    /// `modified_methods`.
    #[serde(default)]
    pub patch_methods: Vec<MethodDescriptor>,
}

impl PatchUnit {
    /// Pairs of (modified, replacement) descriptors in application order.
    pub fn method_pairs(&self) -> impl Iterator<Item = (&MethodDescriptor, &MethodDescriptor)> {
        self.modified_methods.iter().zip(self.patch_methods.iter())
    }

    /// Whether the two redirection lists line up.
    pub fn is_well_formed(&self) -> bool {
        self.modified_methods.len() == self.patch_methods.len()
    }
}
