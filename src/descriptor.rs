//! # Descriptors
//!
//! Portable method identities that survive process and compilation boundaries.
//!
//! Descriptors are what the patch producer sends over the wire: enough
//! information to find a method again in a different process, where nothing
//! but the metadata token and the assembly name can be trusted, and the
//! token only approximately, since unrelated edits shift token allocation
//! between recompiles of the same module.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A metadata token locating a method within a compiled module.
///
/// The high byte encodes the metadata table and the low 24 bits the row
/// index. The engine's back-off search treats the token as a plain integer;
/// the table/row split exists for diagnostics only.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MethodToken(pub i32);

impl MethodToken {
    /// Creates a token from its raw value.
    pub fn new(value: i32) -> Self {
        MethodToken(value)
    }

    /// Returns the raw token value.
    pub fn value(&self) -> i32 {
        self.0
    }

    /// Extracts the metadata table from the token (high byte).
    pub fn table(&self) -> u8 {
        (self.0 as u32 >> 24) as u8
    }

    /// Extracts the row index from the token (low 24 bits).
    pub fn row(&self) -> u32 {
        self.0 as u32 & 0x00FF_FFFF
    }

    /// Returns the token shifted by `offset` rows.
    ///
    /// Token drift between recompiles is a small delta, so plain integer
    /// arithmetic is exactly what the back-off search needs.
    pub fn offset_by(&self, offset: i32) -> MethodToken {
        MethodToken(self.0.wrapping_add(offset))
    }
}

impl From<i32> for MethodToken {
    fn from(value: i32) -> Self {
        MethodToken(value)
    }
}

impl fmt::Display for MethodToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl fmt::Debug for MethodToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MethodToken(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

/// One generic type argument of a method descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeDescriptor {
    /// Fully qualified type name.
    pub name: String,
}

/// An immutable value identifying a method across process boundaries.
///
/// Two descriptors with the same [`MethodDescriptor::metadata_token`] are
/// treated as the same method for deduplication purposes, even if their names
/// differ. This coarse identity is intentional; see the engine's
/// duplicate-elimination pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodDescriptor {
    /// Simple name of the assembly containing the method.
    pub assembly_name: String,
    /// Human-readable name used in logs and UI.
    pub display_name: String,
    /// Bare method name without declaring type or signature.
    pub simple_name: String,
    /// Token of the method at the time the descriptor was produced. Unstable
    /// across recompiles when unrelated code shifts token allocation.
    pub metadata_token: MethodToken,
    /// Ordered generic type arguments, empty for non-generic methods.
    #[serde(default)]
    pub generic_type_arguments: Vec<TypeDescriptor>,
}

impl MethodDescriptor {
    /// Copy of this descriptor pointing at a different token.
    ///
    /// Used by the back-off search to probe neighbouring tokens without
    /// losing the rest of the identity.
    pub fn with_token(&self, token: MethodToken) -> Self {
        Self {
            metadata_token: token,
            ..self.clone()
        }
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.display_name, self.metadata_token)
    }
}
