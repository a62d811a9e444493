//! # Compatibility
//!
//! The ABI gate consulted before any redirection is attempted.
//!
//! A false positive here corrupts memory: the replacement would be entered
//! with a stack layout its body does not expect. A false negative silently
//! skips a patch. The check therefore compares exactly what the calling
//! convention depends on: parameter count, structural parameter shapes
//! (including by-ref), and static/instance-ness.

use crate::runtime::{MethodAttrs, MethodHandle};

/// Decides whether redirecting `original`'s callers into `replacement` is
/// memory-safe.
pub fn are_compatible(original: &MethodHandle, replacement: &MethodHandle) -> bool {
    let a = original.sig();
    let b = replacement.sig();
    if a.is_static != b.is_static {
        return false;
    }
    if a.params.len() != b.params.len() {
        return false;
    }
    a.params
        .iter()
        .zip(&b.params)
        .all(|(x, y)| x.type_name == y.type_name && x.by_ref == y.by_ref)
}

/// Whether the method was compiled under a mode that forbids entry-point
/// redirection.
///
/// This is a distinct terminal condition from incompatibility: the method is
/// skipped with an informational log, not reported as a failure.
pub fn forbids_redirection(method: &MethodHandle) -> bool {
    method.attrs().contains(MethodAttrs::NO_REDIRECT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::MethodToken;
    use crate::runtime::{EntryPoint, MethodImage, MethodSig, ParamType};

    fn method(params: Vec<ParamType>, is_static: bool, attrs: MethodAttrs) -> MethodHandle {
        MethodHandle::new(MethodImage::new(
            MethodToken(1),
            "M",
            MethodSig { params, is_static },
            attrs,
            EntryPoint::Native(std::ptr::null_mut()),
        ))
    }

    #[test]
    fn same_shape_is_compatible() {
        let a = method(
            vec![
                ParamType::by_value("System.Int32"),
                ParamType::by_ref("System.String"),
            ],
            false,
            MethodAttrs::empty(),
        );
        let b = method(
            vec![
                ParamType::by_value("System.Int32"),
                ParamType::by_ref("System.String"),
            ],
            false,
            MethodAttrs::empty(),
        );
        assert!(are_compatible(&a, &b));
    }

    #[test]
    fn parameter_count_mismatch_is_incompatible() {
        let a = method(
            vec![ParamType::by_value("System.Int32")],
            true,
            MethodAttrs::empty(),
        );
        let b = method(Vec::new(), true, MethodAttrs::empty());
        assert!(!are_compatible(&a, &b));
    }

    #[test]
    fn by_ref_mismatch_is_incompatible() {
        let a = method(
            vec![ParamType::by_value("System.Int32")],
            true,
            MethodAttrs::empty(),
        );
        let b = method(
            vec![ParamType::by_ref("System.Int32")],
            true,
            MethodAttrs::empty(),
        );
        assert!(!are_compatible(&a, &b));
    }

    #[test]
    fn staticness_mismatch_is_incompatible() {
        let a = method(Vec::new(), true, MethodAttrs::empty());
        let b = method(Vec::new(), false, MethodAttrs::empty());
        assert!(!are_compatible(&a, &b));
    }

    #[test]
    fn no_redirect_is_flagged_separately() {
        let sealed = method(Vec::new(), true, MethodAttrs::NO_REDIRECT);
        let plain = method(Vec::new(), true, MethodAttrs::empty());
        assert!(forbids_redirection(&sealed));
        assert!(!forbids_redirection(&plain));
        // Structural compatibility is unaffected by the flag.
        assert!(are_compatible(&sealed, &plain));
    }
}
