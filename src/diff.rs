//! Article history patches
//!
//! Revisions store a unified diff against the previous content. Applying
//! the chain of patches in order from an empty document rebuilds any
//! revision.

use crate::error::AppError;

/// Produce a patch turning `old` into `new`.
pub fn make_diff(old: &str, new: &str) -> String {
    diffy::create_patch(old, new).to_string()
}

/// Apply a patch produced by [`make_diff`] to `base`.
pub fn apply_diff(base: &str, patch: &str) -> Result<String, AppError> {
    let patch = diffy::Patch::from_str(patch)
        .map_err(|e| AppError::Unprocessable(format!("malformed patch: {}", e)))?;
    diffy::apply(base, &patch)
        .map_err(|e| AppError::Unprocessable(format!("patch does not apply: {}", e)))
}

/// Rebuild content by replaying patches from an empty document.
pub fn replay<'a, I>(patches: I) -> Result<String, AppError>
where
    I: IntoIterator<Item = &'a str>,
{
    patches
        .into_iter()
        .try_fold(String::new(), |text, patch| apply_diff(&text, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_applies_to_its_base() {
        let old = "line one\nline two\n";
        let new = "line one\nline 2\nline three\n";
        let patch = make_diff(old, new);
        assert_eq!(apply_diff(old, &patch).unwrap(), new);
    }

    #[test]
    fn replay_rebuilds_latest_revision() {
        let v1 = "Rust\n";
        let v2 = "Rust is a language\n";
        let v3 = "Rust is a systems language\n";
        let patches = [make_diff("", v1), make_diff(v1, v2), make_diff(v2, v3)];
        let rebuilt = replay(patches.iter().map(String::as_str)).unwrap();
        assert_eq!(rebuilt, v3);
    }

    #[test]
    fn patch_against_wrong_base_is_rejected() {
        let patch = make_diff("alpha\n", "beta\n");
        let err = apply_diff("unrelated\n", &patch).unwrap_err();
        assert!(matches!(err, AppError::Unprocessable(_)));
    }
}
