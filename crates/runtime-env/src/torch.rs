//! Install specifiers for hardware-specific PyTorch builds.
//!
//! CUDA builds of torch are published under local version labels
//! (`torch==2.5.1+cu126`) on a per-tag index. The specifier is rebuilt on
//! every call since the tag may be overridden per call.

/// The package whose version the caller pins.
pub const PRIMARY_PACKAGE: &str = "torch";

/// Installed alongside the primary package, unpinned.
pub const COMPANION_PACKAGES: [&str; 2] = ["torchvision", "torchaudio"];

const INDEX_BASE_URL: &str = "https://download.pytorch.org/whl";

/// Index URL serving wheels built for `tag`.
pub fn index_url(tag: &str) -> String {
    format!("{INDEX_BASE_URL}/{tag}")
}

/// Whether `hint` starts with the primary package name as a whole word.
///
/// `torch==2.5` and `torch>=2` qualify, `torchvision==0.20` does not.
fn names_primary(hint: &str) -> bool {
    match hint.strip_prefix(PRIMARY_PACKAGE) {
        Some(rest) => !rest
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'),
        None => false,
    }
}

/// Build the specifier for the primary package.
///
/// - `"2.5.1"` -> `torch==2.5.1+<tag>`
/// - `"torch==2.5.1"` -> `torch==2.5.1+<tag>`
/// - `"torch==2.5.1+cu118"` -> unchanged
/// - `"2.5.1+cu118"` -> `torch==2.5.1+cu118`
/// - `"torch>=2"` -> unchanged
/// - `""` -> `torch`
pub fn primary_specifier(version_hint: Option<&str>, tag: &str) -> String {
    let hint = version_hint.map(str::trim).unwrap_or_default();
    if hint.is_empty() {
        return PRIMARY_PACKAGE.to_string();
    }

    if hint.contains('+') {
        return if names_primary(hint) {
            hint.to_string()
        } else {
            format!("{PRIMARY_PACKAGE}=={hint}")
        };
    }

    if names_primary(hint) {
        return if hint.contains("==") {
            format!("{hint}+{tag}")
        } else {
            hint.to_string()
        };
    }

    format!("{PRIMARY_PACKAGE}=={hint}+{tag}")
}

/// The full package set: the primary specifier followed by the companions.
pub fn package_set(version_hint: Option<&str>, tag: &str) -> Vec<String> {
    let mut packages = vec![primary_specifier(version_hint, tag)];
    packages.extend(COMPANION_PACKAGES.iter().map(|p| p.to_string()));
    packages
}
