//! Version strings for the coqpool binary.
//!
//! Release builds may set `COQPOOL_GIT_REV` at compile time to embed the git
//! revision they were built from.

use std::sync::LazyLock;

/// The package version from Cargo.toml.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Git revision baked in at build time (empty string if not set).
pub const GIT_REV: &str = match option_env!("COQPOOL_GIT_REV") {
    Some(rev) => rev,
    None => "",
};

static FULL_VERSION: LazyLock<String> = LazyLock::new(|| {
    if GIT_REV.is_empty() {
        PKG_VERSION.to_string()
    } else {
        format!("{} ({})", PKG_VERSION, GIT_REV)
    }
});

/// `"X.Y.Z (abcdef0)"` when built with a git revision, `"X.Y.Z"` otherwise.
///
/// Reported by `/health`.
pub fn full_version() -> String {
    FULL_VERSION.clone()
}

/// Version string for clap's `long_version`.
pub fn long_version() -> &'static str {
    FULL_VERSION.as_str()
}
