pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Short commit SHA, or `unknown` outside a git checkout
pub const GIT_SHA: &str = match option_env!("VERGEN_GIT_SHA") {
    Some(sha) => sha,
    None => "unknown",
};

pub const GIT_DIRTY: &str = match option_env!("VERGEN_GIT_DIRTY") {
    Some(dirty) => dirty,
    None => "false",
};

pub const RUSTC_VERSION: &str = env!("VERGEN_RUSTC_SEMVER");

pub const TARGET: &str = env!("VERGEN_CARGO_TARGET_TRIPLE");

/// `<version> (<sha>[ dirty])`
pub fn full_version() -> String {
    let dirty = if GIT_DIRTY == "true" { " dirty" } else { "" };
    format!("{VERSION} ({GIT_SHA}{dirty})")
}

/// Multi-line build report for `tether-agent version`
pub fn build_info() -> String {
    format!(
        "tether-agent {}\n\
         rustc:  {}\n\
         target: {}",
        full_version(),
        RUSTC_VERSION,
        TARGET
    )
}
