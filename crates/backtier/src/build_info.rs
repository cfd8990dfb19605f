use serde::Serialize;

// ============================================================================
// Constants
// ============================================================================

pub const SERVICE_NAME: &str = "backtier";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = match option_env!("BUILD_COMMIT") {
    Some(c) => c,
    None => "unknown",
};
pub const BUILD_DATE: &str = match option_env!("BUILD_DATE") {
    Some(d) => d,
    None => "unknown",
};

/// Full version string including commit and build date.
pub fn version_string() -> String {
    format!("{VERSION} (commit: {COMMIT}, built: {BUILD_DATE})")
}

// ============================================================================
// BuildInfo
// ============================================================================

/// Build metadata served by `GET /version` and embedded in `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
    pub commit: &'static str,
    pub build_date: &'static str,
}

impl BuildInfo {
    #[must_use]
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME,
            version: VERSION,
            commit: COMMIT,
            build_date: BUILD_DATE,
        }
    }
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self::new()
    }
}
