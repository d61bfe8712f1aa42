//! Version information for slotproxy.

/// slotproxy version from Cargo.toml
pub const SLOTPROXY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported on the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VersionInfo {
    pub slotproxy: &'static str,
    /// Backend service the channels pay for, as `organization/service`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            slotproxy: SLOTPROXY_VERSION,
            service: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }
}
