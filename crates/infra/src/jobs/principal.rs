//! Source of the identity recorded on newly scheduled jobs.

/// Principal recorded when no request identity is available.
pub const SYSTEM_PRINCIPAL: &str = "System";

/// Supplies the name of whoever is scheduling a job right now.
pub trait PrincipalProvider: Send + Sync {
    fn principal_name(&self) -> String;
}

/// Always reports the same principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedPrincipal(String);

impl FixedPrincipal {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn system() -> Self {
        Self::new(SYSTEM_PRINCIPAL)
    }
}

impl Default for FixedPrincipal {
    fn default() -> Self {
        Self::system()
    }
}

impl PrincipalProvider for FixedPrincipal {
    fn principal_name(&self) -> String {
        self.0.clone()
    }
}
