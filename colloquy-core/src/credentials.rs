//! Credential-selection collaborator boundary.
//!
//! The engine never owns an API-key picker; when the transport reports an
//! authentication failure the session asks the host, once, to remediate.
//! Hosts implement [`CredentialSelector`] with whatever surface they have —
//! a dialog, a browser flow, a terminal prompt.

use async_trait::async_trait;

use crate::error::Result;

/// Host-side collaborator invoked on authentication failures.
#[async_trait]
pub trait CredentialSelector: Send + Sync + 'static {
    /// Whether a usable credential is currently available.
    fn has_credential(&self) -> bool;

    /// Ask the surrounding host to (re)select a credential. Called at most
    /// once per failure.
    async fn select_credential(&self) -> Result<()>;
}

/// Selector backed by an environment variable. `select_credential` cannot
/// open a picker, so it points the person at the variable instead.
pub struct EnvCredentialSelector {
    var: String,
}

impl EnvCredentialSelector {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    /// Current value of the backing variable, if set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.var)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

#[async_trait]
impl CredentialSelector for EnvCredentialSelector {
    fn has_credential(&self) -> bool {
        self.api_key().is_some()
    }

    async fn select_credential(&self) -> Result<()> {
        tracing::warn!(
            "no usable API key — set the {} environment variable and start a new session",
            self.var
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_selector_reflects_variable_presence() {
        let var = "COLLOQUY_TEST_CREDENTIAL_PRESENT";
        std::env::set_var(var, "key-123");
        assert!(EnvCredentialSelector::new(var).has_credential());
        assert_eq!(
            EnvCredentialSelector::new(var).api_key().as_deref(),
            Some("key-123")
        );
        std::env::remove_var(var);
    }

    #[test]
    fn blank_variable_counts_as_missing() {
        let var = "COLLOQUY_TEST_CREDENTIAL_BLANK";
        std::env::set_var(var, "   ");
        assert!(!EnvCredentialSelector::new(var).has_credential());
        std::env::remove_var(var);
    }
}
