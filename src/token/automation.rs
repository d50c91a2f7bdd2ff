//! Contract with the credential-capture collaborator.
//!
//! First-time login and recovery run through a headless-browser flow that
//! lives outside this crate. The runtime only needs the shape of the
//! exchange: it hands over an authorization URL plus credentials and gets
//! back the redirect URL the flow landed on, which carries the authorization
//! code.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("login flow failed: {0}")]
    Flow(String),
    #[error("login flow requires phone verification")]
    PhoneVerify,
    #[error("login flow rejected the password")]
    PasswordError,
}

/// Input to one automated login attempt.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    /// Authorization URL the flow must open.
    pub auth_url: String,
    pub email: String,
    pub password: String,
    pub recovery_email: Option<String>,
    pub recovery_phone: Option<String>,
}

/// Result of a successful flow: the full redirect URL, query string included.
#[derive(Debug, Clone)]
pub struct LoginHandoff {
    pub redirect_url: String,
}

impl LoginHandoff {
    /// Authorization code carried in the redirect query string.
    pub fn authorization_code(&self) -> Option<String> {
        let (_, query) = self.redirect_url.split_once('?')?;
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == "code").then(|| value.to_string())
        })
    }
}

/// Drives the browser-automation flow. Implemented outside the core; tests
/// substitute a canned double.
#[async_trait]
pub trait CredentialAutomation: Send + Sync {
    async fn authorize(&self, request: LoginRequest) -> Result<LoginHandoff, AutomationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_authorization_code() {
        let handoff = LoginHandoff {
            redirect_url: "http://localhost:53100/?code=M.R3_ABC&state=xyz".to_string(),
        };
        assert_eq!(handoff.authorization_code().as_deref(), Some("M.R3_ABC"));
    }

    #[test]
    fn missing_code_yields_none() {
        let handoff = LoginHandoff {
            redirect_url: "http://localhost:53100/?error=access_denied".to_string(),
        };
        assert_eq!(handoff.authorization_code(), None);
    }
}
