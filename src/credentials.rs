use std::fmt;

use async_trait::async_trait;

use crate::ClientError;

/// Source of the `Authorization` header value.
///
/// Called before every attempt, including retries, so implementations
/// should cache tokens and refresh them when they are about to expire.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Returns the full header value, for example `Bearer <token>`.
    async fn authorization_header(&self) -> Result<String, ClientError>;
}

/// Static bearer token.
#[derive(Clone)]
pub struct Token {
    token: String,
}

impl Token {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

// Never print the token itself.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token").finish_non_exhaustive()
    }
}

#[async_trait]
impl CredentialProvider for Token {
    async fn authorization_header(&self) -> Result<String, ClientError> {
        if self.token.is_empty() {
            return Err(ClientError::Credentials("token is empty".to_owned()));
        }
        Ok(format!("Bearer {}", self.token))
    }
}
