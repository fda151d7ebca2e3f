//! Access and refresh credentials shared by every signing call.

use std::sync::{PoisonError, RwLock};

/// Bearer credentials for the signing service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Thread-safe holder of the current [`Credentials`].
///
/// The signing client swaps the access token in place after a refresh, so
/// every clone of the `Arc` sees the new token.
#[derive(Debug, Default)]
pub struct CredentialStore {
    inner: RwLock<Credentials>,
}

impl CredentialStore {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            inner: RwLock::new(credentials),
        }
    }

    /// Returns the current access token.
    pub fn access_token(&self) -> String {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .access_token
            .clone()
    }

    /// Returns the stored refresh token, if any.
    pub fn refresh_token(&self) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .refresh_token
            .clone()
    }

    /// Installs a new access token. A `None` refresh token keeps the old one.
    pub fn replace(&self, access_token: String, refresh_token: Option<String>) {
        let mut creds = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        creds.access_token = access_token;
        if let Some(refresh) = refresh_token {
            creds.refresh_token = Some(refresh);
        }
    }

    /// Returns a copy of the current credentials.
    pub fn snapshot(&self) -> Credentials {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
