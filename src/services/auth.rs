use crate::database::DurableStore;
use std::sync::{Arc, RwLock};

/// Session key of the persisted bearer token
pub const AUTH_TOKEN_KEY: &str = "auth.token";

/// Bearer token lookup: the persisted token first, then the in-memory
/// session token.
#[derive(Clone, Default)]
pub struct AuthTokens {
    store: Option<DurableStore>,
    session: Arc<RwLock<Option<String>>>,
}

impl AuthTokens {
    pub fn new(store: Option<DurableStore>) -> Self {
        Self {
            store,
            session: Arc::new(RwLock::new(None)),
        }
    }

    /// Token kept only for the lifetime of the process
    pub fn set_session_token(&self, token: Option<String>) {
        if let Ok(mut guard) = self.session.write() {
            *guard = token.filter(|t| !t.is_empty());
        }
    }

    /// Persists the token so queued uploads can authenticate after a restart
    pub async fn remember(&self, token: &str) -> Result<(), crate::database::StoreError> {
        match &self.store {
            Some(store) => store.set_session_value(AUTH_TOKEN_KEY, token).await,
            None => {
                self.set_session_token(Some(token.to_string()));
                Ok(())
            }
        }
    }

    pub async fn forget(&self) {
        self.set_session_token(None);
        if let Some(store) = &self.store {
            if let Err(e) = store.remove_session_value(AUTH_TOKEN_KEY).await {
                log::warn!("Could not remove stored token: {}", e);
            }
        }
    }

    pub async fn token(&self) -> Option<String> {
        self.token_in(AUTH_TOKEN_KEY).await
    }

    /// Token persisted under `slot`. Only the default slot falls back to
    /// the in-memory session token.
    pub async fn token_in(&self, slot: &str) -> Option<String> {
        if let Some(store) = &self.store {
            match store.get_session_value(slot).await {
                Ok(Some(token)) if !token.is_empty() => return Some(token),
                Ok(_) => {}
                Err(e) => log::warn!("Token lookup in store failed: {}", e),
            }
        }
        if slot != AUTH_TOKEN_KEY {
            return None;
        }
        self.session.read().ok().and_then(|guard| guard.clone())
    }

    /// Name recorded with queued tasks instead of the token itself
    pub fn context_name(&self) -> &'static str {
        AUTH_TOKEN_KEY
    }
}
