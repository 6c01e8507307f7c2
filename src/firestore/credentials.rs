use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::firestore::error::FirestoreResult;

/// The authenticated principal whose writes and caches are in use.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Key that namespaces the user's persisted mutation queue and overlays.
    pub fn storage_key(&self) -> &str {
        self.uid.as_deref().unwrap_or("")
    }
}

/// Bearer token as handed to the connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub user: User,
}

pub type UserChangeListener = Arc<dyn Fn(User) + Send + Sync>;

/// Source of the user identity and auth tokens for remote calls.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait CredentialsProvider: Send + Sync + 'static {
    /// Current token, or `None` for unauthenticated access.
    async fn get_token(&self) -> FirestoreResult<Option<Token>>;

    /// Drops the cached token so the next `get_token` fetches a fresh one.
    fn invalidate_token(&self);

    /// Registers the listener for user changes and returns the current user.
    fn set_change_listener(&self, listener: UserChangeListener) -> User;

    fn remove_change_listener(&self);
}

pub type CredentialsProviderArc = Arc<dyn CredentialsProvider>;

/// Provider for clients that never authenticate.
#[derive(Default, Clone)]
pub struct EmptyCredentialsProvider;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self) -> FirestoreResult<Option<Token>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}

    fn set_change_listener(&self, _listener: UserChangeListener) -> User {
        User::unauthenticated()
    }

    fn remove_change_listener(&self) {}
}

#[derive(Default)]
struct StaticCredentialsState {
    user: User,
    token: Option<String>,
    invalidations: usize,
    listener: Option<UserChangeListener>,
}

/// Provider holding a fixed token that can be swapped at runtime, e.g. to
/// simulate sign-in and sign-out.
#[derive(Default)]
pub struct StaticCredentialsProvider {
    state: Mutex<StaticCredentialsState>,
}

impl StaticCredentialsProvider {
    pub fn new(user: User, token: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(StaticCredentialsState {
                user,
                token,
                ..Default::default()
            }),
        })
    }

    /// Switches to `user` and notifies the registered listener.
    pub fn change_user(&self, user: User, token: Option<String>) {
        let listener = {
            let mut state = self.state();
            state.user = user.clone();
            state.token = token;
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener(user);
        }
    }

    pub fn invalidation_count(&self) -> usize {
        self.state().invalidations
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StaticCredentialsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl CredentialsProvider for StaticCredentialsProvider {
    async fn get_token(&self) -> FirestoreResult<Option<Token>> {
        let state = self.state();
        Ok(state.token.clone().map(|value| Token {
            value,
            user: state.user.clone(),
        }))
    }

    fn invalidate_token(&self) {
        self.state().invalidations += 1;
    }

    fn set_change_listener(&self, listener: UserChangeListener) -> User {
        let mut state = self.state();
        state.listener = Some(listener);
        state.user.clone()
    }

    fn remove_change_listener(&self) {
        self.state().listener = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_reports_user_changes() {
        let provider = StaticCredentialsProvider::new(User::new("alice"), Some("t1".into()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let initial = provider.set_change_listener(Arc::new(move |user| sink.lock().unwrap().push(user)));
        assert_eq!(initial.uid(), Some("alice"));

        provider.change_user(User::unauthenticated(), None);
        assert_eq!(seen.lock().unwrap().as_slice(), &[User::unauthenticated()]);
        assert!(provider.get_token().await.unwrap().is_none());

        provider.invalidate_token();
        assert_eq!(provider.invalidation_count(), 1);
    }

    #[test]
    fn storage_key_for_anonymous_user_is_empty() {
        assert_eq!(User::unauthenticated().storage_key(), "");
        assert_eq!(User::new("bob").storage_key(), "bob");
        assert!(!User::default().is_authenticated());
    }
}
