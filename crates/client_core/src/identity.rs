use std::sync::{PoisonError, RwLock};

/// Source of the signed-in user's id, supplied by the account flow.
pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> Option<String>;
}

#[derive(Debug, Default)]
pub struct Identity {
    user_id: RwLock<Option<String>>,
}

impl Identity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(user_id: impl Into<String>) -> Self {
        Self {
            user_id: RwLock::new(Some(user_id.into())),
        }
    }

    pub fn set_user_id(&self, user_id: Option<String>) {
        *self.user_id.write().unwrap_or_else(PoisonError::into_inner) = user_id;
    }
}

impl IdentityProvider for Identity {
    fn current_user_id(&self) -> Option<String> {
        self.user_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
