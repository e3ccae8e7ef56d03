//! Request-scoped account binding
//!
//! A request that has begun streaming must keep talking to the same
//! account when the auth manager is re-entered (a forced refresh after an
//! upstream 403, for instance). Each request task creates one binding and
//! passes it explicitly — no task-local ambient state.

use std::sync::Mutex;

/// Per-request slot holding the selected credential key.
#[derive(Debug, Default)]
pub struct RequestBinding {
    key: Mutex<Option<String>>,
}

impl RequestBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credential key of the account bound to this request, if any.
    pub fn key(&self) -> Option<String> {
        self.key.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Bind this request to an account.
    pub fn bind(&self, key: String) {
        *self.key.lock().unwrap_or_else(|e| e.into_inner()) = Some(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unbound() {
        assert!(RequestBinding::new().key().is_none());
    }

    #[test]
    fn bind_replaces_key() {
        let binding = RequestBinding::new();
        binding.bind("a".into());
        assert_eq!(binding.key().as_deref(), Some("a"));
        binding.bind("b".into());
        assert_eq!(binding.key().as_deref(), Some("b"));
    }
}
