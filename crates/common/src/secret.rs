//! Secret wrapper for sensitive values

use std::fmt;
use zeroize::Zeroize;

/// Sensitive value - redacted in Debug/Display/logs, zeroized on drop
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    /// Wrap a sensitive value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl From<String> for Secret<String> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_is_redacted() {
        let secret = Secret::new(String::from("gw-local-key"));
        let debug = format!("{:?}", secret);
        assert_eq!(debug, "[REDACTED]");
        assert!(!debug.contains("gw-local-key"));
    }

    #[test]
    fn display_is_redacted() {
        let secret = Secret::new(String::from("refresh-token-value"));
        assert_eq!(format!("{secret}"), "[REDACTED]");
    }

    #[test]
    fn expose_returns_inner() {
        let secret = Secret::new(String::from("gw-local-key"));
        assert_eq!(secret.expose(), "gw-local-key");
    }

    #[test]
    fn clone_is_independent() {
        let secret = Secret::new(String::from("value"));
        let cloned = secret.clone();
        drop(secret);
        assert_eq!(cloned.expose(), "value");
    }

    #[test]
    fn zeroizes_on_drop() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        #[derive(Clone)]
        struct Witness {
            zeroed: Arc<AtomicBool>,
        }

        impl Zeroize for Witness {
            fn zeroize(&mut self) {
                self.zeroed.store(true, Ordering::SeqCst);
            }
        }

        let zeroed = Arc::new(AtomicBool::new(false));
        let secret = Secret::new(Witness {
            zeroed: Arc::clone(&zeroed),
        });

        assert!(!zeroed.load(Ordering::SeqCst));
        drop(secret);
        assert!(zeroed.load(Ordering::SeqCst));
    }
}
