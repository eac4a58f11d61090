use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Keyed cancellation tokens, one per in-flight unit of work.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the token for `key`, creating it when absent.
    pub fn create(&self, key: &str) -> CancellationToken {
        self.tokens
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<CancellationToken> {
        self.tokens.lock().get(key).cloned()
    }

    pub fn cancel(&self, key: &str) -> bool {
        match self.tokens.lock().get(key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let tokens = self.tokens.lock();
        for token in tokens.values() {
            token.cancel();
        }
        tokens.len()
    }

    pub fn remove(&self, key: &str) -> Option<CancellationToken> {
        self.tokens.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_reaches_previously_issued_tokens() {
        let registry = CancellationRegistry::new();
        let token = registry.create("run_1");
        let same = registry.create("run_1");

        assert!(registry.cancel("run_1"));
        assert!(token.is_cancelled());
        assert!(same.is_cancelled());
        assert!(!registry.cancel("run_2"));
    }

    #[test]
    fn remove_forgets_the_key() {
        let registry = CancellationRegistry::new();
        registry.create("a");
        registry.create("b");
        assert_eq!(registry.len(), 2);
        assert!(registry.remove("a").is_some());
        assert!(registry.get("a").is_none());
        assert_eq!(registry.cancel_all(), 1);
    }
}
