use std::any::Any;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

type Item = Arc<dyn Any + Send + Sync>;

/// Opaque key/value bag attached to a session.
///
/// Filled by the connection validation hook (for example with the
/// authenticated identity) and handed to every later hook invocation for
/// the same session.
#[derive(Default)]
pub struct SessionItems {
    items: DashMap<String, Item>,
}

impl SessionItems {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.items.insert(key.into(), Arc::new(value));
    }

    /// Typed lookup; `None` when missing or stored with another type
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let item = self.items.get(key)?.value().clone();
        item.downcast::<T>().ok()
    }

    pub fn remove(&self, key: &str) -> bool {
        self.items.remove(key).is_some()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.items.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Replace the contents with another bag's entries
    pub fn replace_with(&self, other: &SessionItems) {
        self.items.clear();
        for entry in other.items.iter() {
            self.items.insert(entry.key().clone(), entry.value().clone());
        }
    }
}

impl fmt::Debug for SessionItems {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.keys()).finish()
    }
}
