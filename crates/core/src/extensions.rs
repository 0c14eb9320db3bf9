//! Typed per-request storage slots.
//!
//! An `Extensions` is created with each [`Context`](crate::Context) and
//! dropped when request processing finishes. Interceptors use it to pass
//! values to handlers further down the pipeline.
//!
//! ```
//! use raffel_core::Extensions;
//!
//! let mut ext = Extensions::new();
//! ext.insert("tenant", "acme".to_owned());
//! assert_eq!(ext.get::<String>("tenant"), Some("acme".to_owned()));
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};

/// Keyed, typed storage attached to a request context.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<String, Box<dyn Any + Send + Sync>>,
}

fn type_key<T: 'static>() -> String {
    format!("{:?}", TypeId::of::<T>())
}

impl Extensions {
    /// Creates an empty `Extensions`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Store a value under its type.
    pub fn inject<V: Any + Send + Sync>(&mut self, value: V) -> &mut Self {
        self.map.insert(type_key::<V>(), Box::new(value));
        self
    }

    /// Clone out a value previously [`inject`](Self::inject)ed.
    #[must_use]
    pub fn obtain<T: Any + Send + Sync + Clone>(&self) -> Option<T> {
        self.get(&type_key::<T>())
    }

    /// Store a value under an explicit key.
    pub fn insert<K, V>(&mut self, key: K, value: V) -> &mut Self
    where
        K: Into<String>,
        V: Any + Send + Sync,
    {
        self.map.insert(key.into(), Box::new(value));
        self
    }

    /// Whether a value is stored under this key.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Clone out the value stored under this key, if the type matches.
    #[must_use]
    pub fn get<V: Any + Send + Sync + Clone>(&self, key: &str) -> Option<V> {
        self.map
            .get(key)
            .and_then(|value| value.downcast_ref::<V>())
            .cloned()
    }

    /// Remove and return the value stored under this key.
    pub fn remove<V: Any + Send + Sync>(&mut self, key: &str) -> Option<V> {
        let value = self.map.remove(key)?;
        match value.downcast::<V>() {
            Ok(v) => Some(*v),
            Err(value) => {
                // Type mismatch: put it back untouched.
                self.map.insert(key.to_owned(), value);
                None
            }
        }
    }

    /// Number of stored slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Debug for Extensions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("keys", &self.map.keys())
            .finish()
    }
}
