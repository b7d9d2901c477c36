//! Process-wide shared objects, such as lookup tables or counters used by
//! output actions.
//!
//! Objects are created on first access by their construction function and live
//! until the process exits. They are never part of a checkpoint: a job
//! recovered from a checkpoint creates them anew on first access.
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::debug;

type Registry = Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>;

static REGISTRY: Lazy<Registry> = Lazy::new(Default::default);

/// The object registered under `name`, created with `init` if there is none.
///
/// `init` runs at most once per name and process and must not access the
/// registry itself. Fails if the object registered under `name` is not a `T`.
pub fn get_or_init<T: Send + Sync + 'static>(
    name: &str,
    init: impl FnOnce() -> T,
) -> Result<Arc<T>, RegistryError> {
    #[allow(clippy::unwrap_used)]
    let mut objects = REGISTRY.lock().unwrap();
    let object = objects
        .entry(name.to_string())
        .or_insert_with(|| {
            debug!(name, "Creating shared object");
            Arc::new(init())
        })
        .clone();
    object
        .downcast::<T>()
        .map_err(|_| RegistryError::TypeMismatch(name.to_string()))
}

/// A counter which only supports adding, shared between output actions
#[derive(Debug, Default)]
pub struct LongAccumulator {
    value: AtomicI64,
}

impl LongAccumulator {
    /// Create a counter starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `value` to the counter
    pub fn add(&self, value: i64) {
        self.value.fetch_add(value, Ordering::Relaxed);
    }

    /// Current value
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Set the counter back to zero
    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Shared object \"{0}\" has a different type")]
    TypeMismatch(String),
}
