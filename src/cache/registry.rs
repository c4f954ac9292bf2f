//! Mutex-guarded map reachable only through [`Registry::locked_do`].

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

/// A map that can only be accessed inside an exclusive section.
///
/// Check-then-act sequences must run inside a single `locked_do` call.
/// Keep the closures short: no network I/O and nothing that awaits.
#[derive(Debug)]
pub struct Registry<K, V> {
    map: Mutex<HashMap<K, V>>,
}

impl<K: Eq + Hash, V> Registry<K, V> {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` with exclusive access to the map and return its result.
    pub fn locked_do<T, E>(
        &self,
        f: impl FnOnce(&mut HashMap<K, V>) -> Result<T, E>,
    ) -> Result<T, E> {
        // A panic inside another section leaves the map itself consistent
        let mut map = self.map.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut map)
    }
}

impl<K: Eq + Hash, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
