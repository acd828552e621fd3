// Per-connection server shadows.
//
// A shadow is the server's record of what one client last saw. It exists
// exactly as long as its connection is registered.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::rpc::ClientId;

#[derive(Default)]
pub struct ShadowMap {
    inner: RwLock<HashMap<ClientId, String>>,
}

impl ShadowMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shadow for a connection, creating it if needed.
    pub fn set(&self, id: ClientId, content: String) {
        self.write().insert(id, content);
    }

    /// Copy of a connection's shadow.
    pub fn get(&self, id: ClientId) -> Option<String> {
        self.read().get(&id).cloned()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.read().contains_key(&id)
    }

    /// Drop a connection's shadow. Returns whether one existed.
    pub fn remove(&self, id: ClientId) -> bool {
        self.write().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ClientId, String>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ClientId, String>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::ShadowMap;
    use crate::rpc::ClientId;

    #[test]
    fn shadow_lifecycle() {
        let shadows = ShadowMap::new();
        let id = ClientId::new();
        assert!(!shadows.contains(id));
        assert!(shadows.is_empty());

        shadows.set(id, "v1".to_owned());
        assert_eq!(shadows.get(id), Some("v1".to_owned()));
        assert_eq!(shadows.len(), 1);

        shadows.set(id, "v2".to_owned());
        assert_eq!(shadows.get(id), Some("v2".to_owned()));
        assert_eq!(shadows.len(), 1);

        assert!(shadows.remove(id));
        assert!(!shadows.remove(id));
        assert!(shadows.get(id).is_none());
    }

    #[test]
    fn shadows_are_independent_per_connection() {
        let shadows = ShadowMap::new();
        let a = ClientId::new();
        let b = ClientId::new();

        shadows.set(a, "for a".to_owned());
        shadows.set(b, "for b".to_owned());
        shadows.remove(a);

        assert!(shadows.get(a).is_none());
        assert_eq!(shadows.get(b), Some("for b".to_owned()));
    }
}
