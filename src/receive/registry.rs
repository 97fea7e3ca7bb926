use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};

use super::listener::{Listener, ListenerError};
use crate::UniverseNumber;

/// Hands out the [Listener] for a universe, creating it on first use.
///
/// Listeners are shared: every consumer asking for the same universe gets
/// the same instance, and the listener is torn down when the last
/// reference is released. The registry also cross-dispatches unicast
/// datagrams that arrived on one listener's socket but belong to another
/// universe.
pub struct ListenerRegistry {
    interface: Ipv4Addr,
    listeners: Mutex<HashMap<UniverseNumber, Weak<Listener>>>,
}

impl ListenerRegistry {
    /// Creates a registry whose listeners bind `interface`.
    pub fn new(interface: Ipv4Addr) -> Arc<Self> {
        Arc::new(Self { interface, listeners: Mutex::new(HashMap::new()) })
    }

    /// Returns the listener for `universe`, starting one if none is live.
    pub fn get(self: &Arc<Self>, universe: UniverseNumber) -> Result<Arc<Listener>, ListenerError> {
        let mut listeners = self.listeners.lock().unwrap();

        if let Some(listener) = listeners.get(&universe).and_then(Weak::upgrade) {
            return Ok(listener);
        }

        let listener = Arc::new(Listener::start(universe, self.interface, Arc::downgrade(self))?);
        listeners.insert(universe, Arc::downgrade(&listener));
        listeners.retain(|_, weak| weak.strong_count() > 0);
        Ok(listener)
    }

    /// Returns the listener for `universe` only if one is currently live.
    pub fn existing(&self, universe: UniverseNumber) -> Option<Arc<Listener>> {
        self.listeners.lock().unwrap().get(&universe).and_then(Weak::upgrade)
    }

    /// The number of currently live listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().values().filter(|weak| weak.strong_count() > 0).count()
    }

    /// Offers a datagram for another universe to the listener owning it.
    pub(crate) fn dispatch(
        &self,
        universe: UniverseNumber,
        data: &[u8],
        receiver: SocketAddr,
        sender: SocketAddr,
    ) {
        match self.existing(universe) {
            Some(listener) => listener.forward_datagram(data, receiver, sender),
            None => log::trace!("no listener for universe {universe}, dropping forwarded datagram"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_has_no_listeners() {
        let registry = ListenerRegistry::new(Ipv4Addr::LOCALHOST);
        assert_eq!(registry.listener_count(), 0);
        assert!(registry.existing(1).is_none());
    }

    #[test]
    fn dispatch_without_a_listener_is_a_no_op() {
        let registry = ListenerRegistry::new(Ipv4Addr::LOCALHOST);
        let addr: SocketAddr = "127.0.0.1:5568".parse().unwrap();
        registry.dispatch(2, &[0u8; 16], addr, addr);
    }

    #[test]
    fn universe_zero_is_rejected() {
        let registry = ListenerRegistry::new(Ipv4Addr::LOCALHOST);
        let result = registry.get(0);
        assert!(matches!(result, Err(ListenerError::UniverseOutOfRange(0))));
    }
}
