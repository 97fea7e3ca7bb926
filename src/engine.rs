//! The engine handle.
//!
//! One [Engine] per application: it fixes the network interface and the
//! process CID, owns the listener registry and the transmit scheduler,
//! and hands out listeners and senders. Changing the interface at runtime
//! means dropping the engine (and everything obtained from it) and
//! constructing a new one.

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::iface::{self, InterfaceError};
use crate::receive::{Listener, ListenerError, ListenerRegistry};
use crate::send::{SenderConfig, SenderError, SentUniverse, StreamServer};
use crate::{ComponentIdentifier, UniverseNumber};

/// Error type returned when constructing an [Engine].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// An [InterfaceError] wrapper.
    #[error(transparent)]
    Interface(#[from] InterfaceError),

    /// A [SenderError] wrapper.
    #[error(transparent)]
    Sender(#[from] SenderError),
}

/// Configuration for an [Engine].
#[derive(Debug, Clone, Default)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    /// Network interface, by OS name. Ignored when `interface_address` is
    /// set; when both are `None` the first usable interface is picked.
    pub interface_name: Option<String>,
    /// Network interface, by IPv4 address.
    pub interface_address: Option<Ipv4Addr>,
    /// CID for this process; generated once when `None`.
    pub cid: Option<ComponentIdentifier>,
}

/// The sACN engine.
///
/// Owns the transmit scheduler and the listener registry; everything the
/// crate does is reached through this handle.
pub struct Engine {
    cid: ComponentIdentifier,
    interface: Ipv4Addr,
    registry: Arc<ListenerRegistry>,
    server: Arc<StreamServer>,
}

impl Engine {
    /// Creates a new [Engine], binding the transmit socket.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let interface = match (config.interface_address, &config.interface_name) {
            (Some(address), _) => address,
            (None, Some(name)) => iface::interface_by_name(name)?,
            (None, None) => iface::default_interface()?,
        };
        let cid = config.cid.unwrap_or_else(ComponentIdentifier::new_v4);

        log::info!("sACN engine on interface {interface} with CID {cid}");

        let registry = ListenerRegistry::new(interface);
        let server = StreamServer::start(interface)?;

        Ok(Self { cid, interface, registry, server })
    }

    /// The interface address all sockets bind.
    pub fn interface(&self) -> Ipv4Addr {
        self.interface
    }

    /// The CID every sender of this engine transmits under.
    pub fn cid(&self) -> ComponentIdentifier {
        self.cid
    }

    /// The listener registry, for consumers that manage listeners
    /// directly.
    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    /// The shared listener for a universe, creating it on first use.
    pub fn listener(&self, universe: UniverseNumber) -> Result<Arc<Listener>, ListenerError> {
        self.registry.get(universe)
    }

    /// A sender for a universe with default configuration and the engine's
    /// CID.
    pub fn sender(&self, universe: UniverseNumber) -> Result<SentUniverse, SenderError> {
        let config = SenderConfig { cid: self.cid, universe, ..SenderConfig::default() };
        self.sender_with_config(config)
    }

    /// A sender with explicit configuration.
    pub fn sender_with_config(&self, config: SenderConfig) -> Result<SentUniverse, SenderError> {
        SentUniverse::new(Arc::clone(&self.server), config)
    }

    /// Stops the transmit scheduler. Senders should be stopped first so
    /// their termination frames go out.
    pub fn shutdown(&self) {
        self.server.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        Engine::new(EngineConfig {
            interface_address: Some(Ipv4Addr::LOCALHOST),
            ..EngineConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn explicit_interface_address_is_used() {
        let engine = engine();
        assert_eq!(engine.interface(), Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn senders_inherit_the_engine_cid() {
        let engine = engine();
        let sender = engine.sender(1).unwrap();
        assert_eq!(sender.config().cid, engine.cid());
    }

    #[test]
    fn sender_for_universe_zero_is_rejected() {
        let engine = engine();
        assert!(engine.sender(0).is_err());
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = EngineConfig {
            interface_name: Some("en0".to_string()),
            interface_address: None,
            cid: Some(ComponentIdentifier::new_v4()),
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.interface_name.as_deref(), Some("en0"));
        assert_eq!(back.cid, config.cid);
    }
}
