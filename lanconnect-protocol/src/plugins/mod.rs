//! Plugin Architecture
//!
//! Plugins handle capability-tagged packets once a session is active.
//!
//! ## Capability Model
//!
//! A [`PluginFactory`] declares the capability tags its plugin handles. The
//! [`PluginRegistry`] maps every tag to exactly one factory, and builds a
//! [`PluginRouter`] once per session: each factory creates the handler for
//! that session, so stateful handlers (clipboard) are session-scoped while
//! stateless ones (ping) may hand out one shared instance.
//!
//! ## Handler Contract
//!
//! - [`Plugin::handle_packet`] reacts to an inbound packet with an optional
//!   reply
//! - unsolicited packets go through the session's outbound queue
//!   ([`PluginContext::outbound`])
//! - an error from a handler closes the session
//!
//! ```text
//! inbound packet ──▶ PluginRouter ──tag──▶ Plugin ──reply──▶ session writer
//!                                            │
//!                     background task ───────┴──outbound──▶ session writer
//! ```

pub mod clipboard;
pub mod ping;

use crate::{Packet, ProtocolError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sender half of a session's outbound queue
pub type OutboundSender = mpsc::Sender<Packet>;

/// Everything a factory needs to build a handler for one session
#[derive(Clone)]
pub struct PluginContext {
    /// Peer device id
    pub device_id: String,
    /// Session outbound queue, shared by all handlers of the session
    pub outbound: OutboundSender,
    /// Cancelled when the session closes
    pub cancel: CancellationToken,
}

/// Packet handler attached to a session
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Plugin name
    fn name(&self) -> &str;

    /// Called once when the session becomes active
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// React to an inbound packet whose tag this plugin registered
    async fn handle_packet(&self, packet: &Packet) -> Result<Option<Packet>>;
}

/// Creates plugin instances for sessions
pub trait PluginFactory: Send + Sync {
    /// Get the plugin name this factory creates
    fn name(&self) -> &str;

    /// Capability tags the plugin handles
    fn incoming_capabilities(&self) -> Vec<String>;

    /// Capability tags the plugin may send
    fn outgoing_capabilities(&self) -> Vec<String>;

    /// Create the handler for one session
    fn create(&self, context: &PluginContext) -> Result<Arc<dyn Plugin>>;
}

/// Registered plugin factories and their capability map
#[derive(Default)]
pub struct PluginRegistry {
    factories: Vec<Arc<dyn PluginFactory>>,

    /// Incoming capability → index into `factories`
    capability_map: HashMap<String, usize>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin factory
    ///
    /// # Errors
    ///
    /// Returns error if a factory with the same name is already registered or
    /// one of its capabilities is already handled by another factory.
    pub fn register_factory(&mut self, factory: Arc<dyn PluginFactory>) -> Result<()> {
        let name = factory.name().to_string();

        if self.factories.iter().any(|f| f.name() == name) {
            return Err(ProtocolError::Plugin(format!(
                "Plugin factory '{}' is already registered",
                name
            )));
        }

        let capabilities = factory.incoming_capabilities();
        for capability in &capabilities {
            if let Some(&existing) = self.capability_map.get(capability) {
                return Err(ProtocolError::Plugin(format!(
                    "Capability '{}' already handled by plugin '{}'",
                    capability,
                    self.factories[existing].name()
                )));
            }
        }

        let index = self.factories.len();
        for capability in capabilities {
            self.capability_map.insert(capability, index);
        }
        self.factories.push(factory);

        info!("Registered plugin factory: {}", name);
        Ok(())
    }

    /// Names of registered plugins
    pub fn list_plugins(&self) -> Vec<String> {
        self.factories.iter().map(|f| f.name().to_string()).collect()
    }

    /// All capability tags we can receive
    pub fn incoming_capabilities(&self) -> Vec<String> {
        let mut capabilities: Vec<String> = self.capability_map.keys().cloned().collect();
        capabilities.sort();
        capabilities
    }

    /// All capability tags we may send
    pub fn outgoing_capabilities(&self) -> Vec<String> {
        let mut capabilities: Vec<String> = self
            .factories
            .iter()
            .flat_map(|f| f.outgoing_capabilities())
            .collect();
        capabilities.sort();
        capabilities.dedup();
        capabilities
    }

    /// Check if a packet type is handled by some plugin
    pub fn supports_packet_type(&self, packet_type: &str) -> bool {
        self.capability_map.contains_key(packet_type)
    }

    /// Instantiate every plugin for one session
    pub fn create_router(&self, context: &PluginContext) -> Result<PluginRouter> {
        let plugins = self
            .factories
            .iter()
            .map(|factory| factory.create(context))
            .collect::<Result<Vec<_>>>()?;

        let handlers = self
            .capability_map
            .iter()
            .map(|(capability, &index)| (capability.clone(), plugins[index].clone()))
            .collect();

        debug!(
            "Created {} plugins for device {}",
            plugins.len(),
            context.device_id
        );

        Ok(PluginRouter {
            device_id: context.device_id.clone(),
            plugins,
            handlers,
        })
    }
}

/// Session-scoped dispatch table
pub struct PluginRouter {
    device_id: String,
    plugins: Vec<Arc<dyn Plugin>>,
    handlers: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRouter {
    /// Start every plugin
    pub async fn start(&self) -> Result<()> {
        for plugin in &self.plugins {
            plugin.start().await.map_err(|e| {
                ProtocolError::Plugin(format!("{} failed to start: {}", plugin.name(), e))
            })?;
        }
        Ok(())
    }

    /// Route an inbound packet to its handler
    ///
    /// Packets with an unknown tag are logged and dropped. Handler errors
    /// come back as [`ProtocolError::Plugin`].
    pub async fn dispatch(&self, packet: &Packet) -> Result<Option<Packet>> {
        let Some(plugin) = self.handlers.get(packet.packet_type()) else {
            debug!(
                "No plugin handles {} from {}, dropping",
                packet.packet_type(),
                self.device_id
            );
            return Ok(None);
        };

        debug!(
            "Routing packet {} to plugin {} for device {}",
            packet.packet_type(),
            plugin.name(),
            self.device_id
        );

        plugin.handle_packet(packet).await.map_err(|e| {
            warn!(
                "Plugin {} failed to handle {} from {}: {}",
                plugin.name(),
                packet.packet_type(),
                self.device_id,
                e
            );
            ProtocolError::Plugin(format!("{}: {}", plugin.name(), e))
        })
    }

    /// Number of plugins attached to the session
    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::ping::{PingBody, PingPluginFactory};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockPlugin {
        handled: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Plugin for MockPlugin {
        fn name(&self) -> &str {
            "mock"
        }

        async fn handle_packet(&self, _packet: &Packet) -> Result<Option<Packet>> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProtocolError::InvalidPacket("boom".to_string()));
            }
            Ok(None)
        }
    }

    struct MockFactory {
        name: &'static str,
        capability: &'static str,
        fail: bool,
        created: AtomicUsize,
    }

    impl MockFactory {
        fn new(name: &'static str, capability: &'static str) -> Self {
            Self {
                name,
                capability,
                fail: false,
                created: AtomicUsize::new(0),
            }
        }
    }

    impl PluginFactory for MockFactory {
        fn name(&self) -> &str {
            self.name
        }

        fn incoming_capabilities(&self) -> Vec<String> {
            vec![self.capability.to_string()]
        }

        fn outgoing_capabilities(&self) -> Vec<String> {
            vec![self.capability.to_string()]
        }

        fn create(&self, _context: &PluginContext) -> Result<Arc<dyn Plugin>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MockPlugin {
                handled: AtomicUsize::new(0),
                fail: self.fail,
            }))
        }
    }

    fn context() -> (PluginContext, mpsc::Receiver<Packet>) {
        let (outbound, rx) = mpsc::channel(8);
        (
            PluginContext {
                device_id: "peer".to_string(),
                outbound,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    fn mock_packet(packet_type: &str) -> Packet {
        Packet::from_bytes(
            format!(r#"{{"id":1,"type":"{}","body":{{}}}}"#, packet_type).as_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = PluginRegistry::new();
        registry
            .register_factory(Arc::new(MockFactory::new("a", "kdeconnect.a")))
            .unwrap();

        assert!(registry
            .register_factory(Arc::new(MockFactory::new("a", "kdeconnect.other")))
            .is_err());
        assert!(registry
            .register_factory(Arc::new(MockFactory::new("b", "kdeconnect.a")))
            .is_err());
        assert_eq!(registry.list_plugins(), vec!["a".to_string()]);
    }

    #[test]
    fn test_capability_aggregation() {
        let mut registry = PluginRegistry::new();
        registry.register_factory(Arc::new(PingPluginFactory::new())).unwrap();
        registry
            .register_factory(Arc::new(MockFactory::new("a", "kdeconnect.a")))
            .unwrap();

        assert_eq!(
            registry.incoming_capabilities(),
            vec!["kdeconnect.a".to_string(), "kdeconnect.ping".to_string()]
        );
        assert!(registry.supports_packet_type("kdeconnect.ping"));
        assert!(!registry.supports_packet_type("kdeconnect.battery"));
    }

    #[tokio::test]
    async fn test_router_per_session_instances() {
        let factory = Arc::new(MockFactory::new("a", "kdeconnect.a"));
        let mut registry = PluginRegistry::new();
        registry.register_factory(factory.clone()).unwrap();

        let (ctx, _rx) = context();
        let first = registry.create_router(&ctx).unwrap();
        let second = registry.create_router(&ctx).unwrap();

        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(first.plugin_count(), 1);
        assert_eq!(second.plugin_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_packet_type_dropped() {
        let mut registry = PluginRegistry::new();
        registry.register_factory(Arc::new(PingPluginFactory::new())).unwrap();
        let (ctx, _rx) = context();
        let router = registry.create_router(&ctx).unwrap();

        let reply = router.dispatch(&mock_packet("kdeconnect.battery")).await.unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_to_ping() {
        let mut registry = PluginRegistry::new();
        registry.register_factory(Arc::new(PingPluginFactory::new())).unwrap();
        let (ctx, _rx) = context();
        let router = registry.create_router(&ctx).unwrap();

        let reply = router
            .dispatch(&mock_packet("kdeconnect.ping"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.body_as::<PingBody>().unwrap(), PingBody::with_message("pong"));
    }

    #[tokio::test]
    async fn test_handler_failure_is_plugin_error() {
        let mut factory = MockFactory::new("a", "kdeconnect.a");
        factory.fail = true;
        let mut registry = PluginRegistry::new();
        registry.register_factory(Arc::new(factory)).unwrap();
        let (ctx, _rx) = context();
        let router = registry.create_router(&ctx).unwrap();

        let result = router.dispatch(&mock_packet("kdeconnect.a")).await;
        assert!(matches!(result, Err(ProtocolError::Plugin(_))));
    }
}
