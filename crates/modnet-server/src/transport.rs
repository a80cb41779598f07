//! The TCP + UDP multicast transport.

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::lifecycle::{ServerTransport, Services};
use modnet_core::message::kinds;
use modnet_core::{ApplicationInfo, MessageRegistry, ModuleInfo, ProtocolMessage};
use modnet_transport::{
    ConnectionManager, MulticastBeacon, PeerExchanger, WorkerPool, handler_fn,
};
use std::sync::Arc;

/// Source of the applications this module takes part in.
pub trait ApplicationCatalog: Send + Sync {
    fn applications(&self) -> Vec<ApplicationInfo>;
}

/// A catalog for modules that run no applications.
#[derive(Debug, Default)]
pub struct NoApplications;

impl ApplicationCatalog for NoApplications {
    fn applications(&self) -> Vec<ApplicationInfo> {
        Vec::new()
    }
}

/// Listens on TCP, discovers over UDP multicast and gossips addresses.
pub struct TcpUdpTransport {
    registry: Arc<MessageRegistry>,
    catalog: Arc<dyn ApplicationCatalog>,
}

impl Default for TcpUdpTransport {
    fn default() -> Self {
        Self::new(Arc::new(MessageRegistry::default()))
    }
}

impl TcpUdpTransport {
    pub fn new(registry: Arc<MessageRegistry>) -> Self {
        Self {
            registry,
            catalog: Arc::new(NoApplications),
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn ApplicationCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }

    fn install_responders(&self, connections: &ConnectionManager, config: &ServerConfig) {
        let info = ModuleInfo {
            module_id: config.module_id,
            name: config.name.clone(),
            location: config.location.clone(),
        };
        connections.add_handler(
            kinds::REQUEST_MODULE_INFO,
            handler_fn(move |_, _| Ok(Some(ProtocolMessage::ModuleInfo(info.clone()).into()))),
        );

        let catalog = self.catalog.clone();
        connections.add_handler(
            kinds::REQUEST_APPLICATION_LIST,
            handler_fn(move |_, _| {
                Ok(Some(
                    ProtocolMessage::ApplicationList {
                        applications: catalog.applications(),
                    }
                    .into(),
                ))
            }),
        );
    }
}

impl ServerTransport for TcpUdpTransport {
    async fn initialize(&self, config: &ServerConfig) -> Result<Services, ServerError> {
        config.validate()?;
        let module = config.module_id;

        let connections = ConnectionManager::new(
            module,
            self.registry.clone(),
            config.connection_options(),
            WorkerPool::new(config.workers),
        );
        self.install_responders(&connections, config);
        let peers = PeerExchanger::new(connections.clone());
        peers.attach();

        let mut bound = Vec::with_capacity(config.listen.len());
        for addr in &config.listen {
            match connections.start_listening(*addr).await {
                Ok(local) => bound.push(local),
                Err(e) => {
                    connections.shutdown().await;
                    return Err(e.into());
                }
            }
        }
        let announce = config.announce_addresses(&bound);
        peers.add_module(module, announce.iter().copied());

        let beacon = MulticastBeacon::new(module, config.announce_interval(), WorkerPool::new(1));
        beacon.set_announce_addresses(announce.clone());
        beacon.add_listener(Arc::new(connections.clone()));
        for group in &config.multicast {
            if let Err(e) = beacon.add_group(*group).await {
                tokio::join!(connections.shutdown(), beacon.shutdown());
                return Err(e.into());
            }
        }

        tracing::info!(
            %module,
            listen = ?bound,
            announce = ?announce,
            groups = config.multicast.len(),
            "server initialized"
        );
        Ok(Services {
            connections,
            beacon,
            peers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::ServerManager;
    use modnet_core::{ApplicationId, Body, Envelope, ServerState};
    use std::net::SocketAddr;
    use std::time::{Duration, Instant};

    struct OneApp(ApplicationInfo);

    impl ApplicationCatalog for OneApp {
        fn applications(&self) -> Vec<ApplicationInfo> {
            vec![self.0.clone()]
        }
    }

    fn local_config(name: &str) -> ServerConfig {
        ServerConfig {
            name: Some(name.into()),
            listen: vec!["127.0.0.1:0".parse().unwrap()],
            multicast: Vec::new(),
            workers: 1,
            ..ServerConfig::default()
        }
    }

    async fn started(transport: TcpUdpTransport, config: ServerConfig) -> (ServerManager<TcpUdpTransport>, Services) {
        let manager = ServerManager::new(transport);
        manager.start_server(config).unwrap().await.unwrap().unwrap();
        let services = manager.services().unwrap();
        (manager, services)
    }

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn answers_protocol_queries() {
        let app = ApplicationInfo::new(ApplicationId::random(), "lights");
        let (ma, a) = started(
            TcpUdpTransport::default().with_catalog(Arc::new(OneApp(app.clone()))),
            local_config("a"),
        )
        .await;
        let (mb, b) = started(TcpUdpTransport::default(), local_config("b")).await;

        let addr = a.connections.listening_addresses()[0];
        b.connections.connect(addr).await.unwrap();
        let a_id = a.connections.module_id();
        eventually("connection", || b.connections.is_connected(a_id)).await;

        let info = b
            .connections
            .ask(a_id, Envelope::new(ProtocolMessage::RequestModuleInfo))
            .await
            .unwrap();
        match info.body {
            Body::Protocol(ProtocolMessage::ModuleInfo(info)) => {
                assert_eq!(info.module_id, a_id);
                assert_eq!(info.name.as_deref(), Some("a"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let list = b
            .connections
            .ask(a_id, Envelope::new(ProtocolMessage::RequestApplicationList))
            .await
            .unwrap();
        assert_eq!(
            list.body,
            Body::Protocol(ProtocolMessage::ApplicationList {
                applications: vec![app]
            })
        );

        ma.shutdown_server().unwrap().await.unwrap().unwrap();
        mb.shutdown_server().unwrap().await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn peers_learn_each_others_addresses() {
        let (ma, a) = started(TcpUdpTransport::default(), local_config("a")).await;
        let (mb, b) = started(TcpUdpTransport::default(), local_config("b")).await;
        let a_addr = a.connections.listening_addresses()[0];
        let b_addr = b.connections.listening_addresses()[0];
        b.connections.connect(a_addr).await.unwrap();

        let a_id = a.connections.module_id();
        let b_id = b.connections.module_id();
        eventually("gossip", || {
            a.peers.addresses(b_id) == Some([b_addr].into())
                && b.peers.addresses(a_id) == Some([a_addr].into())
        })
        .await;

        ma.shutdown_server().unwrap().await.unwrap().unwrap();
        mb.shutdown_server().unwrap().await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_bind_rolls_back_to_stopped() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = taken.local_addr().unwrap();
        let mut config = local_config("clash");
        config.listen = vec!["127.0.0.1:0".parse().unwrap(), addr];

        let manager = ServerManager::new(TcpUdpTransport::default());
        let result = manager.start_server(config).unwrap().await.unwrap();
        assert!(matches!(result, Err(ServerError::Establish(_))));
        assert_eq!(manager.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = local_config("bad");
        config.workers = 0;
        let manager = ServerManager::new(TcpUdpTransport::default());
        let result = manager.start_server(config).unwrap().await.unwrap();
        assert!(matches!(result, Err(ServerError::Config(_))));
        assert_eq!(manager.state(), ServerState::Stopped);
    }
}
