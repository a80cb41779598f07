//! Starting and stopping a server as a whole.
//!
//! A [`ServerManager`] moves through `STOPPED -> STARTING -> RUNNING ->
//! STOPPING -> STOPPED`. Starting hands the configuration to a
//! [`ServerTransport`], which builds the [`Services`]; stopping hands them
//! back for teardown. A failed start falls back to `STOPPED` and a failed
//! stop to `RUNNING`, so either can be retried.

use crate::config::ServerConfig;
use crate::error::ServerError;
use modnet_core::ServerState;
use modnet_transport::{ConnectionManager, ListenerSet, MulticastBeacon, PeerExchanger};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// What a running server consists of.
#[derive(Debug, Clone)]
pub struct Services {
    pub connections: ConnectionManager,
    pub beacon: MulticastBeacon,
    pub peers: Arc<PeerExchanger>,
}

/// Builds and tears down the services of a server.
pub trait ServerTransport: Send + Sync + 'static {
    fn initialize(
        &self,
        config: &ServerConfig,
    ) -> impl Future<Output = Result<Services, ServerError>> + Send;

    /// Shut down the connection manager and the beacon concurrently.
    fn teardown(
        &self,
        services: &Services,
    ) -> impl Future<Output = Result<(), ServerError>> + Send {
        async move {
            tokio::join!(services.connections.shutdown(), services.beacon.shutdown());
            Ok(())
        }
    }
}

/// Notified on every state change.
///
/// Called with the manager's lock held, so notifications arrive in order;
/// implementations must not call back into the manager.
pub trait ServerStateListener: Send + Sync {
    /// `services` is set while starting has completed and stopping has not.
    fn state_changed(&self, state: ServerState, services: Option<&Services>);
}

enum Stage {
    Stopped,
    Starting,
    Running(Services),
    Stopping(Services),
}

impl Stage {
    fn state(&self) -> ServerState {
        match self {
            Stage::Stopped => ServerState::Stopped,
            Stage::Starting => ServerState::Starting,
            Stage::Running(_) => ServerState::Running,
            Stage::Stopping(_) => ServerState::Stopping,
        }
    }

    fn services(&self) -> Option<&Services> {
        match self {
            Stage::Running(services) | Stage::Stopping(services) => Some(services),
            Stage::Stopped | Stage::Starting => None,
        }
    }
}

struct Shared<T> {
    transport: T,
    stage: Mutex<Stage>,
    listeners: ListenerSet<dyn ServerStateListener>,
}

impl<T> Shared<T> {
    fn enter(&self, stage: &mut Stage, next: Stage) {
        debug_assert!(stage.state().can_become(next.state()));
        *stage = next;
        let state = stage.state();
        tracing::info!(%state, "server state changed");
        let services = stage.services();
        self.listeners.notify(|l| l.state_changed(state, services));
    }
}

/// Drives one server through its lifecycle.
///
/// Cheap to clone. Start and stop requests made in the wrong state are
/// ignored.
pub struct ServerManager<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ServerManager<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: ServerTransport> ServerManager<T> {
    pub fn new(transport: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                stage: Mutex::new(Stage::Stopped),
                listeners: ListenerSet::new(),
            }),
        }
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn state(&self) -> ServerState {
        self.shared.stage.lock().state()
    }

    /// The running services, if any.
    pub fn services(&self) -> Option<Services> {
        self.shared.stage.lock().services().cloned()
    }

    /// Subscribe to state changes. The listener is told the current state
    /// right away.
    pub fn add_listener(&self, listener: Arc<dyn ServerStateListener>) -> bool {
        let stage = self.shared.stage.lock();
        if !self.shared.listeners.add(listener.clone()) {
            return false;
        }
        listener.state_changed(stage.state(), stage.services());
        true
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ServerStateListener>) -> bool {
        self.shared.listeners.remove(listener)
    }

    /// Start the server unless it is already past `STOPPED`.
    ///
    /// Returns the task completing the start, or `None` if nothing was done.
    pub fn start_server(&self, config: ServerConfig) -> Option<JoinHandle<Result<(), ServerError>>> {
        {
            let mut stage = self.shared.stage.lock();
            if !matches!(*stage, Stage::Stopped) {
                tracing::debug!(state = %stage.state(), "ignoring start request");
                return None;
            }
            self.shared.enter(&mut stage, Stage::Starting);
        }

        let shared = self.shared.clone();
        Some(tokio::spawn(async move {
            let result = shared.transport.initialize(&config).await;
            let mut stage = shared.stage.lock();
            match result {
                Ok(services) => {
                    shared.enter(&mut stage, Stage::Running(services));
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(module = %config.module_id, "server failed to start: {}", e);
                    shared.enter(&mut stage, Stage::Stopped);
                    Err(e)
                }
            }
        }))
    }

    /// Stop the server unless it is not `RUNNING`.
    ///
    /// Returns the task completing the stop, or `None` if nothing was done.
    pub fn shutdown_server(&self) -> Option<JoinHandle<Result<(), ServerError>>> {
        let services = {
            let mut stage = self.shared.stage.lock();
            let Stage::Running(services) = &*stage else {
                tracing::debug!(state = %stage.state(), "ignoring shutdown request");
                return None;
            };
            let services = services.clone();
            self.shared.enter(&mut stage, Stage::Stopping(services.clone()));
            services
        };

        let shared = self.shared.clone();
        Some(tokio::spawn(async move {
            let result = shared.transport.teardown(&services).await;
            let mut stage = shared.stage.lock();
            match result {
                Ok(()) => {
                    shared.enter(&mut stage, Stage::Stopped);
                    Ok(())
                }
                Err(e) => {
                    tracing::error!("server failed to stop: {}", e);
                    shared.enter(&mut stage, Stage::Running(services));
                    Err(e)
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modnet_core::{MessageRegistry, ModuleId};
    use modnet_transport::{ConnectionOptions, WorkerPool};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn services() -> Services {
        let module = ModuleId::random();
        let connections = ConnectionManager::new(
            module,
            Arc::new(MessageRegistry::default()),
            ConnectionOptions::default(),
            WorkerPool::new(1),
        );
        Services {
            peers: PeerExchanger::new(connections.clone()),
            beacon: MulticastBeacon::new(module, Duration::from_secs(60), WorkerPool::new(1)),
            connections,
        }
    }

    #[derive(Default)]
    struct Fake {
        fail_start: AtomicBool,
        fail_stop: AtomicBool,
        // Each initialize call takes one permit; none are available unless added.
        gate: Option<Arc<Semaphore>>,
    }

    impl ServerTransport for Fake {
        async fn initialize(&self, _config: &ServerConfig) -> Result<Services, ServerError> {
            if let Some(gate) = &self.gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(ServerError::Teardown("no start".into()));
            }
            Ok(services())
        }

        async fn teardown(&self, _services: &Services) -> Result<(), ServerError> {
            if self.fail_stop.load(Ordering::SeqCst) {
                return Err(ServerError::Teardown("no stop".into()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Log(Mutex<Vec<(ServerState, bool)>>);

    impl ServerStateListener for Log {
        fn state_changed(&self, state: ServerState, services: Option<&Services>) {
            self.0.lock().push((state, services.is_some()));
        }
    }

    fn manager(fake: Fake) -> (ServerManager<Fake>, Arc<Log>) {
        let manager = ServerManager::new(fake);
        let log = Arc::new(Log::default());
        manager.add_listener(log.clone());
        (manager, log)
    }

    #[tokio::test]
    async fn full_cycle() {
        let (manager, log) = manager(Fake::default());
        manager.start_server(ServerConfig::default()).unwrap().await.unwrap().unwrap();
        assert_eq!(manager.state(), ServerState::Running);
        assert!(manager.services().is_some());

        manager.shutdown_server().unwrap().await.unwrap().unwrap();
        assert_eq!(manager.state(), ServerState::Stopped);
        assert!(manager.services().is_none());

        use ServerState::*;
        assert_eq!(
            *log.0.lock(),
            vec![
                (Stopped, false),
                (Starting, false),
                (Running, true),
                (Stopping, true),
                (Stopped, false),
            ]
        );
    }

    #[tokio::test]
    async fn panicking_listener_does_not_wedge_transitions() {
        struct PanicsWhileStarting;
        impl ServerStateListener for PanicsWhileStarting {
            fn state_changed(&self, state: ServerState, _: Option<&Services>) {
                if state == ServerState::Starting {
                    panic!("listener bug");
                }
            }
        }

        let (manager, log) = manager(Fake::default());
        manager.add_listener(Arc::new(PanicsWhileStarting));
        manager.start_server(ServerConfig::default()).unwrap().await.unwrap().unwrap();
        assert_eq!(manager.state(), ServerState::Running);
        assert_eq!(log.0.lock().last(), Some(&(ServerState::Running, true)));

        manager.shutdown_server().unwrap().await.unwrap().unwrap();
        assert_eq!(manager.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn requests_in_the_wrong_state_do_nothing() {
        let (manager, log) = manager(Fake::default());
        assert!(manager.shutdown_server().is_none());

        manager.start_server(ServerConfig::default()).unwrap().await.unwrap().unwrap();
        let before = log.0.lock().len();
        assert!(manager.start_server(ServerConfig::default()).is_none());
        assert_eq!(log.0.lock().len(), before);
    }

    #[tokio::test]
    async fn second_start_while_starting_is_ignored() {
        let gate = Arc::new(Semaphore::new(0));
        let (manager, log) = manager(Fake {
            gate: Some(gate.clone()),
            ..Fake::default()
        });
        let first = manager.start_server(ServerConfig::default()).unwrap();
        assert_eq!(manager.state(), ServerState::Starting);
        assert!(manager.start_server(ServerConfig::default()).is_none());
        assert!(manager.shutdown_server().is_none());

        gate.add_permits(1);
        first.await.unwrap().unwrap();
        assert_eq!(manager.state(), ServerState::Running);
        assert_eq!(log.0.lock().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_race_to_one() {
        let (manager, _) = manager(Fake::default());
        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.start_server(ServerConfig::default()) })
            })
            .collect();
        let mut started = Vec::new();
        for attempt in attempts {
            if let Some(handle) = attempt.await.unwrap() {
                started.push(handle);
            }
        }
        assert_eq!(started.len(), 1);
        for handle in started {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(manager.state(), ServerState::Running);
    }

    #[tokio::test]
    async fn failed_start_rolls_back() {
        let fake = Fake::default();
        fake.fail_start.store(true, Ordering::SeqCst);
        let (manager, log) = manager(fake);

        let result = manager.start_server(ServerConfig::default()).unwrap().await.unwrap();
        assert!(result.is_err());
        assert_eq!(manager.state(), ServerState::Stopped);
        assert_eq!(log.0.lock().last(), Some(&(ServerState::Stopped, false)));

        manager.transport().fail_start.store(false, Ordering::SeqCst);
        manager.start_server(ServerConfig::default()).unwrap().await.unwrap().unwrap();
        assert_eq!(manager.state(), ServerState::Running);
    }

    #[tokio::test]
    async fn failed_stop_rolls_back_and_can_be_retried() {
        let (manager, log) = manager(Fake::default());
        manager.start_server(ServerConfig::default()).unwrap().await.unwrap().unwrap();

        manager.transport().fail_stop.store(true, Ordering::SeqCst);
        assert!(manager.shutdown_server().unwrap().await.unwrap().is_err());
        assert_eq!(manager.state(), ServerState::Running);
        assert_eq!(log.0.lock().last(), Some(&(ServerState::Running, true)));

        manager.transport().fail_stop.store(false, Ordering::SeqCst);
        manager.shutdown_server().unwrap().await.unwrap().unwrap();
        assert_eq!(manager.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn late_listener_sees_current_state() {
        let (manager, _) = manager(Fake::default());
        manager.start_server(ServerConfig::default()).unwrap().await.unwrap().unwrap();

        let late = Arc::new(Log::default());
        let listener: Arc<dyn ServerStateListener> = late.clone();
        assert!(manager.add_listener(listener.clone()));
        assert!(!manager.add_listener(listener.clone()));
        assert_eq!(*late.0.lock(), vec![(ServerState::Running, true)]);

        assert!(manager.remove_listener(&listener));
        manager.shutdown_server().unwrap().await.unwrap().unwrap();
        assert_eq!(late.0.lock().len(), 1);
    }
}
