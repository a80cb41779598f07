//! What we know about connected modules and the applications they run.
//!
//! Both directories follow the server: they attach to the connection
//! manager once the server is `RUNNING`, detach when it starts `STOPPING`
//! and forget everything once it is `STOPPED`. Register them with
//! [`ServerManager::add_listener`](crate::ServerManager::add_listener).

use crate::lifecycle::{ServerStateListener, Services};
use futures_util::future::join_all;
use modnet_core::{
    ApplicationId, ApplicationInfo, Body, Envelope, ModuleId, ModuleInfo, ProtocolMessage,
    ServerState,
};
use modnet_transport::{ConnectionListener, ConnectionManager, ListenerSet};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::{Arc, Weak};

/// Notified as modules come, describe themselves and go.
///
/// Called with the directory's lock held; implementations must not call
/// back into the directory.
pub trait ModuleDirectoryListener: Send + Sync {
    fn module_added(&self, info: &ModuleInfo);
    fn module_updated(&self, info: &ModuleInfo);
    fn module_removed(&self, module: ModuleId);
}

#[derive(Default)]
struct ModuleState {
    modules: BTreeMap<ModuleId, ModuleInfo>,
    connections: Option<ConnectionManager>,
}

/// The modules currently connected, with what they told us about themselves.
pub struct ModuleDirectory {
    this: Weak<ModuleDirectory>,
    state: Mutex<ModuleState>,
    listeners: ListenerSet<dyn ModuleDirectoryListener>,
}

impl ModuleDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            state: Mutex::new(ModuleState::default()),
            listeners: ListenerSet::new(),
        })
    }

    /// Track the modules of `connections`, starting with those connected now.
    pub fn attach(&self, connections: &ConnectionManager) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.state.lock().connections = Some(connections.clone());
        connections.add_connection_listener(this);
        self.update();
    }

    /// Stop tracking. Known modules are kept until [`clear`](Self::clear).
    pub fn detach(&self) {
        let Some(connections) = self.state.lock().connections.take() else {
            return;
        };
        if let Some(this) = self.this.upgrade() {
            let listener: Arc<dyn ConnectionListener> = this;
            connections.remove_connection_listener(&listener);
        }
    }

    /// Remove every module.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        for module in std::mem::take(&mut state.modules).into_keys() {
            self.listeners.notify(|l| l.module_removed(module));
        }
    }

    /// Rebuild from scratch: forget every module, then add and query each
    /// connected one again.
    pub fn update(&self) {
        let mut state = self.state.lock();
        let Some(connections) = state.connections.clone() else {
            return;
        };
        for module in std::mem::take(&mut state.modules).into_keys() {
            self.listeners.notify(|l| l.module_removed(module));
        }
        for module in connections.connected_modules() {
            self.add(&mut state, &connections, module);
        }
    }

    pub fn modules(&self) -> Vec<ModuleInfo> {
        self.state.lock().modules.values().cloned().collect()
    }

    pub fn get(&self, module: ModuleId) -> Option<ModuleInfo> {
        self.state.lock().modules.get(&module).cloned()
    }

    /// Subscribe. The listener is told about every known module right away.
    pub fn add_listener(&self, listener: Arc<dyn ModuleDirectoryListener>) -> bool {
        let state = self.state.lock();
        if !self.listeners.add(listener.clone()) {
            return false;
        }
        for info in state.modules.values() {
            listener.module_added(info);
        }
        true
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ModuleDirectoryListener>) -> bool {
        self.listeners.remove(listener)
    }

    fn add(&self, state: &mut ModuleState, connections: &ConnectionManager, module: ModuleId) {
        let info = ModuleInfo::unresolved(module);
        self.listeners.notify(|l| l.module_added(&info));
        state.modules.insert(module, info);
        self.query(connections.clone(), module);
    }

    fn query(&self, connections: ConnectionManager, module: ModuleId) {
        let this = self.this.clone();
        tokio::spawn(async move {
            let request = Envelope::new(ProtocolMessage::RequestModuleInfo);
            match connections.ask(module, request).await {
                Ok(reply) => match reply.body {
                    Body::Protocol(ProtocolMessage::ModuleInfo(info)) => {
                        if let Some(directory) = this.upgrade() {
                            directory.resolve(module, info);
                        }
                    }
                    other => tracing::warn!(%module, kind = other.kind(), "unexpected reply to module info request"),
                },
                Err(e) => tracing::debug!(%module, "module info request failed: {}", e),
            }
        });
    }

    fn resolve(&self, module: ModuleId, mut info: ModuleInfo) {
        info.module_id = module;
        let mut state = self.state.lock();
        let Some(entry) = state.modules.get_mut(&module) else {
            tracing::debug!(%module, "ignoring info for departed module");
            return;
        };
        *entry = info;
        let info = &*entry;
        self.listeners.notify(|l| l.module_updated(info));
    }
}

impl ConnectionListener for ModuleDirectory {
    fn connection_established(&self, module: ModuleId) {
        let mut state = self.state.lock();
        let Some(connections) = state.connections.clone() else {
            return;
        };
        if !state.modules.contains_key(&module) {
            self.add(&mut state, &connections, module);
        }
    }

    fn connection_closed(&self, module: ModuleId) {
        let mut state = self.state.lock();
        if state.modules.remove(&module).is_some() {
            self.listeners.notify(|l| l.module_removed(module));
        }
    }
}

impl ServerStateListener for ModuleDirectory {
    fn state_changed(&self, state: ServerState, services: Option<&Services>) {
        match (state, services) {
            (ServerState::Running, Some(services)) => self.attach(&services.connections),
            (ServerState::Stopping, _) => self.detach(),
            (ServerState::Stopped, _) => {
                self.detach();
                self.clear();
            }
            _ => {}
        }
    }
}

/// Notified when a directory update completes.
pub trait ApplicationDirectoryListener: Send + Sync {
    fn applications_resolved(&self, applications: &[ApplicationInfo]);
}

#[derive(Default)]
struct ApplicationState {
    applications: BTreeMap<ApplicationId, ApplicationInfo>,
    connections: Option<ConnectionManager>,
}

impl ApplicationState {
    fn list(&self) -> Vec<ApplicationInfo> {
        self.applications.values().cloned().collect()
    }
}

/// The applications running across all connected modules.
///
/// Only refreshed by [`update`](Self::update).
#[derive(Default)]
pub struct ApplicationDirectory {
    state: Mutex<ApplicationState>,
    listeners: ListenerSet<dyn ApplicationDirectoryListener>,
}

impl ApplicationDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, connections: &ConnectionManager) {
        self.state.lock().connections = Some(connections.clone());
    }

    pub fn detach(&self) {
        self.state.lock().connections = None;
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        if !state.applications.is_empty() {
            state.applications.clear();
            self.listeners.notify(|l| l.applications_resolved(&[]));
        }
    }

    pub fn applications(&self) -> Vec<ApplicationInfo> {
        self.state.lock().list()
    }

    pub fn get(&self, application: ApplicationId) -> Option<ApplicationInfo> {
        self.state.lock().applications.get(&application).cloned()
    }

    /// Ask every connected module for its applications and replace the
    /// directory with the merged answers. Modules that fail to answer are
    /// left out.
    pub async fn update(&self) -> Vec<ApplicationInfo> {
        let connections = self.state.lock().connections.clone();
        let Some(connections) = connections else {
            return self.applications();
        };

        let requests = connections.connected_modules().into_iter().map(|module| {
            let connections = connections.clone();
            async move {
                let request = Envelope::new(ProtocolMessage::RequestApplicationList);
                (module, connections.ask(module, request).await)
            }
        });

        let mut merged: BTreeMap<ApplicationId, ApplicationInfo> = BTreeMap::new();
        for (module, reply) in join_all(requests).await {
            let applications = match reply.map(|r| r.body) {
                Ok(Body::Protocol(ProtocolMessage::ApplicationList { applications })) => applications,
                Ok(other) => {
                    tracing::warn!(%module, kind = other.kind(), "unexpected reply to application list request");
                    continue;
                }
                Err(e) => {
                    tracing::debug!(%module, "application list request failed: {}", e);
                    continue;
                }
            };
            for app in applications {
                match merged.entry(app.id) {
                    Entry::Vacant(slot) => {
                        slot.insert(app);
                    }
                    Entry::Occupied(mut slot) => {
                        if let Some(combined) = slot.get().combine(&app) {
                            slot.insert(combined);
                        }
                    }
                }
            }
        }

        let mut state = self.state.lock();
        state.applications = merged;
        let list = state.list();
        tracing::debug!(applications = list.len(), "application directory updated");
        self.listeners.notify(|l| l.applications_resolved(&list));
        list
    }

    /// Subscribe. The listener gets the current list right away.
    pub fn add_listener(&self, listener: Arc<dyn ApplicationDirectoryListener>) -> bool {
        let state = self.state.lock();
        if !self.listeners.add(listener.clone()) {
            return false;
        }
        listener.applications_resolved(&state.list());
        true
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ApplicationDirectoryListener>) -> bool {
        self.listeners.remove(listener)
    }
}

impl ServerStateListener for ApplicationDirectory {
    fn state_changed(&self, state: ServerState, services: Option<&Services>) {
        match (state, services) {
            (ServerState::Running, Some(services)) => self.attach(&services.connections),
            (ServerState::Stopping, _) => self.detach(),
            (ServerState::Stopped, _) => {
                self.detach();
                self.clear();
            }
            _ => {}
        }
    }
}
