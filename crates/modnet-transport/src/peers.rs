//! Address book gossip.
//!
//! Every module keeps an address book of all modules it has heard of. A new
//! connection is seeded with the whole book. A received book is merged by
//! set union and, only if that taught us something, forwarded to every other
//! connected module. Union is idempotent, so the flood stops once every
//! module knows everything.

use crate::connection::{ConnectionListener, ConnectionManager, Prepared};
use crate::dispatch::MessageHandler;
use modnet_core::message::kinds;
use modnet_core::{Body, Envelope, ModuleId, ProtocolMessage};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;

/// Known addresses of every module heard of.
pub type AddressBook = BTreeMap<ModuleId, BTreeSet<SocketAddr>>;

#[derive(Default)]
struct State {
    book: AddressBook,
    // Encoded `peers` message for `book`, rebuilt on demand after a change.
    snapshot: Option<Prepared>,
}

impl State {
    fn merge(&mut self, module: ModuleId, addresses: impl IntoIterator<Item = SocketAddr>) -> bool {
        let is_new = !self.book.contains_key(&module);
        let known = self.book.entry(module).or_default();
        let before = known.len();
        known.extend(addresses);
        let changed = is_new || known.len() != before;
        if changed {
            self.snapshot = None;
        }
        changed
    }
}

/// Gossips the address book over a [`ConnectionManager`].
pub struct PeerExchanger {
    connections: ConnectionManager,
    state: RwLock<State>,
}

impl std::fmt::Debug for PeerExchanger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerExchanger")
            .field("modules", &self.state.read().book.len())
            .finish()
    }
}

impl PeerExchanger {
    pub fn new(connections: ConnectionManager) -> Arc<Self> {
        Arc::new(Self {
            connections,
            state: RwLock::new(State::default()),
        })
    }

    /// Start gossiping: seed new connections and handle `peers` messages.
    pub fn attach(self: &Arc<Self>) {
        self.connections.add_connection_listener(self.clone());
        self.connections.add_handler(kinds::PEERS, self.clone());
    }

    pub fn detach(self: &Arc<Self>) {
        let listener: Arc<dyn ConnectionListener> = self.clone();
        self.connections.remove_connection_listener(&listener);
        self.connections.remove_handler(kinds::PEERS, None);
    }

    /// Record addresses for `module` and gossip them if they are new.
    pub fn add_module(&self, module: ModuleId, addresses: impl IntoIterator<Item = SocketAddr>) -> bool {
        let changed = self.state.write().merge(module, addresses);
        if changed {
            self.broadcast(None);
        }
        changed
    }

    /// Forget `module` locally. Removals are not gossiped.
    pub fn remove_module(&self, module: ModuleId) -> bool {
        let mut state = self.state.write();
        let removed = state.book.remove(&module).is_some();
        if removed {
            state.snapshot = None;
        }
        removed
    }

    /// Merge a book received from `remote`, forwarding it if anything changed.
    pub fn merge(&self, remote: Option<ModuleId>, book: AddressBook) -> bool {
        let changed = {
            let mut state = self.state.write();
            let mut changed = false;
            for (module, addresses) in book {
                changed |= state.merge(module, addresses);
            }
            changed
        };
        if changed {
            tracing::debug!(from = ?remote, "address book grew");
            self.broadcast(remote);
        }
        changed
    }

    pub fn address_book(&self) -> AddressBook {
        self.state.read().book.clone()
    }

    pub fn addresses(&self, module: ModuleId) -> Option<BTreeSet<SocketAddr>> {
        self.state.read().book.get(&module).cloned()
    }

    fn snapshot(&self) -> Option<Prepared> {
        if let Some(snapshot) = &self.state.read().snapshot {
            return Some(snapshot.clone());
        }
        let mut state = self.state.write();
        if let Some(snapshot) = &state.snapshot {
            return Some(snapshot.clone());
        }
        let message = Envelope::new(ProtocolMessage::Peers {
            modules: state.book.clone(),
        });
        match self.connections.prepare(&message) {
            Ok(prepared) => {
                state.snapshot = Some(prepared.clone());
                Some(prepared)
            }
            Err(e) => {
                tracing::warn!("failed to encode address book: {}", e);
                None
            }
        }
    }

    fn send_to(&self, module: ModuleId, snapshot: &Prepared) {
        if let Err(e) = self.connections.send_prepared(module, snapshot) {
            tracing::warn!(%module, "failed to send address book: {}", e);
        }
    }

    fn broadcast(&self, except: Option<ModuleId>) {
        let Some(snapshot) = self.snapshot() else {
            return;
        };
        for module in self.connections.connected_modules() {
            if Some(module) != except {
                self.send_to(module, &snapshot);
            }
        }
    }
}

impl ConnectionListener for PeerExchanger {
    fn connection_established(&self, module: ModuleId) {
        if let Some(snapshot) = self.snapshot() {
            self.send_to(module, &snapshot);
        }
    }

    fn connection_closed(&self, _module: ModuleId) {}
}

impl MessageHandler for PeerExchanger {
    fn handle(&self, remote: ModuleId, message: &Envelope) -> anyhow::Result<Option<Body>> {
        match message.body.as_protocol() {
            Some(ProtocolMessage::Peers { modules }) => {
                self.merge(Some(remote), modules.clone());
                Ok(None)
            }
            _ => anyhow::bail!("expected a peers message, got {}", message.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionOptions;
    use crate::dispatch::handler_fn;
    use crate::establish::WorkerPool;
    use modnet_core::MessageRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn manager() -> ConnectionManager {
        ConnectionManager::new(
            ModuleId::random(),
            Arc::new(MessageRegistry::default()),
            ConnectionOptions::default(),
            WorkerPool::new(1),
        )
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn link(listener: &ConnectionManager, dialer: &ConnectionManager) {
        let at = listener
            .start_listening("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        dialer.connect(at).await.unwrap();
        eventually("handshake", || {
            listener.is_connected(dialer.module_id()) && dialer.is_connected(listener.module_id())
        })
        .await;
    }

    fn counting(cm: &ConnectionManager) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        cm.add_handler(
            kinds::PEERS,
            handler_fn(move |_, _: &Envelope| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }),
        );
        count
    }

    #[tokio::test]
    async fn merge_reports_only_new_facts() {
        let px = PeerExchanger::new(manager());
        let m = ModuleId::random();
        let book: AddressBook = [(m, [addr(1)].into())].into();

        assert!(px.merge(None, book.clone()));
        assert!(!px.merge(None, book));
        assert!(px.add_module(m, [addr(2)]));
        assert!(!px.add_module(m, [addr(1), addr(2)]));
        assert_eq!(px.addresses(m), Some([addr(1), addr(2)].into()));

        assert!(px.remove_module(m));
        assert!(px.address_book().is_empty());
    }

    #[tokio::test]
    async fn snapshot_is_cached_until_change() {
        let px = PeerExchanger::new(manager());
        px.add_module(ModuleId::random(), [addr(1)]);
        let first = px.snapshot().unwrap();
        let again = px.snapshot().unwrap();
        assert!(Arc::ptr_eq(&first.text, &again.text));

        px.add_module(ModuleId::random(), [addr(2)]);
        let rebuilt = px.snapshot().unwrap();
        assert!(!Arc::ptr_eq(&first.text, &rebuilt.text));
        assert!(rebuilt.len() > first.len());
    }

    #[tokio::test]
    async fn line_topology_converges() {
        let (a, b, c) = (manager(), manager(), manager());
        let pa = PeerExchanger::new(a.clone());
        let pb = PeerExchanger::new(b.clone());
        let pc = PeerExchanger::new(c.clone());
        for px in [&pa, &pb, &pc] {
            px.attach();
        }
        pa.add_module(a.module_id(), [addr(1)]);
        pb.add_module(b.module_id(), [addr(2)]);
        pc.add_module(c.module_id(), [addr(3)]);

        link(&b, &a).await;
        link(&b, &c).await;

        let expected: AddressBook = [
            (a.module_id(), [addr(1)].into()),
            (b.module_id(), [addr(2)].into()),
            (c.module_id(), [addr(3)].into()),
        ]
        .into();
        eventually("convergence", || {
            [&pa, &pb, &pc].iter().all(|px| px.address_book() == expected)
        })
        .await;

        for cm in [&a, &b, &c] {
            cm.shutdown().await;
        }
    }

    #[tokio::test]
    async fn forwards_new_facts_to_everyone_but_the_sender() {
        let (a, b, c) = (manager(), manager(), manager());
        let pb = PeerExchanger::new(b.clone());
        pb.attach();
        pb.add_module(b.module_id(), [addr(2)]);
        let at_a = counting(&a);
        let at_c = counting(&c);

        link(&b, &a).await;
        link(&b, &c).await;
        // Each side is seeded once on connect.
        eventually("seeding", || {
            at_a.load(Ordering::SeqCst) == 1 && at_c.load(Ordering::SeqCst) == 1
        })
        .await;

        let fact = Envelope::new(ProtocolMessage::Peers {
            modules: [(ModuleId::random(), [addr(9)].into())].into(),
        });
        a.send(b.module_id(), &fact).unwrap();
        eventually("forward", || at_c.load(Ordering::SeqCst) == 2).await;

        // Same fact again: nothing new, nothing forwarded.
        a.send(b.module_id(), &fact).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(at_a.load(Ordering::SeqCst), 1);
        assert_eq!(at_c.load(Ordering::SeqCst), 2);
        assert_eq!(pb.address_book().len(), 2);

        for cm in [&a, &b, &c] {
            cm.shutdown().await;
        }
    }
}
