//! Multicast discovery.
//!
//! A [`MulticastBeacon`] joins any number of IPv4 multicast groups. Every
//! interval it sends one [`Beacon`] datagram to each group, carrying this
//! module's id and the addresses it wants to be reached on. Every datagram
//! received on a group is decoded and handed to the [`BeaconListener`]s,
//! including our own beacons looped back by the network stack.

use crate::EstablishError;
use crate::establish::{self, Attachment, WorkerPool};
use crate::listeners::ListenerSet;
use crate::shutdown::Shutdown;
use futures_util::future::join_all;
use modnet_core::{Beacon, ModuleId, MulticastGroup};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Largest datagram we try to read.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Notified for every beacon received on any joined group.
pub trait BeaconListener: Send + Sync {
    fn beacon_found(&self, beacon: &Beacon);
}

struct GroupChannel {
    socket: Arc<UdpSocket>,
    attachment: Attachment,
    receiver: JoinHandle<()>,
}

struct Inner {
    module_id: ModuleId,
    pool: WorkerPool,
    announce: RwLock<Vec<SocketAddr>>,
    groups: Mutex<HashMap<MulticastGroup, GroupChannel>>,
    listeners: ListenerSet<dyn BeaconListener>,
    shutdown: Shutdown,
    sender: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        match Beacon::decode(data) {
            Ok(beacon) => {
                tracing::trace!(module = %beacon.module_id, %from, "beacon received");
                self.listeners.notify(|l| l.beacon_found(&beacon));
            }
            Err(e) => tracing::debug!(%from, "ignoring datagram: {}", e),
        }
    }

    async fn announce(&self) {
        let beacon = Beacon::new(self.module_id, self.announce.read().clone());
        let datagram = beacon.encode();
        let targets: Vec<(MulticastGroup, Arc<UdpSocket>)> = self
            .groups
            .lock()
            .iter()
            .map(|(group, channel)| (*group, channel.socket.clone()))
            .collect();
        for (group, socket) in targets {
            let to = SocketAddr::V4(group.group);
            if let Err(e) = socket.send_to(&datagram, to).await {
                tracing::warn!(%group, "failed to send beacon: {}", e);
            }
        }
    }
}

/// Sends and receives beacons on a set of multicast groups.
///
/// Cheap to clone. Call [`shutdown`](Self::shutdown) to leave every group.
#[derive(Clone)]
pub struct MulticastBeacon {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MulticastBeacon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MulticastBeacon")
            .field("module_id", &self.inner.module_id)
            .field("groups", &self.groups())
            .finish()
    }
}

impl MulticastBeacon {
    /// Start sending every `interval`. Nothing goes out until a group is added.
    pub fn new(module_id: ModuleId, interval: Duration, pool: WorkerPool) -> Self {
        let inner = Arc::new(Inner {
            module_id,
            pool,
            announce: RwLock::new(Vec::new()),
            groups: Mutex::new(HashMap::new()),
            listeners: ListenerSet::new(),
            shutdown: Shutdown::new(),
            sender: Mutex::new(None),
        });
        let sender = tokio::spawn(send_loop(Arc::downgrade(&inner), interval));
        *inner.sender.lock() = Some(sender);
        Self { inner }
    }

    pub fn module_id(&self) -> ModuleId {
        self.inner.module_id
    }

    /// Replace the addresses announced from the next beacon on.
    pub fn set_announce_addresses(&self, addresses: Vec<SocketAddr>) {
        *self.inner.announce.write() = addresses;
    }

    pub fn announce_addresses(&self) -> Vec<SocketAddr> {
        self.inner.announce.read().clone()
    }

    /// Bind and join `group`. Already joined groups are left as they are.
    pub async fn add_group(&self, group: MulticastGroup) -> Result<(), EstablishError> {
        if self.inner.groups.lock().contains_key(&group) {
            return Ok(());
        }
        let channel = establish::bind_multicast(&self.inner.pool, group).await?;
        let (socket, attachment) = channel.into_parts();
        let socket = Arc::new(socket);

        let surplus = {
            let mut groups = self.inner.groups.lock();
            if groups.contains_key(&group) || self.inner.shutdown.is_triggered() {
                Some(attachment)
            } else {
                let receiver = tokio::spawn(receive_loop(
                    Arc::downgrade(&self.inner),
                    socket.clone(),
                    group,
                ));
                groups.insert(
                    group,
                    GroupChannel {
                        socket,
                        attachment,
                        receiver,
                    },
                );
                None
            }
        };
        match surplus {
            Some(attachment) => attachment.close().await,
            None => tracing::info!(%group, "joined multicast group"),
        }
        Ok(())
    }

    /// Leave `group` and release its socket. Returns false if it was not joined.
    pub async fn remove_group(&self, group: MulticastGroup) -> bool {
        let Some(channel) = self.inner.groups.lock().remove(&group) else {
            return false;
        };
        leave(group, channel).await;
        true
    }

    pub fn groups(&self) -> Vec<MulticastGroup> {
        let mut groups: Vec<_> = self.inner.groups.lock().keys().copied().collect();
        groups.sort();
        groups
    }

    pub fn add_listener(&self, listener: Arc<dyn BeaconListener>) -> bool {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, listener: &Arc<dyn BeaconListener>) -> bool {
        self.inner.listeners.remove(listener)
    }

    /// Send one beacon to every group now, outside the regular interval.
    pub async fn announce_now(&self) {
        self.inner.announce().await;
    }

    /// Decode `data` as if it had arrived from `from` and notify listeners.
    pub fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        self.inner.handle_datagram(data, from);
    }

    /// Stop sending, leave every group and wait until all sockets are closed.
    pub async fn shutdown(&self) {
        self.inner.shutdown.trigger();
        self.inner.pool.close();
        if let Some(sender) = self.inner.sender.lock().take() {
            sender.abort();
        }
        let channels: Vec<_> = self.inner.groups.lock().drain().collect();
        let count = channels.len();
        join_all(
            channels
                .into_iter()
                .map(|(group, channel)| leave(group, channel)),
        )
        .await;
        self.inner.listeners.clear();
        tracing::info!(groups = count, "beacon stopped");
    }
}

async fn leave(group: MulticastGroup, channel: GroupChannel) {
    let GroupChannel {
        socket,
        attachment,
        receiver,
    } = channel;
    receiver.abort();
    let _ = receiver.await;

    let left = attachment
        .run(move || async move {
            let result = socket.leave_multicast_v4(*group.group.ip(), group.interface);
            drop(socket);
            result
        })
        .await;
    match left {
        Ok(Ok(())) => tracing::debug!(%group, "left multicast group"),
        Ok(Err(e)) => tracing::debug!(%group, "leaving multicast group failed: {}", e),
        Err(e) => tracing::debug!(%group, "leaving multicast group failed: {}", e),
    }
    attachment.close().await;
}

async fn send_loop(inner: Weak<Inner>, interval: Duration) {
    let mut signal = match inner.upgrade() {
        Some(inner) => inner.shutdown.signal(),
        None => return,
    };
    let mut ticks = tokio::time::interval(interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = signal.wait() => break,
            _ = ticks.tick() => {}
        }
        let Some(inner) = inner.upgrade() else { break };
        inner.announce().await;
    }
}

async fn receive_loop(inner: Weak<Inner>, socket: Arc<UdpSocket>, group: MulticastGroup) {
    let mut signal = match inner.upgrade() {
        Some(inner) => inner.shutdown.signal(),
        None => return,
    };
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = signal.wait() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        match received {
            Ok((len, from)) => {
                let Some(inner) = inner.upgrade() else { break };
                inner.handle_datagram(&buf[..len], from);
            }
            Err(e) => {
                tracing::debug!(%group, "receive failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[derive(Default)]
    struct Seen(Mutex<Vec<Beacon>>);

    impl BeaconListener for Seen {
        fn beacon_found(&self, beacon: &Beacon) {
            self.0.lock().push(beacon.clone());
        }
    }

    fn beacon() -> MulticastBeacon {
        MulticastBeacon::new(ModuleId::random(), Duration::from_secs(60), WorkerPool::new(1))
    }

    #[tokio::test]
    async fn datagrams_reach_listeners() {
        let b = beacon();
        let seen = Arc::new(Seen::default());
        b.add_listener(seen.clone());

        let other = Beacon::new(ModuleId::random(), vec!["10.0.0.1:5000".parse().unwrap()]);
        let from: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        b.handle_datagram(&other.encode(), from);
        b.handle_datagram(b"garbage", from);

        assert_eq!(*seen.0.lock(), vec![other]);
        b.shutdown().await;
    }

    #[tokio::test]
    async fn removed_listener_is_not_notified() {
        let b = beacon();
        let seen = Arc::new(Seen::default());
        let listener: Arc<dyn BeaconListener> = seen.clone();
        b.add_listener(listener.clone());
        assert!(b.remove_listener(&listener));

        let other = Beacon::new(ModuleId::random(), Vec::new());
        b.handle_datagram(&other.encode(), "10.0.0.1:1".parse().unwrap());
        assert!(seen.0.lock().is_empty());
        b.shutdown().await;
    }

    #[tokio::test]
    async fn non_multicast_group_is_rejected() {
        let b = beacon();
        let group = MulticastGroup::any_interface(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5000));
        assert!(matches!(
            b.add_group(group).await,
            Err(EstablishError::Join { .. })
        ));
        assert!(b.groups().is_empty());
        b.shutdown().await;
    }

    #[tokio::test]
    async fn groups_are_released_on_remove_and_shutdown() {
        let pool = WorkerPool::new(2);
        let b = MulticastBeacon::new(ModuleId::random(), Duration::from_secs(60), pool.clone());
        let first = MulticastGroup::new(Ipv4Addr::LOCALHOST, SocketAddrV4::new(Ipv4Addr::new(239, 255, 77, 2), 47002));
        let second = MulticastGroup::new(Ipv4Addr::LOCALHOST, SocketAddrV4::new(Ipv4Addr::new(239, 255, 77, 3), 47003));

        b.add_group(first).await.unwrap();
        b.add_group(second).await.unwrap();
        b.add_group(first).await.unwrap();
        assert_eq!(b.groups().len(), 2);
        assert_eq!(pool.open_channels(), 2);

        assert!(b.remove_group(first).await);
        assert_eq!(b.groups(), vec![second]);
        assert_eq!(pool.open_channels(), 1);

        b.shutdown().await;
        assert!(b.groups().is_empty());
        assert_eq!(pool.open_channels(), 0);
    }

    // Needs a network stack that loops multicast back to the sender.
    #[tokio::test]
    #[ignore]
    async fn hears_own_beacon_over_multicast() {
        let pool = WorkerPool::new(1);
        let b = MulticastBeacon::new(ModuleId::random(), Duration::from_millis(50), pool.clone());
        let seen = Arc::new(Seen::default());
        b.add_listener(seen.clone());
        b.set_announce_addresses(vec!["127.0.0.1:5000".parse().unwrap()]);

        let group = MulticastGroup::any_interface(SocketAddrV4::new(Ipv4Addr::new(239, 255, 77, 1), 47001));
        b.add_group(group).await.unwrap();
        assert_eq!(b.groups(), vec![group]);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while seen.0.lock().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "no beacon received");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(seen.0.lock()[0].module_id, b.module_id());

        assert!(b.remove_group(group).await);
        assert!(!b.remove_group(group).await);
        b.shutdown().await;
        assert_eq!(pool.open_channels(), 0);
    }
}
