//! Session registry
//!
//! Every open channel owns one [`Session`]: the upstream connection, the
//! control connection that opened it, the optional data binding and the
//! background tasks holding the upstream socket halves. Removing a session
//! from the registry drops it, and dropping it aborts those tasks, which
//! closes the upstream socket.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use wsp_proto::ChannelId;
use wsp_transport::TunnelSender;

use crate::upstream::UpstreamHandle;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown channel: {0}")]
    UnknownChannel(ChannelId),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Traffic counters updated by the upstream tasks
#[derive(Debug, Default)]
pub struct SessionStats {
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    frames_forwarded: AtomicU64,
    frames_dropped: AtomicU64,
}

impl SessionStats {
    pub fn add_bytes_up(&self, n: usize) {
        self.bytes_up.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_bytes_down(&self, n: usize) {
        self.bytes_down.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn frame_forwarded(&self) {
        self.frames_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Bytes written to the upstream
    pub bytes_up: u64,
    /// Bytes read from the upstream
    pub bytes_down: u64,
    pub frames_forwarded: u64,
    pub frames_dropped: u64,
}

/// Point-in-time view of a session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub channel: ChannelId,
    pub target: String,
    pub upstream_addr: SocketAddr,
    pub control_connection: String,
    pub data_connection: Option<String>,
    pub last_seq: Option<String>,
    pub stats: StatsSnapshot,
    pub age: Duration,
}

struct Session {
    channel: ChannelId,
    target: String,
    upstream: UpstreamHandle,
    control: TunnelSender,
    data: Option<TunnelSender>,
    last_seq: Option<String>,
    stats: Arc<SessionStats>,
    tasks: Vec<JoinHandle<()>>,
    opened_at: Instant,
}

impl Session {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            channel: self.channel,
            target: self.target.clone(),
            upstream_addr: self.upstream.peer_addr(),
            control_connection: self.control.connection_id().to_string(),
            data_connection: self.data.as_ref().map(|d| d.connection_id().to_string()),
            last_seq: self.last_seq.clone(),
            stats: self.stats.snapshot(),
            age: self.opened_at.elapsed(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Channel table shared by every handler
pub struct SessionRegistry {
    sessions: DashMap<ChannelId, Session>,
    next_channel: AtomicU32,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_channel: AtomicU32::new(0),
        }
    }

    /// Record an established upstream and allocate its channel id
    pub fn open(
        &self,
        target: String,
        upstream: UpstreamHandle,
        control: TunnelSender,
    ) -> ChannelId {
        let channel = self.next_channel.fetch_add(1, Ordering::Relaxed);
        let session = Session {
            channel,
            target,
            upstream,
            control,
            data: None,
            last_seq: None,
            stats: Arc::new(SessionStats::default()),
            tasks: Vec::new(),
            opened_at: Instant::now(),
        };
        self.sessions.insert(channel, session);
        debug!(channel, "Channel registered");
        channel
    }

    /// Bind a data connection, returning the binding it replaced
    pub fn bind(
        &self,
        channel: ChannelId,
        data: TunnelSender,
    ) -> RegistryResult<Option<TunnelSender>> {
        let mut session = self
            .sessions
            .get_mut(&channel)
            .ok_or(RegistryError::UnknownChannel(channel))?;
        Ok(session.data.replace(data))
    }

    /// Remove the data binding if it still belongs to `connection_id`
    pub fn unbind(&self, channel: ChannelId, connection_id: &str) -> bool {
        match self.sessions.get_mut(&channel) {
            Some(mut session) => {
                let owned = session
                    .data
                    .as_ref()
                    .is_some_and(|d| d.connection_id() == connection_id);
                if owned {
                    session.data = None;
                }
                owned
            }
            None => false,
        }
    }

    pub fn record_sequence(&self, channel: ChannelId, seq: &str) -> RegistryResult<()> {
        let mut session = self
            .sessions
            .get_mut(&channel)
            .ok_or(RegistryError::UnknownChannel(channel))?;
        session.last_seq = Some(seq.to_string());
        Ok(())
    }

    pub fn last_sequence(&self, channel: ChannelId) -> RegistryResult<Option<String>> {
        self.with_session(channel, |s| s.last_seq.clone())
    }

    pub fn lookup(&self, channel: ChannelId) -> RegistryResult<SessionSnapshot> {
        self.with_session(channel, Session::snapshot)
    }

    pub fn contains(&self, channel: ChannelId) -> bool {
        self.sessions.contains_key(&channel)
    }

    pub fn upstream(&self, channel: ChannelId) -> RegistryResult<UpstreamHandle> {
        self.with_session(channel, |s| s.upstream.clone())
    }

    pub fn data_sender(&self, channel: ChannelId) -> RegistryResult<Option<TunnelSender>> {
        self.with_session(channel, |s| s.data.clone())
    }

    pub fn stats(&self, channel: ChannelId) -> RegistryResult<Arc<SessionStats>> {
        self.with_session(channel, |s| s.stats.clone())
    }

    /// Tie a task's lifetime to the channel; an unknown channel aborts it
    pub fn attach_task(&self, channel: ChannelId, task: JoinHandle<()>) -> bool {
        match self.sessions.get_mut(&channel) {
            Some(mut session) => {
                session.tasks.push(task);
                true
            }
            None => {
                task.abort();
                false
            }
        }
    }

    /// Remove the session, releasing its upstream connection
    pub fn close(&self, channel: ChannelId) -> Option<SessionSnapshot> {
        let (_, session) = self.sessions.remove(&channel)?;
        let snapshot = session.snapshot();
        drop(session);

        info!(
            channel,
            target = %snapshot.target,
            upstream = %snapshot.upstream_addr,
            bytes_up = snapshot.stats.bytes_up,
            bytes_down = snapshot.stats.bytes_down,
            frames_forwarded = snapshot.stats.frames_forwarded,
            frames_dropped = snapshot.stats.frames_dropped,
            "Channel closed after {:?}",
            snapshot.age
        );
        Some(snapshot)
    }

    /// Close every session
    pub fn close_all(&self) -> usize {
        let channels = self.channels();
        channels
            .into_iter()
            .filter_map(|channel| self.close(channel))
            .count()
    }

    /// Control and data connections attached to any session
    pub fn peers(&self) -> Vec<TunnelSender> {
        self.sessions
            .iter()
            .flat_map(|session| {
                std::iter::once(session.control.clone()).chain(session.data.clone())
            })
            .collect()
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn with_session<T>(
        &self,
        channel: ChannelId,
        f: impl FnOnce(&Session) -> T,
    ) -> RegistryResult<T> {
        self.sessions
            .get(&channel)
            .map(|session| f(&session))
            .ok_or(RegistryError::UnknownChannel(channel))
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wsp_transport::{MemoryPeer, TunnelConnection, TunnelRole};

    fn addr() -> SocketAddr {
        "127.0.0.1:554".parse().unwrap()
    }

    fn connection(role: TunnelRole) -> (TunnelConnection, MemoryPeer) {
        TunnelConnection::in_memory(role, addr())
    }

    async fn wait_aborted(abort: &tokio::task::AbortHandle) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !abort.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    fn open(registry: &SessionRegistry) -> (ChannelId, TunnelConnection, MemoryPeer) {
        let (upstream, _rx) = UpstreamHandle::channel(addr(), 4);
        let (conn, peer) = connection(TunnelRole::Control);
        let channel = registry.open("camera:554".to_string(), upstream, conn.sender());
        (channel, conn, peer)
    }

    #[test]
    fn test_channel_ids_are_sequential() {
        let registry = SessionRegistry::new();
        let (first, _c1, _p1) = open(&registry);
        let (second, _c2, _p2) = open(&registry);
        assert_eq!(first, 0);
        assert_eq!(second, 1);

        registry.close(first);
        let (third, _c3, _p3) = open(&registry);
        assert_eq!(third, 2);
    }

    #[test]
    fn test_bind_unknown_channel_leaves_registry_untouched() {
        let registry = SessionRegistry::new();
        let (channel, _conn, _peer) = open(&registry);
        let (data, _data_peer) = connection(TunnelRole::Data);

        let err = registry.bind(99, data.sender()).unwrap_err();
        assert_eq!(err, RegistryError::UnknownChannel(99));
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(channel).unwrap().data_connection.is_none());
    }

    #[test]
    fn test_rebind_returns_previous() {
        let registry = SessionRegistry::new();
        let (channel, _conn, _peer) = open(&registry);
        let (first, _p1) = connection(TunnelRole::Data);
        let (second, _p2) = connection(TunnelRole::Data);

        assert!(registry.bind(channel, first.sender()).unwrap().is_none());
        let previous = registry.bind(channel, second.sender()).unwrap().unwrap();
        assert_eq!(previous.connection_id(), first.connection_id());
        assert_eq!(
            registry.lookup(channel).unwrap().data_connection.as_deref(),
            Some(second.connection_id())
        );
    }

    #[test]
    fn test_unbind_only_by_owner() {
        let registry = SessionRegistry::new();
        let (channel, _conn, _peer) = open(&registry);
        let (first, _p1) = connection(TunnelRole::Data);
        let (second, _p2) = connection(TunnelRole::Data);

        registry.bind(channel, first.sender()).unwrap();
        registry.bind(channel, second.sender()).unwrap();

        assert!(!registry.unbind(channel, first.connection_id()));
        assert!(registry.data_sender(channel).unwrap().is_some());
        assert!(registry.unbind(channel, second.connection_id()));
        assert!(registry.data_sender(channel).unwrap().is_none());
        assert!(!registry.unbind(42, second.connection_id()));
    }

    #[test]
    fn test_sequence_tracking() {
        let registry = SessionRegistry::new();
        let (channel, _conn, _peer) = open(&registry);

        assert_eq!(registry.last_sequence(channel).unwrap(), None);
        registry.record_sequence(channel, "3").unwrap();
        registry.record_sequence(channel, "4").unwrap();
        assert_eq!(registry.last_sequence(channel).unwrap().as_deref(), Some("4"));

        assert!(registry.record_sequence(7, "1").is_err());
        assert!(registry.last_sequence(7).is_err());
    }

    #[tokio::test]
    async fn test_close_aborts_attached_tasks() {
        let registry = SessionRegistry::new();
        let (channel, _conn, _peer) = open(&registry);

        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let abort = task.abort_handle();
        assert!(registry.attach_task(channel, task));

        let snapshot = registry.close(channel).unwrap();
        assert_eq!(snapshot.channel, channel);
        assert_eq!(snapshot.target, "camera:554");
        assert_eq!(snapshot.upstream_addr, addr());
        wait_aborted(&abort).await;
        assert!(registry.is_empty());
        assert!(registry.close(channel).is_none());
    }

    #[tokio::test]
    async fn test_attach_to_unknown_channel_aborts() {
        let registry = SessionRegistry::new();
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let abort = task.abort_handle();

        assert!(!registry.attach_task(5, task));
        wait_aborted(&abort).await;
    }

    #[test]
    fn test_stats_snapshot() {
        let registry = SessionRegistry::new();
        let (channel, _conn, _peer) = open(&registry);

        let stats = registry.stats(channel).unwrap();
        stats.add_bytes_up(10);
        stats.add_bytes_down(20);
        stats.frame_forwarded();
        stats.frame_dropped();
        stats.frame_dropped();

        let snapshot = registry.lookup(channel).unwrap().stats;
        assert_eq!(
            snapshot,
            StatsSnapshot {
                bytes_up: 10,
                bytes_down: 20,
                frames_forwarded: 1,
                frames_dropped: 2,
            }
        );
    }

    #[test]
    fn test_peers_lists_control_and_bound_data() {
        let registry = SessionRegistry::new();
        let (first, control, _p1) = open(&registry);
        let (_second, _c2, _p2) = open(&registry);
        let (data, _data_peer) = connection(TunnelRole::Data);
        registry.bind(first, data.sender()).unwrap();

        let peers: Vec<String> = registry
            .peers()
            .iter()
            .map(|peer| peer.connection_id().to_string())
            .collect();
        assert_eq!(peers.len(), 3);
        assert!(peers.iter().any(|id| id == control.connection_id()));
        assert!(peers.iter().any(|id| id == data.connection_id()));
    }

    #[test]
    fn test_close_all() {
        let registry = SessionRegistry::new();
        let _a = open(&registry);
        let _b = open(&registry);
        assert_eq!(registry.close_all(), 2);
        assert!(registry.is_empty());
    }
}
