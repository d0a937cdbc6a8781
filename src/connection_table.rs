use crate::connection::AirhookConnection;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

/// A spawned task that signals the end point when a connection's send delay expired
pub struct PendingTimer {
    pub id: u64,
    pub handle: JoinHandle<()>,
}

pub struct PeerState<C> {
    pub connection: C,
    pub timer: Option<PendingTimer>,
    created: Instant,
}

impl<C: AirhookConnection> PeerState<C> {
    fn new(connection: C, created: Instant) -> PeerState<C> {
        PeerState {
            connection,
            timer: None,
            created,
        }
    }

    fn last_activity(&self) -> Instant {
        self.connection.last_activity()
            .unwrap_or(self.created)
            .max(self.created)
    }
}

impl<C> Drop for PeerState<C> {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }
}

/// Per-peer connections, bounded both in number and in how long they may stay idle
pub struct ConnectionTable<C> {
    entries: FxHashMap<SocketAddr, PeerState<C>>,
    max_connections: usize,
    idle_timeout: Duration,
}

impl<C: AirhookConnection> ConnectionTable<C> {
    pub fn new(max_connections: usize, idle_timeout: Duration) -> ConnectionTable<C> {
        ConnectionTable {
            entries: FxHashMap::default(),
            max_connections,
            idle_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.entries.contains_key(addr)
    }

    pub fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut PeerState<C>> {
        self.entries.get_mut(addr)
    }

    pub fn remove(&mut self, addr: &SocketAddr) -> Option<PeerState<C>> {
        self.entries.remove(addr)
    }

    /// Returns the state for `addr`, creating a connection if there is none. If the table is
    ///  full, the least recently active connection is discarded to make room.
    pub fn get_or_create(&mut self, addr: SocketAddr, now: Instant, create: impl FnOnce() -> C) -> &mut PeerState<C> {
        self.make_room_for(&addr);
        self.entries.entry(addr)
            .or_insert_with(|| {
                debug!("initializing connection for {:?}", addr);
                PeerState::new(create(), now)
            })
    }

    /// Adds a connection that was created outside the table, replacing any previous connection
    ///  for `addr` and evicting the least recently active one if the table is full
    pub fn insert(&mut self, addr: SocketAddr, connection: C, now: Instant) -> &mut PeerState<C> {
        self.make_room_for(&addr);
        debug!("adding connection for {:?}", addr);
        match self.entries.entry(addr) {
            Entry::Occupied(mut entry) => {
                entry.insert(PeerState::new(connection, now));
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(PeerState::new(connection, now)),
        }
    }

    fn make_room_for(&mut self, addr: &SocketAddr) {
        if self.entries.contains_key(addr) || self.entries.len() < self.max_connections {
            return;
        }
        let oldest = self.entries.iter()
            .min_by_key(|(_, state)| state.last_activity())
            .map(|(addr, _)| *addr);
        if let Some(oldest) = oldest {
            debug!("connection table is full - discarding connection to {:?}", oldest);
            self.entries.remove(&oldest);
        }
    }

    /// Discard all connections that were idle for longer than the configured timeout, returning
    ///  their addresses
    pub fn sweep(&mut self, now: Instant) -> Vec<SocketAddr> {
        let idle_timeout = self.idle_timeout;
        let mut evicted = Vec::new();
        self.entries.retain(|addr, state| {
            let is_idle = now.saturating_duration_since(state.last_activity()) > idle_timeout;
            if is_idle {
                evicted.push(*addr);
            }
            !is_idle
        });
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AirhookConfig;
    use crate::connection::Connection;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn connection() -> Connection {
        Connection::new(&AirhookConfig::default_for(addr(1)))
    }

    #[test]
    fn test_get_or_create() {
        let now = Instant::now();
        let mut table = ConnectionTable::new(10, Duration::from_secs(5));
        let own_session_id = table.get_or_create(addr(1), now, connection).connection.own_session_id();
        assert_eq!(table.len(), 1);

        let again = table.get_or_create(addr(1), now, || panic!("should not be called"));
        assert_eq!(again.connection.own_session_id(), own_session_id);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_full_table_evicts_least_recently_active() {
        let now = Instant::now();
        let mut table = ConnectionTable::new(3, Duration::from_secs(100));
        table.get_or_create(addr(1), now + Duration::from_secs(2), connection);
        table.get_or_create(addr(2), now, connection);
        table.get_or_create(addr(3), now + Duration::from_secs(1), connection);

        // activity on a connection counts rather than its creation
        table.get_or_create(addr(2), now, connection)
            .connection.send_next(now + Duration::from_secs(3));

        table.get_or_create(addr(4), now + Duration::from_secs(4), connection);
        assert_eq!(table.len(), 3);
        assert!(table.contains(&addr(1)));
        assert!(table.contains(&addr(2)));
        assert!(!table.contains(&addr(3)));
        assert!(table.contains(&addr(4)));
    }

    #[test]
    fn test_insert_evicts_only_when_full() {
        let now = Instant::now();
        let mut table = ConnectionTable::new(2, Duration::from_secs(100));
        table.get_or_create(addr(1), now, connection);
        table.insert(addr(2), connection(), now + Duration::from_secs(1));
        assert_eq!(table.len(), 2);

        let session_id = table.insert(addr(2), connection(), now + Duration::from_secs(2))
            .connection.own_session_id();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get_mut(&addr(2)).unwrap().connection.own_session_id(), session_id);

        table.insert(addr(3), connection(), now + Duration::from_secs(3));
        assert_eq!(table.len(), 2);
        assert!(!table.contains(&addr(1)));
        assert!(table.contains(&addr(2)));
        assert!(table.contains(&addr(3)));
    }

    #[test]
    fn test_sweep() {
        let now = Instant::now();
        let mut table = ConnectionTable::new(10, Duration::from_secs(5));
        table.get_or_create(addr(1), now, connection);
        table.get_or_create(addr(2), now, connection)
            .connection.send_next(now + Duration::from_secs(3));

        assert!(table.sweep(now + Duration::from_secs(5)).is_empty());
        assert_eq!(table.sweep(now + Duration::from_secs(6)), vec![addr(1)]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.sweep(now + Duration::from_secs(9)), vec![addr(2)]);
        assert!(table.is_empty());
    }
}
