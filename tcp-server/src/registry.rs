//! Watched descriptor registry.
//!
//! Slot 0 always holds the listening socket. Slots `1..len` hold accepted
//! connections, each owned by the registry until it is swap-removed. The
//! `pollfd` array is handed to `poll(2)` as is, so it stays contiguous;
//! `conns[i - 1]` owns the descriptor in `fds[i]`.
//!
//! Capacity is counted in entries (listener included), grows by a fixed
//! step only when the registry is full, and never shrinks.

use std::collections::TryReserveError;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

/// Slot of the listening socket.
pub(crate) const LISTENER_SLOT: usize = 0;

/// Why [`Registry::try_push`] refused a connection.
#[derive(Debug, thiserror::Error)]
pub(crate) enum PushRefused {
    #[error("connection limit of {0} reached")]
    LimitReached(usize),

    #[error("cannot grow registry: {0}")]
    OutOfMemory(#[from] TryReserveError),
}

/// Returned by [`Registry::try_push`]. The connection is handed back so the
/// caller decides how to close it.
#[derive(Debug)]
pub(crate) struct PushFailed<C> {
    pub conn: C,
    pub reason: PushRefused,
}

/// Whether a push had to reallocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pushed {
    InPlace,
    Grew { capacity: usize },
}

pub(crate) struct Registry<C> {
    fds: Vec<libc::pollfd>,
    conns: Vec<C>,
    capacity: usize,
    growth_step: usize,
    max_connections: usize,
}

fn watch(fd: RawFd) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }
}

impl<C: AsRawFd> Registry<C> {
    /// Create a registry watching `listener_fd` with room for `growth_step`
    /// entries.
    ///
    /// The initial allocation is infallible: running out of memory here
    /// aborts the process.
    pub fn new(listener_fd: RawFd, growth_step: usize) -> Self {
        let growth_step = growth_step.max(1);
        let mut fds = Vec::with_capacity(growth_step);
        fds.push(watch(listener_fd));
        Self {
            fds,
            conns: Vec::with_capacity(growth_step),
            capacity: growth_step,
            growth_step,
            max_connections: usize::MAX,
        }
    }

    /// Refuse connections beyond `max` (`None` for no limit).
    pub fn with_connection_limit(mut self, max: Option<usize>) -> Self {
        self.max_connections = max.unwrap_or(usize::MAX);
        self
    }

    /// Occupied slots, listener included.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    /// Accepted connections currently watched.
    pub fn connections(&self) -> usize {
        self.conns.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn growth_step(&self) -> usize {
        self.growth_step
    }

    /// Events reported for `slot` by the last [`Registry::wait`], or `None`
    /// past the end.
    pub fn revents(&self, slot: usize) -> Option<libc::c_short> {
        self.fds.get(slot).map(|p| p.revents)
    }

    #[cfg(test)]
    pub fn fd(&self, slot: usize) -> Option<RawFd> {
        self.fds.get(slot).map(|p| p.fd)
    }

    /// Accepted connections in slot order (slot 1 first).
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &C> {
        self.conns.iter()
    }

    /// Watch a new connection for read readiness.
    ///
    /// The entry starts with no reported events, so a scan in progress does
    /// not dispatch it until the next wait.
    pub fn try_push(&mut self, conn: C) -> Result<Pushed, PushFailed<C>> {
        if self.conns.len() >= self.max_connections {
            return Err(PushFailed {
                conn,
                reason: PushRefused::LimitReached(self.max_connections),
            });
        }
        let mut pushed = Pushed::InPlace;
        if self.fds.len() >= self.capacity {
            if let Err(e) = self.grow() {
                return Err(PushFailed {
                    conn,
                    reason: e.into(),
                });
            }
            pushed = Pushed::Grew {
                capacity: self.capacity,
            };
        }
        self.fds.push(watch(conn.as_raw_fd()));
        self.conns.push(conn);
        Ok(pushed)
    }

    fn grow(&mut self) -> Result<(), TryReserveError> {
        let target = self.capacity.saturating_add(self.growth_step);
        self.fds.try_reserve_exact(target - self.fds.len())?;
        self.conns
            .try_reserve_exact(target.saturating_sub(1) - self.conns.len())?;
        self.capacity = target;
        Ok(())
    }

    /// Remove the connection at `slot` by moving the last entry into it.
    ///
    /// The caller must re-examine `slot` afterwards: it now holds what was
    /// the last entry. The listener slot cannot be removed.
    pub fn swap_remove(&mut self, slot: usize) -> Option<C> {
        if slot == LISTENER_SLOT || slot >= self.fds.len() {
            return None;
        }
        self.fds.swap_remove(slot);
        Some(self.conns.swap_remove(slot - 1))
    }

    /// Close every watched connection, returning how many were open.
    pub fn close_all(&mut self) -> usize {
        let n = self.conns.len();
        self.conns.clear();
        self.fds.truncate(1);
        n
    }

    /// Block in `poll(2)` for at most `timeout` and return the number of
    /// entries with events. `revents` of every slot is overwritten.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<usize> {
        let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
        // SAFETY: fds is a valid, initialized pollfd array of the given length
        // and is not touched by anything else during the call.
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    fn pair() -> (UnixStream, UnixStream) {
        UnixStream::pair().unwrap()
    }

    /// Registry with a real socket standing in for the listener.
    fn registry(step: usize) -> (Registry<UnixStream>, UnixStream, UnixStream) {
        let (a, b) = pair();
        (Registry::new(a.as_raw_fd(), step), a, b)
    }

    fn fds(reg: &Registry<UnixStream>) -> Vec<RawFd> {
        (0..reg.len()).map(|i| reg.fd(i).unwrap()).collect()
    }

    #[test]
    fn starts_with_listener_only() {
        let (reg, listener, _peer) = registry(4);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.connections(), 0);
        assert_eq!(reg.capacity(), 4);
        assert_eq!(reg.fd(LISTENER_SLOT), Some(listener.as_raw_fd()));
    }

    #[test]
    fn connection_limit_refuses_and_returns_conn() {
        let (reg, _l, _p) = registry(8);
        let mut reg = reg.with_connection_limit(Some(2));
        let mut peers = Vec::new();
        for _ in 0..2 {
            let (conn, peer) = pair();
            peers.push(peer);
            reg.try_push(conn).unwrap();
        }

        let (extra, _extra_peer) = pair();
        let extra_fd = extra.as_raw_fd();
        let refused = reg.try_push(extra).unwrap_err();
        assert_eq!(refused.conn.as_raw_fd(), extra_fd);
        assert!(matches!(refused.reason, PushRefused::LimitReached(2)));
        assert_eq!(reg.connections(), 2);

        // Room frees up again after a removal.
        drop(reg.swap_remove(1));
        let (again, _again_peer) = pair();
        reg.try_push(again).unwrap();
        assert_eq!(reg.connections(), 2);
    }

    #[test]
    fn zero_growth_step_is_clamped() {
        let (reg, _l, _p) = registry(0);
        assert_eq!(reg.growth_step(), 1);
        assert_eq!(reg.capacity(), 1);
    }

    #[test]
    fn grows_exactly_when_full() {
        let (mut reg, _l, _p) = registry(3);
        let mut peers = Vec::new();
        let mut capacities = vec![reg.capacity()];

        for n in 1..=7 {
            let (conn, peer) = pair();
            peers.push(peer);
            let was_full = reg.len() == reg.capacity();
            let pushed = reg.try_push(conn).unwrap();
            assert_eq!(was_full, matches!(pushed, Pushed::Grew { .. }), "push {n}");
            assert!(reg.len() <= reg.capacity());
            capacities.push(reg.capacity());
        }

        // 1 listener + 7 connections with step 3: 3 -> 6 -> 9
        assert_eq!(reg.capacity(), 9);
        assert!(capacities.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn reallocation_keeps_entries_and_order() {
        let (mut reg, listener, _p) = registry(2);
        let mut expected = vec![listener.as_raw_fd()];
        let mut peers = Vec::new();

        for _ in 0..10 {
            let (conn, peer) = pair();
            expected.push(conn.as_raw_fd());
            peers.push(peer);
            reg.try_push(conn).unwrap();
        }

        assert_eq!(fds(&reg), expected);
        let owned: Vec<RawFd> = reg.iter().map(|c| c.as_raw_fd()).collect();
        assert_eq!(owned, expected[1..]);
    }

    #[test]
    fn swap_remove_moves_last_into_slot() {
        let (mut reg, listener, _p) = registry(8);
        let mut peers = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..4 {
            let (conn, peer) = pair();
            ids.push(conn.as_raw_fd());
            peers.push(peer);
            reg.try_push(conn).unwrap();
        }

        let removed = reg.swap_remove(2).unwrap();
        assert_eq!(removed.as_raw_fd(), ids[1]);
        assert_eq!(
            fds(&reg),
            vec![listener.as_raw_fd(), ids[0], ids[3], ids[2]]
        );

        let distinct: HashSet<RawFd> = fds(&reg).into_iter().collect();
        assert_eq!(distinct.len(), reg.len());
    }

    #[test]
    fn listener_slot_cannot_be_removed() {
        let (mut reg, listener, _p) = registry(4);
        let (conn, _peer) = pair();
        reg.try_push(conn).unwrap();

        assert!(reg.swap_remove(LISTENER_SLOT).is_none());
        assert!(reg.swap_remove(5).is_none());
        assert_eq!(reg.fd(LISTENER_SLOT), Some(listener.as_raw_fd()));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn removing_everything_returns_to_listener_only() {
        let (mut reg, listener, _p) = registry(2);
        let mut peers = Vec::new();
        for _ in 0..9 {
            let (conn, peer) = pair();
            peers.push(peer);
            reg.try_push(conn).unwrap();
        }
        let capacity = reg.capacity();

        // Always remove slot 1, as a scan that never advances would.
        while reg.swap_remove(1).is_some() {}

        assert_eq!(reg.len(), 1);
        assert_eq!(reg.capacity(), capacity);
        assert_eq!(reg.fd(LISTENER_SLOT), Some(listener.as_raw_fd()));
    }

    #[test]
    fn removed_connection_is_closed_on_drop() {
        let (mut reg, _l, _p) = registry(4);
        let (conn, mut peer) = pair();
        reg.try_push(conn).unwrap();

        drop(reg.swap_remove(1));

        let mut buf = [0u8; 1];
        assert_eq!(std::io::Read::read(&mut peer, &mut buf).unwrap(), 0);
    }

    #[test]
    fn close_all_drops_connections() {
        let (mut reg, _l, _p) = registry(4);
        let (a, mut peer_a) = pair();
        let (b, _peer_b) = pair();
        reg.try_push(a).unwrap();
        reg.try_push(b).unwrap();

        assert_eq!(reg.close_all(), 2);
        assert_eq!(reg.len(), 1);

        let mut buf = [0u8; 1];
        assert_eq!(std::io::Read::read(&mut peer_a, &mut buf).unwrap(), 0);
    }

    #[test]
    fn wait_times_out_with_no_events() {
        let (mut reg, _l, _p) = registry(4);
        let (conn, _peer) = pair();
        reg.try_push(conn).unwrap();

        assert_eq!(reg.wait(Duration::from_millis(1)).unwrap(), 0);
        assert_eq!(reg.revents(1), Some(0));
    }

    #[test]
    fn wait_reports_readable_slot() {
        let (mut reg, _l, _p) = registry(4);
        let (quiet, _quiet_peer) = pair();
        let (busy, mut busy_peer) = pair();
        reg.try_push(quiet).unwrap();
        reg.try_push(busy).unwrap();

        busy_peer.write_all(b"x").unwrap();

        assert_eq!(reg.wait(Duration::from_millis(100)).unwrap(), 1);
        assert_eq!(reg.revents(1), Some(0));
        assert_ne!(reg.revents(2).unwrap() & libc::POLLIN, 0);
    }

    #[test]
    fn pushed_entry_has_no_events() {
        let (mut reg, _l, _p) = registry(4);
        let (conn, mut peer) = pair();
        peer.write_all(b"pending").unwrap();
        reg.try_push(conn).unwrap();
        assert_eq!(reg.revents(1), Some(0));
    }
}
