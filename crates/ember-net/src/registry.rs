//! The per-worker connection registry: `fd -> Connection`, keyed by the
//! 24-bit slot half of the fd (the worker_id half is fixed for one registry
//! and forbidden to cross).
//!
//! Grounded in `neutronium::net::endpoint::Endpoint`'s `channels: Vec<Channel>`
//! plus `free`/`live` bookkeeping, generalized from that repo's LIFO free-list
//! reuse to a monotonically-increasing-counter-with-wraparound allocator.

use ember_core::addr::Fd;
use indexmap::IndexMap;

use crate::connection::Connection;

/// Connections get the low 23 bits of the slot space; bit 23 is reserved
/// for listener fds (see `server::ListenerSlotAllocator`) so the two kinds
/// never collide without sharing a single allocator.
const SLOT_MASK: u32 = 0x007F_FFFF;

pub struct ConnectionRegistry {
    worker_id: u8,
    conns: IndexMap<u32, Connection>,
    next_slot: u32,
    wrapped: bool,
}

impl ConnectionRegistry {
    pub fn new(worker_id: u8) -> ConnectionRegistry {
        ConnectionRegistry {
            worker_id,
            conns: IndexMap::new(),
            next_slot: 0,
            wrapped: false,
        }
    }

    pub fn worker_id(&self) -> u8 {
        self.worker_id
    }

    /// Allocates the next slot: increments a counter until it wraps past
    /// 24 bits, then linearly probes for a free slot (since by then reuse
    /// is unavoidable — a 16M-connection registry on one worker is already
    /// far past any realistic load).
    fn allocate_slot(&mut self) -> Option<u32> {
        if !self.wrapped {
            let slot = self.next_slot;
            self.next_slot = (self.next_slot + 1) & SLOT_MASK;
            if self.next_slot == 0 {
                self.wrapped = true;
            }
            return Some(slot);
        }

        let start = self.next_slot;
        let mut probe = start;
        loop {
            if !self.conns.contains_key(&probe) {
                self.next_slot = (probe + 1) & SLOT_MASK;
                return Some(probe);
            }
            probe = (probe + 1) & SLOT_MASK;
            if probe == start {
                return None;
            }
        }
    }

    /// Inserts `conn` (already constructed with a placeholder fd) under a
    /// freshly allocated slot, fixing up its `fd` field, and returns the
    /// final fd.
    pub fn insert(&mut self, mut conn: Connection) -> Option<u32> {
        let slot = self.allocate_slot()?;
        let fd = u32::from(Fd::new(self.worker_id, slot));
        conn.fd = fd;
        self.conns.insert(slot, conn);
        Some(fd)
    }

    fn slot_of(&self, fd: u32) -> Option<u32> {
        let parsed = Fd::from(fd);
        if parsed.worker_id() != self.worker_id {
            return None;
        }
        Some(parsed.slot())
    }

    pub fn get(&self, fd: u32) -> Option<&Connection> {
        self.slot_of(fd).and_then(move |slot| self.conns.get(&slot))
    }

    pub fn get_mut(&mut self, fd: u32) -> Option<&mut Connection> {
        let slot = self.slot_of(fd)?;
        self.conns.get_mut(&slot)
    }

    pub fn remove(&mut self, fd: u32) -> Option<Connection> {
        let slot = self.slot_of(fd)?;
        self.conns.swap_remove(&slot)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.conns.values_mut()
    }

    pub fn fds(&self) -> impl Iterator<Item = u32> + '_ {
        self.conns.keys().map(move |slot| u32::from(Fd::new(self.worker_id, *slot)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::WireMode;
    use mio::net::TcpStream;
    use std::net::TcpListener as StdListener;
    use std::time::Instant;

    fn dummy_stream() -> TcpStream {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        TcpStream::from_stream(client).unwrap()
    }

    #[test]
    fn inserted_fd_encodes_worker_id_in_high_byte() {
        let mut reg = ConnectionRegistry::new(3);
        let conn = Connection::new(0, 42, WireMode::LengthPrefixed, dummy_stream(), Instant::now());
        let fd = reg.insert(conn).unwrap();
        assert_eq!(Fd::from(fd).worker_id(), 3);
        assert_eq!(Fd::from(fd).slot(), 0);
    }

    #[test]
    fn get_rejects_fd_from_a_different_worker() {
        let mut reg = ConnectionRegistry::new(1);
        let conn = Connection::new(0, 1, WireMode::LengthPrefixed, dummy_stream(), Instant::now());
        let fd = reg.insert(conn).unwrap();

        let foreign = Fd::new(2, Fd::from(fd).slot());
        assert!(reg.get(u32::from(foreign)).is_none());
    }

    #[test]
    fn after_wraparound_allocation_probes_forward_past_occupied_slots() {
        let mut reg = ConnectionRegistry::new(0);
        reg.next_slot = SLOT_MASK; // force an imminent wrap
        reg.wrapped = false;

        let c1 = Connection::new(0, 1, WireMode::LengthPrefixed, dummy_stream(), Instant::now());
        let fd1 = reg.insert(c1).unwrap();
        assert_eq!(Fd::from(fd1).slot(), SLOT_MASK);
        assert!(reg.wrapped);

        // counter wrapped, next allocation starts probing from slot 0
        let c2 = Connection::new(0, 2, WireMode::LengthPrefixed, dummy_stream(), Instant::now());
        let fd2 = reg.insert(c2).unwrap();
        assert_eq!(Fd::from(fd2).slot(), 0);

        // slot 0 is occupied now, so the next allocation must skip it
        let c3 = Connection::new(0, 3, WireMode::LengthPrefixed, dummy_stream(), Instant::now());
        let fd3 = reg.insert(c3).unwrap();
        assert_eq!(Fd::from(fd3).slot(), 1);

        // freeing slot 0 makes it available again once probing wraps back
        reg.remove(fd2);
        reg.next_slot = SLOT_MASK;
        let c4 = Connection::new(0, 4, WireMode::LengthPrefixed, dummy_stream(), Instant::now());
        let fd4 = reg.insert(c4).unwrap();
        assert_eq!(Fd::from(fd4).slot(), 0);
    }

    #[test]
    fn len_tracks_live_connections() {
        let mut reg = ConnectionRegistry::new(0);
        assert_eq!(reg.len(), 0);
        let conn = Connection::new(0, 1, WireMode::LengthPrefixed, dummy_stream(), Instant::now());
        let fd = reg.insert(conn).unwrap();
        assert_eq!(reg.len(), 1);
        reg.remove(fd);
        assert_eq!(reg.len(), 0);
    }
}
