// Data-plane connections
//
// A connection is a small state machine: each state knows the readiness it
// needs, and a poll event drives it only when the event covers that need.
// States past the lock divider mean the connection is installed in the hash
// index as the placeholder for the key it is about to fill; its `interest`
// ring then queues the connections blocked on that key.

use crate::cache::index::{EntryKind, HashNode, KEY_OFFSET};
use crate::cache::list::ListNode;
use crate::cache::record::Borrower;
use crate::config::KEY_SIZE_MAX;
use crate::server::proto::{CMD_SIZE_MAX, GET_RES_SIZE};
use mio::net::TcpStream;

/// Connection state, tagged with the readiness that can advance it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Reading the command frame.
    InCmd,
    /// Parked on another connection's interest ring; no I/O of its own.
    GetBlocked,
    /// Writing the single zero status byte.
    OutSuccess,
    /// Writing the hit header and value.
    GetOutHit,
    /// Writing the miss header; the key lock is held from here on.
    GetOutMiss,
    /// Reading the 8-byte value size of a SET.
    SetInValueSize,
    /// Reading the value bytes.
    SetInValue,
}

impl ConnState {
    pub fn wants_readable(self) -> bool {
        matches!(
            self,
            ConnState::InCmd | ConnState::SetInValueSize | ConnState::SetInValue
        )
    }

    pub fn wants_writable(self) -> bool {
        matches!(
            self,
            ConnState::OutSuccess | ConnState::GetOutHit | ConnState::GetOutMiss
        )
    }

    /// Whether an event with the given readiness may drive this state.
    pub fn runnable(self, readable: bool, writable: bool) -> bool {
        (readable && self.wants_readable()) || (writable && self.wants_writable())
    }

    /// States in which this connection owns a key lock placeholder.
    pub fn holds_key_lock(self) -> bool {
        matches!(
            self,
            ConnState::GetOutMiss | ConnState::SetInValueSize | ConnState::SetInValue
        )
    }
}

/// One data-plane connection. Drawn from the shard's fixed pool; all the
/// intrusive nodes below are threaded into shard-owned rings, so a
/// connection must never move while it is alive.
#[repr(C)]
pub struct Conn {
    pub stream: TcpStream,
    /// Slot in the shard's connection table, used to unregister.
    pub slot: usize,
    pub state: ConnState,
    /// Ticks left on the key-lock clock; zero while unarmed.
    pub clock_time_left: u8,
    /// Claim on the record being served.
    pub borrower: Borrower,
    /// Value size of the SET in flight.
    pub val_size: u64,
    /// Membership in the shard clock ring while the clock is armed.
    pub clock_node: ListNode,
    /// As a lock holder: ring head of the waiters. As a waiter: this
    /// connection's link in the holder's ring.
    pub interest: ListNode,
    /// Bytes of the current read or write still outstanding.
    pub unio: u64,
    /// Command frame assembly area.
    pub in_buf: [u8; CMD_SIZE_MAX],
    /// Response header staging; also receives the 8-byte SET value size.
    pub out_buf: [u8; GET_RES_SIZE],
    /// Installed in the index while this connection holds a key lock.
    pub hash_node: HashNode,
    /// The key of the command in flight, zero-padded to 8 bytes.
    pub key: [u8; 1 + KEY_SIZE_MAX],
}

// The index resolves both records and placeholders through the same
// node-to-key offset.
const _: () = assert!(
    std::mem::offset_of!(Conn, key) - std::mem::offset_of!(Conn, hash_node) == KEY_OFFSET
);
const _: () = assert!(std::mem::offset_of!(Conn, key) % 8 == 0);

impl Conn {
    pub fn new(stream: TcpStream, slot: usize) -> Self {
        Self {
            stream,
            slot,
            state: ConnState::OutSuccess,
            clock_time_left: 0,
            borrower: Borrower::new(),
            val_size: 0,
            clock_node: ListNode::new(),
            interest: ListNode::new(),
            unio: 1,
            in_buf: [0; CMD_SIZE_MAX],
            out_buf: [0; GET_RES_SIZE],
            hash_node: HashNode {
                link: ListNode::new(),
                kind: EntryKind::Placeholder,
            },
            key: [0; 1 + KEY_SIZE_MAX],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_masks() {
        assert!(ConnState::InCmd.wants_readable());
        assert!(!ConnState::InCmd.wants_writable());
        assert!(ConnState::GetOutHit.wants_writable());
        assert!(!ConnState::GetBlocked.wants_readable());
        assert!(!ConnState::GetBlocked.wants_writable());
        assert!(!ConnState::GetBlocked.runnable(true, true));
        assert!(ConnState::SetInValue.runnable(true, false));
        assert!(!ConnState::SetInValue.runnable(false, true));
    }

    #[test]
    fn test_lock_divider() {
        for state in [
            ConnState::InCmd,
            ConnState::GetBlocked,
            ConnState::OutSuccess,
            ConnState::GetOutHit,
        ] {
            assert!(!state.holds_key_lock());
        }
        for state in [
            ConnState::GetOutMiss,
            ConnState::SetInValueSize,
            ConnState::SetInValue,
        ] {
            assert!(state.holds_key_lock());
        }
    }
}
