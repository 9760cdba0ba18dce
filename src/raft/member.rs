// Cluster members
//
// A member is the leader's (or candidate's) working state for one other
// machine: which configuration halves it votes in, the outgoing connection,
// replication cursors, and the availability debouncing counters.

use super::log::{Log, LogKind};
use super::machine::Machine;
use super::peer::PeerConn;
use std::net::Ipv6Addr;

pub const MEMBER_OLD: u8 = 1 << 0;
pub const MEMBER_NEW: u8 = 1 << 1;
pub const MEMBER_ALL: u8 = MEMBER_OLD | MEMBER_NEW;

#[derive(Debug)]
pub struct Member {
    pub id: u32,
    /// Which configuration halves this member belongs to.
    pub kind: u8,
    pub addr: Ipv6Addr,
    pub port: u16,

    pub available: bool,
    pub available_since_tick: bool,
    pub unstable_round: u8,

    pub conn: PeerConn,
    /// The replication round this member last acked.
    pub append_entry_round: u64,
    pub next_index: u64,
    pub match_index: u64,
}

impl Member {
    fn from_machine(machine: &Machine, kind: u8) -> Self {
        Self {
            id: machine.id,
            kind,
            addr: machine.addr,
            port: machine.port,
            available: machine.available(),
            available_since_tick: false,
            unstable_round: 0,
            conn: PeerConn::new(),
            append_entry_round: 0,
            next_index: 0,
            match_index: 0,
        }
    }

    pub fn in_old(&self) -> bool {
        self.kind & MEMBER_OLD != 0
    }

    pub fn in_new(&self) -> bool {
        self.kind & MEMBER_NEW != 0
    }
}

fn push_members(out: &mut Vec<Member>, machines: &[Machine], kind: u8, leader: u32) {
    for machine in machines {
        if machine.id != leader {
            out.push(Member::from_machine(machine, kind));
        }
    }
}

/// One member per distinct non-leader machine of `log`, sorted by id.
///
/// For a joint ADJUST record machines present in both halves are merged to
/// one ALL member; other joint shapes share a literal prefix between the
/// halves, so membership falls out of the counts alone.
pub fn members_init(log: &Log, leader: u32) -> Vec<Member> {
    let mut members = Vec::with_capacity(log.distinct_machines_n as usize);

    if log.kind == LogKind::Adjust {
        push_members(&mut members, log.old_half(), MEMBER_OLD, leader);
        members.sort_unstable_by_key(|m| m.id);
        let merged = members.len();
        for machine in log.new_half() {
            if machine.id == leader {
                continue;
            }
            match members[..merged].binary_search_by_key(&machine.id, |m| m.id) {
                Ok(i) => members[i].kind = MEMBER_ALL,
                Err(_) => members.push(Member::from_machine(machine, MEMBER_NEW)),
            }
        }
    } else if log.new_n >= log.old_n {
        // The new half's leading old_n machines mirror the old half.
        let n = log.old_n as usize;
        push_members(&mut members, &log.new_half()[..n], MEMBER_ALL, leader);
        push_members(&mut members, &log.new_half()[n..], MEMBER_NEW, leader);
    } else {
        // Shrink (or a stable record with an empty new half): the survivors
        // lead the old half.
        let keep = log.new_n as usize;
        push_members(&mut members, &log.old_half()[..keep], MEMBER_ALL, leader);
        push_members(&mut members, &log.old_half()[keep..], MEMBER_OLD, leader);
    }

    members.sort_unstable_by_key(|m| m.id);
    members
}
