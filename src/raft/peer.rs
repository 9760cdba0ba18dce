// Raft connections
//
// Same discipline as the data plane: fixed frames, explicit outstanding-byte
// accounting, would-block suspends, anything else is fatal to the
// connection. Outgoing connections belong to cluster members and are
// cleared back to NotConnected on failure so the next broadcast round can
// redial; incoming connections are freed outright.
//
// Frames are packed big-endian. A command header never exceeds `HDR_MAX`
// bytes, and `HDR_MAX` is below the smallest legal machine list, so bytes
// read past a cluster-carrying header always belong to that frame's machine
// array.

use super::log::{Log, LogKind};
use super::machine::{self, MACHINES_SIZE_MIN};
use bytes::BufMut;
use mio::net::TcpStream;
use std::io::{self, Read, Write};

pub const CMD_REQUEST_VOTE: u8 = 0;
pub const CMD_APPEND_LOG: u8 = 1;
pub const CMD_HEARTBEAT: u8 = 2;
pub const CMD_INIT_CLUSTER: u8 = 3;
pub const CMD_CHANGE_CLUSTER: u8 = 4;
/// Commands below this require the admin channel.
pub const CMD_ADMIN_DIVIDER: u8 = 5;
pub const CMD_LEADER: u8 = 6;
pub const CMD_CLUSTER: u8 = 7;
pub const CMD_CONNECT: u8 = 8;
pub const CMD_AUTHORITY: u8 = 9;

/// cmd + candidate_id + term + log_index + log_term
pub const VOTE_REQ_SIZE: usize = 1 + 4 + 8 + 8 + 8;
/// term + granted
pub const VOTE_RES_SIZE: usize = 8 + 1;
/// cmd + type + machines_size + term + leader + follower + log_index +
/// log_term + version + next_machine_version + next_machine_id + new_n +
/// distinct_machines_n
pub const APPEND_HDR_SIZE: usize = 1 + 1 + 8 + 8 + 4 + 4 + 8 + 8 + 8 + 8 + 4 + 4 + 8;
/// term + applied
pub const APPEND_RES_SIZE: usize = 8 + 1;
/// cmd + term
pub const HEARTBEAT_SIZE: usize = 1 + 8;
/// cmd + machines_size
pub const CLUSTER_REQ_SIZE: usize = 1 + 8;
/// addr + port + lost
pub const LEADER_RES_SIZE: usize = 16 + 2 + 1;
/// type + machines_size + version
pub const CLUSTER_RES_SIZE: usize = 1 + 8 + 8;
/// cmd + shard
pub const CONNECT_REQ_SIZE: usize = 1 + 4;

/// Command assembly buffer; every header fits.
pub const HDR_MAX: usize = APPEND_HDR_SIZE;

const _: () = assert!(HDR_MAX == 74);
const _: () = assert!((HDR_MAX as u64) < MACHINES_SIZE_MIN);

/// Encode the APPEND_LOG frame (header plus machine array) for `log`.
pub fn encode_append_log(log: &Log, term: u64, leader: u32, follower: u32) -> Vec<u8> {
    let machines_size = log.machines.len() * machine::MACHINE_WIRE_SIZE;
    let mut out = Vec::with_capacity(APPEND_HDR_SIZE + machines_size);
    out.put_u8(CMD_APPEND_LOG);
    out.put_u8(log.kind as u8);
    out.put_u64(machines_size as u64);
    out.put_u64(term);
    out.put_u32(leader);
    out.put_u32(follower);
    out.put_u64(log.index);
    out.put_u64(log.term);
    out.put_u64(log.version);
    out.put_u64(log.next_machine_version);
    out.put_u32(log.next_machine_id);
    out.put_u32(log.new_n);
    out.put_u64(log.distinct_machines_n);
    machine::encode_machines(&log.machines, &mut out);
    out
}

/// The APPEND_LOG header fields, as read off the wire.
#[derive(Debug, Clone, Copy)]
pub struct AppendHdr {
    pub kind: LogKind,
    pub machines_size: u64,
    pub term: u64,
    pub leader: u32,
    pub follower: u32,
    pub log_index: u64,
    pub log_term: u64,
    pub version: u64,
    pub next_machine_version: u64,
    pub next_machine_id: u32,
    pub new_n: u32,
    pub distinct_machines_n: u64,
}

impl AppendHdr {
    pub fn decode(buf: &[u8]) -> Option<Self> {
        debug_assert!(buf.len() >= APPEND_HDR_SIZE);
        let mut buf = &buf[1..];
        use bytes::Buf;
        let kind = LogKind::from_wire(buf.get_u8())?;
        Some(Self {
            kind,
            machines_size: buf.get_u64(),
            term: buf.get_u64(),
            leader: buf.get_u32(),
            follower: buf.get_u32(),
            log_index: buf.get_u64(),
            log_term: buf.get_u64(),
            version: buf.get_u64(),
            next_machine_version: buf.get_u64(),
            next_machine_id: buf.get_u32(),
            new_n: buf.get_u32(),
            distinct_machines_n: buf.get_u64(),
        })
    }
}

/// States of an outgoing (member) connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    NotConnected,
    /// Nonblocking connect in flight; resolved on the writable edge.
    InProgress,
    Ready,
    VoteOut,
    VoteIn,
    AppendOut,
    AppendIn,
    HeartbeatOut,
    HeartbeatIn,
}

impl PeerState {
    pub fn wants_readable(self) -> bool {
        matches!(
            self,
            PeerState::VoteIn | PeerState::AppendIn | PeerState::HeartbeatIn
        )
    }

    pub fn wants_writable(self) -> bool {
        matches!(
            self,
            PeerState::InProgress
                | PeerState::VoteOut
                | PeerState::AppendOut
                | PeerState::HeartbeatOut
        )
    }

    pub fn runnable(self, readable: bool, writable: bool) -> bool {
        (readable && self.wants_readable()) || (writable && self.wants_writable())
    }
}

/// Progress of one buffered read or write.
pub enum IoStep {
    /// Frame complete.
    Done,
    /// Socket drained for now.
    Again,
    /// Connection is broken.
    Failed,
}

/// One member's outgoing connection.
#[derive(Debug)]
pub struct PeerConn {
    pub state: PeerState,
    pub stream: Option<TcpStream>,
    /// Frame being written, and how much of it went out.
    pub out: Vec<u8>,
    pub sent: usize,
    /// Fixed-size response assembly.
    pub buf: [u8; VOTE_RES_SIZE],
    pub read: usize,
}

impl PeerConn {
    pub fn new() -> Self {
        Self {
            state: PeerState::NotConnected,
            stream: None,
            out: Vec::new(),
            sent: 0,
            buf: [0; VOTE_RES_SIZE],
            read: 0,
        }
    }

    /// Drop the socket and go back to NotConnected; the next round redials.
    pub fn clear(&mut self) {
        self.stream = None;
        self.out = Vec::new();
        self.sent = 0;
        self.read = 0;
        self.state = PeerState::NotConnected;
    }

    pub fn start_frame(&mut self, state: PeerState, frame: Vec<u8>) {
        self.state = state;
        self.out = frame;
        self.sent = 0;
    }

    pub fn start_response(&mut self, state: PeerState) {
        self.state = state;
        self.read = 0;
        self.out = Vec::new();
        self.sent = 0;
    }

    /// Push the pending frame out.
    pub fn write_step(&mut self) -> IoStep {
        let Some(stream) = self.stream.as_mut() else {
            return IoStep::Failed;
        };
        while self.sent < self.out.len() {
            match stream.write(&self.out[self.sent..]) {
                Ok(0) => return IoStep::Failed,
                Ok(n) => self.sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return IoStep::Again,
                Err(_) => return IoStep::Failed,
            }
        }
        IoStep::Done
    }

    /// Pull a fixed-size response in.
    pub fn read_step(&mut self, need: usize) -> IoStep {
        let Some(stream) = self.stream.as_mut() else {
            return IoStep::Failed;
        };
        while self.read < need {
            match stream.read(&mut self.buf[self.read..need]) {
                Ok(0) => return IoStep::Failed,
                Ok(n) => self.read += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return IoStep::Again,
                Err(_) => return IoStep::Failed,
            }
        }
        IoStep::Done
    }
}

impl Default for PeerConn {
    fn default() -> Self {
        Self::new()
    }
}

/// States of an incoming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InState {
    /// Assembling a command header.
    InCmd,
    /// Writing the single status byte.
    OutSuccess,
    /// Writing a vote response.
    VoteOut,
    /// Writing an append/heartbeat response.
    RecvEntryOut,
    /// Reading a replicated log's machine array.
    RecvLogIn,
    /// Reading an INIT_CLUSTER machine array.
    InitClusterIn,
    /// Reading a CHANGE_CLUSTER machine array.
    ChangeClusterIn,
    /// Writing a LEADER response.
    LeaderOut,
    /// Writing a CLUSTER response.
    ClusterOut,
    /// Authority stream, idle between approvals.
    AuthorityPending,
    /// Authority stream, approval being written.
    AuthorityOut,
}

impl InState {
    pub fn wants_readable(self) -> bool {
        matches!(
            self,
            InState::InCmd
                | InState::RecvLogIn
                | InState::InitClusterIn
                | InState::ChangeClusterIn
                | InState::AuthorityPending
                | InState::AuthorityOut
        )
    }

    pub fn wants_writable(self) -> bool {
        matches!(
            self,
            InState::OutSuccess
                | InState::VoteOut
                | InState::RecvEntryOut
                | InState::LeaderOut
                | InState::ClusterOut
                | InState::AuthorityOut
        )
    }

    pub fn runnable(self, readable: bool, writable: bool) -> bool {
        (readable && self.wants_readable()) || (writable && self.wants_writable())
    }
}

/// One incoming connection on the raft port or the admin port.
#[derive(Debug)]
pub struct InConn {
    pub stream: TcpStream,
    pub slot: usize,
    pub admin: bool,
    pub state: InState,

    /// Command header assembly.
    pub hdr: [u8; HDR_MAX],
    pub hdr_read: usize,

    /// Machine-array payload assembly for the cluster-carrying commands.
    pub payload: Vec<u8>,
    pub payload_read: usize,
    /// Parsed APPEND_LOG header while its machines stream in.
    pub append: Option<AppendHdr>,
    /// CHANGE_CLUSTER: the old_n the joint record was sized against.
    pub change_old_n: u32,

    /// Response being written.
    pub out: Vec<u8>,
    pub out_sent: usize,

    /// Authority accounting: bytes seen, bytes riding the current
    /// replication round, bytes committed but not yet reported.
    pub authority_pending: u64,
    pub authority_processing: u64,
    pub authority_succeed: u64,
}

impl InConn {
    pub fn new(stream: TcpStream, slot: usize, admin: bool) -> Self {
        Self {
            stream,
            slot,
            admin,
            state: InState::InCmd,
            hdr: [0; HDR_MAX],
            hdr_read: 0,
            payload: Vec::new(),
            payload_read: 0,
            append: None,
            change_old_n: 0,
            out: Vec::new(),
            out_sent: 0,
            authority_pending: 0,
            authority_processing: 0,
            authority_succeed: 0,
        }
    }

    pub fn is_authority(&self) -> bool {
        matches!(
            self.state,
            InState::AuthorityPending | InState::AuthorityOut
        )
    }

    /// Back to command assembly.
    pub fn reset_to_in_cmd(&mut self) {
        self.state = InState::InCmd;
        self.hdr_read = 0;
        self.payload = Vec::new();
        self.payload_read = 0;
        self.append = None;
        self.out = Vec::new();
        self.out_sent = 0;
    }

    pub fn start_out(&mut self, state: InState, frame: Vec<u8>) {
        self.state = state;
        self.out = frame;
        self.out_sent = 0;
    }

    pub fn read_hdr_step(&mut self) -> IoStep {
        match self.stream.read(&mut self.hdr[self.hdr_read..]) {
            Ok(0) => IoStep::Failed,
            Ok(n) => {
                self.hdr_read += n;
                IoStep::Done
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoStep::Again,
            Err(_) => IoStep::Failed,
        }
    }

    /// Read toward a full `payload` buffer.
    pub fn read_payload_step(&mut self) -> IoStep {
        while self.payload_read < self.payload.len() {
            match self.stream.read(&mut self.payload[self.payload_read..]) {
                Ok(0) => return IoStep::Failed,
                Ok(n) => self.payload_read += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return IoStep::Again,
                Err(_) => return IoStep::Failed,
            }
        }
        IoStep::Done
    }

    pub fn write_step(&mut self) -> IoStep {
        while self.out_sent < self.out.len() {
            match self.stream.write(&self.out[self.out_sent..]) {
                Ok(0) => return IoStep::Failed,
                Ok(n) => self.out_sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return IoStep::Again,
                Err(_) => return IoStep::Failed,
            }
        }
        IoStep::Done
    }

    /// Drain and count authority tokens; one byte is one approval request.
    pub fn discard_count(&mut self) -> Result<u64, ()> {
        let mut scratch = [0u8; 1024];
        let mut counted = 0u64;
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => return Err(()),
                Ok(n) => {
                    counted += n as u64;
                    if n < scratch.len() {
                        return Ok(counted);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(counted),
                Err(_) => return Err(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::machine::Machine;
    use std::net::Ipv6Addr;

    #[test]
    fn test_append_frame_roundtrip() {
        let machines: Vec<Machine> = (1..=4)
            .map(|i| Machine::new(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, i), 7000))
            .collect();
        let log = Log::init(machines).unwrap();

        let frame = encode_append_log(&log, 3, 1, 2);
        assert_eq!(
            frame.len(),
            APPEND_HDR_SIZE + 4 * machine::MACHINE_WIRE_SIZE
        );
        assert_eq!(frame[0], CMD_APPEND_LOG);

        let hdr = AppendHdr::decode(&frame).unwrap();
        assert_eq!(hdr.kind, LogKind::Old);
        assert_eq!(hdr.machines_size, 4 * machine::MACHINE_WIRE_SIZE as u64);
        assert_eq!(hdr.term, 3);
        assert_eq!(hdr.leader, 1);
        assert_eq!(hdr.follower, 2);
        assert_eq!(hdr.log_index, log.index);
        assert_eq!(hdr.new_n, 0);

        let machines = machine::decode_machines(&frame[APPEND_HDR_SIZE..]);
        assert_eq!(machines, log.machines);
    }

    #[test]
    fn test_bad_log_kind_is_rejected() {
        let mut frame = vec![0u8; APPEND_HDR_SIZE];
        frame[0] = CMD_APPEND_LOG;
        frame[1] = 7; // not a log kind
        assert!(AppendHdr::decode(&frame).is_none());
    }
}
