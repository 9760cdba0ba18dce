// Raft server
//
// One thread runs the whole membership plane: a readiness loop over two
// listen sockets (peer/user traffic on the raft port, trusted admin traffic
// one port up), the incoming connection FSMs, and the outgoing connections
// of the current cluster view. The election timer is the poll timeout; it
// is armed the first time this node learns it belongs to a cluster.
//
// Outgoing connections live inside the cluster view. Replacing the view
// bumps a generation counter baked into the poll tokens, so late events for
// connections of a dead view are recognized and dropped; the views
// themselves queue up and are freed after each loop pass.

use super::cluster::Cluster;
use super::log::{Log, LogKind, LogRef};
use super::machine::{self, MACHINE_WIRE_SIZE};
use super::peer::{
    self, AppendHdr, IoStep, InConn, InState, PeerState, APPEND_RES_SIZE, CLUSTER_REQ_SIZE,
    CONNECT_REQ_SIZE, HDR_MAX, HEARTBEAT_SIZE, VOTE_REQ_SIZE, VOTE_RES_SIZE,
};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::server::listener::listen_socket;
use crate::server::worker::WorkerHandle;
use bytes::{Buf, BufMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slab::Slab;
use std::io;
use std::net::{SocketAddr, SocketAddrV6};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const USER_LISTENER: Token = Token(usize::MAX);
const ADMIN_LISTENER: Token = Token(usize::MAX - 1);
const OUT_FLAG: usize = 1 << 63;
const OUT_IDX_BITS: u32 = 24;

const RELISTEN_BACKOFF: Duration = Duration::from_secs(3);

/// Broadcast rounds an availability mismatch must survive to flip.
const UNSTABLE_ROUNDS: u8 = 10;
/// Broadcast rounds without leader contact before campaigning.
const ELECTION_TICKS: u32 = 10;

fn out_token(generation: u64, idx: usize) -> Token {
    debug_assert!(idx < (1 << OUT_IDX_BITS));
    Token(OUT_FLAG | ((generation as usize) << OUT_IDX_BITS) | idx)
}

fn decode_out_token(token: Token) -> (u64, usize) {
    let raw = token.0 & !OUT_FLAG;
    (
        (raw >> OUT_IDX_BITS) as u64,
        raw & ((1 << OUT_IDX_BITS) - 1),
    )
}

#[derive(Debug)]
struct LeaderState {
    commit_required_old: i64,
    commit_required_new: i64,
    replicate_round: u64,
    replicate: bool,
    committed: bool,
    available: bool,
}

#[derive(Debug)]
struct CandidateState {
    required_old: i64,
    required_new: i64,
}

#[derive(Debug)]
struct FollowerState {
    voted_for: u32,
    leader: u32,
}

#[derive(Debug)]
enum Role {
    Leader(LeaderState),
    Candidate(CandidateState),
    Follower(FollowerState),
}

struct TimerState {
    tick: Duration,
    next: Instant,
    ticks: u32,
}

pub struct RaftServer {
    config: CacheConfig,
    workers: Vec<WorkerHandle>,
    poll: Poll,

    id: u32,
    current_term: u64,
    role: Role,
    log: LogRef,
    cluster: Option<Cluster>,
    stale_clusters: Vec<Cluster>,
    generation: u64,

    conns: Slab<InConn>,
    user_listener: Option<TcpListener>,
    admin_listener: Option<TcpListener>,
    user_addr: SocketAddr,
    admin_addr: SocketAddr,

    rng: StdRng,
    timer: Option<TimerState>,
}

// RaftServer's LogRef (Rc<Log>) is exclusively owned by this server; it is
// moved wholly into its own thread by `spawn` and never touched by the
// spawning thread again, so no data race is possible.
unsafe impl Send for RaftServer {}

impl RaftServer {
    pub fn bind(config: CacheConfig, workers: Vec<WorkerHandle>) -> Result<Self> {
        let poll = Poll::new()?;
        let timeout = Duration::from_millis(u64::from(config.tcp_timeout_ms));

        let mut user_listener = listen_socket(config.raft_port, config.max_conn, timeout)?;
        // Port zero means "pick for me"; then the admin channel picks too.
        let admin_port = if config.raft_port == 0 {
            0
        } else {
            config.raft_port + 1
        };
        let mut admin_listener = listen_socket(admin_port, config.max_conn, timeout)?;
        let user_addr = user_listener.local_addr()?;
        let admin_addr = admin_listener.local_addr()?;
        poll.registry()
            .register(&mut user_listener, USER_LISTENER, Interest::READABLE)?;
        poll.registry()
            .register(&mut admin_listener, ADMIN_LISTENER, Interest::READABLE)?;
        info!(%user_addr, %admin_addr, "membership plane listening");

        Ok(Self {
            config,
            workers,
            poll,
            id: 0,
            current_term: 0,
            role: Role::Follower(FollowerState {
                voted_for: 0,
                leader: 0,
            }),
            log: Log::empty(),
            cluster: None,
            stale_clusters: Vec::new(),
            generation: 0,
            conns: Slab::new(),
            user_listener: Some(user_listener),
            admin_listener: Some(admin_listener),
            user_addr,
            admin_addr,
            rng: StdRng::seed_from_u64(0),
            timer: None,
        })
    }

    pub fn user_addr(&self) -> SocketAddr {
        self.user_addr
    }

    pub fn admin_addr(&self) -> SocketAddr {
        self.admin_addr
    }

    // --- timer -----------------------------------------------------------

    /// Arm the timer with this node's deterministic jitter.
    fn set_timer(&mut self, id: u32) {
        self.rng = StdRng::seed_from_u64(u64::from(id));
        self.reset_timer_hard();
    }

    /// Re-randomize the election timeout (150-300 ms split into ten
    /// broadcast intervals) and restart counting.
    fn reset_timer_hard(&mut self) {
        let election_timeout_us = self.rng.gen_range(150_000..300_000);
        let tick = Duration::from_micros(election_timeout_us / u64::from(ELECTION_TICKS));
        self.timer = Some(TimerState {
            tick,
            next: Instant::now() + tick,
            ticks: 0,
        });
    }

    fn reset_timer(&mut self) {
        if let Some(timer) = self.timer.as_mut() {
            timer.ticks = 0;
        }
    }

    // --- role transitions -------------------------------------------------

    fn retire_cluster(&mut self) {
        if let Some(old) = self.cluster.take() {
            self.stale_clusters.push(old);
        }
    }

    fn install_cluster(&mut self, cluster: Cluster) {
        self.retire_cluster();
        self.cluster = Some(cluster);
    }

    fn convert_to_follower(&mut self) {
        debug_assert!(!matches!(self.role, Role::Follower(_)));
        debug!(term = self.current_term, "converting to follower");
        self.retire_cluster();
        self.role = Role::Follower(FollowerState {
            voted_for: 0,
            leader: 0,
        });
        self.reset_timer();
    }

    /// Raft §5.1: adopt the larger term and drop back to follower.
    fn increase_term(&mut self, term: u64) {
        debug_assert!(term > self.current_term);
        self.current_term = term;
        match &mut self.role {
            Role::Follower(f) => {
                f.voted_for = 0;
                f.leader = 0;
            }
            _ => self.convert_to_follower(),
        }
    }

    /// Raft §5.4.2: a fresh leader may not commit an inherited unstable
    /// entry by counting replicas, so it re-issues it under its own term.
    fn convert_to_leader(&mut self) {
        debug_assert!(matches!(self.role, Role::Candidate(_)));
        info!(term = self.current_term, id = self.id, "won election");

        let leader_machine = if self.log.kind.unstable() {
            let mut log = (*self.log).clone();
            log.index += 1;
            log.term = self.current_term;
            self.log = Rc::new(log);
            self.log.find_new(self.id).copied()
        } else {
            self.log.find_old(self.id).copied()
        };

        self.role = Role::Leader(LeaderState {
            commit_required_old: 0,
            commit_required_new: 0,
            replicate_round: 0,
            replicate: true,
            committed: true,
            available: leader_machine.map_or(true, |m| m.available()),
        });
    }

    /// Swap in a new configuration log and derive a fresh cluster view.
    fn leader_replace_log(&mut self, log: LogRef) {
        debug!(
            index = log.index,
            version = log.version,
            kind = ?log.kind,
            "replacing configuration log"
        );
        self.generation += 1;
        let cluster = Cluster::build(&log, self.id, self.generation);
        self.log = log;
        self.install_cluster(cluster);
        if let Role::Leader(leader) = &mut self.role {
            leader.replicate = true;
        }
    }

    fn server_warmed_up(&self) -> bool {
        self.log.kind != LogKind::GrowTransform
            || self.workers.iter().any(WorkerHandle::warmed_up)
    }

    // --- elections --------------------------------------------------------

    fn convert_to_candidate(&mut self) {
        if matches!(self.role, Role::Follower(_)) {
            self.generation += 1;
            let cluster = Cluster::build(&self.log, self.id, self.generation);
            self.install_cluster(cluster);
            self.role = Role::Candidate(CandidateState {
                required_old: 0,
                required_new: 0,
            });
        }

        self.current_term += 1;
        let cluster = self.cluster.as_ref().expect("candidate without cluster");
        let (required_old, required_new) = (
            i64::from(cluster.require_old_votes),
            i64::from(cluster.require_new_votes),
        );
        if let Role::Candidate(c) = &mut self.role {
            c.required_old = required_old;
            c.required_new = required_new;
        }
        self.reset_timer_hard();
        debug!(term = self.current_term, "starting election");

        for idx in 0..self.member_count() {
            match self.member_conn_state(idx) {
                PeerState::Ready => self.request_vote_out(idx),
                PeerState::NotConnected => self.member_connect(idx),
                _ => {}
            }
        }

        // A single-member view can win on the spot.
        self.check_election_won();
    }

    fn check_election_won(&mut self) {
        if let Role::Candidate(c) = &self.role {
            if c.required_old <= 0 && c.required_new <= 0 {
                self.convert_to_leader();
            }
        }
    }

    // --- cluster plumbing -------------------------------------------------

    fn member_count(&self) -> usize {
        self.cluster.as_ref().map_or(0, |c| c.members.len())
    }

    fn member_conn_state(&self, idx: usize) -> PeerState {
        self.cluster.as_ref().unwrap().members[idx].conn.state
    }

    fn member_connect(&mut self, idx: usize) {
        let generation = self.generation;
        let cluster = self.cluster.as_mut().unwrap();
        let member = &mut cluster.members[idx];
        debug_assert_eq!(member.conn.state, PeerState::NotConnected);

        let addr = SocketAddr::V6(SocketAddrV6::new(member.addr, member.port, 0, 0));
        match TcpStream::connect(addr) {
            Ok(mut stream) => {
                let _ = stream.set_nodelay(true);
                if self
                    .poll
                    .registry()
                    .register(
                        &mut stream,
                        out_token(generation, idx),
                        Interest::READABLE | Interest::WRITABLE,
                    )
                    .is_err()
                {
                    return;
                }
                member.conn.stream = Some(stream);
                member.conn.state = PeerState::InProgress;
            }
            Err(e) => debug!(member = member.id, "connect failed: {e}"),
        }
    }

    fn request_vote_out(&mut self, idx: usize) {
        let mut frame = Vec::with_capacity(VOTE_REQ_SIZE);
        frame.put_u8(peer::CMD_REQUEST_VOTE);
        frame.put_u32(self.id);
        frame.put_u64(self.current_term);
        frame.put_u64(self.log.index);
        frame.put_u64(self.log.term);

        let member = &mut self.cluster.as_mut().unwrap().members[idx];
        member.conn.start_frame(PeerState::VoteOut, frame);
        self.drive_peer_write(idx);
    }

    fn heartbeat_out(&mut self, idx: usize) {
        let mut frame = Vec::with_capacity(HEARTBEAT_SIZE);
        frame.put_u8(peer::CMD_HEARTBEAT);
        frame.put_u64(self.current_term);

        let member = &mut self.cluster.as_mut().unwrap().members[idx];
        member.conn.start_frame(PeerState::HeartbeatOut, frame);
        self.drive_peer_write(idx);
    }

    fn append_log_out(&mut self, idx: usize) {
        let member_id = self.cluster.as_ref().unwrap().members[idx].id;
        let frame = peer::encode_append_log(&self.log, self.current_term, self.id, member_id);
        let log_index = self.log.index;

        let member = &mut self.cluster.as_mut().unwrap().members[idx];
        member.next_index = log_index;
        member.conn.start_frame(PeerState::AppendOut, frame);
        self.drive_peer_write(idx);
    }

    /// Ship this round's entry to one member: the full log if it is behind,
    /// a heartbeat otherwise.
    fn append_entry_out(&mut self, idx: usize) {
        let round = match &self.role {
            Role::Leader(l) => l.replicate_round,
            _ => unreachable!("append outside leadership"),
        };
        let log_index = self.log.index;
        let member = &mut self.cluster.as_mut().unwrap().members[idx];
        member.available_since_tick = true;
        member.append_entry_round = round;

        if member.next_index <= log_index {
            self.append_log_out(idx);
        } else {
            self.heartbeat_out(idx);
        }
    }

    /// Advance a pending outgoing write; on completion switch to the
    /// matching response read.
    fn drive_peer_write(&mut self, idx: usize) {
        let member = &mut self.cluster.as_mut().unwrap().members[idx];
        match member.conn.write_step() {
            IoStep::Done => match member.conn.state {
                PeerState::VoteOut => member.conn.start_response(PeerState::VoteIn),
                PeerState::AppendOut => member.conn.start_response(PeerState::AppendIn),
                PeerState::HeartbeatOut => member.conn.start_response(PeerState::HeartbeatIn),
                _ => unreachable!("write completion in {:?}", member.conn.state),
            },
            IoStep::Again => {}
            IoStep::Failed => member.conn.clear(),
        }
    }

    // --- replication accounting ------------------------------------------

    /// Do enough members match the head of the log to call it committed?
    fn quorum_matched(&self) -> bool {
        let cluster = self.cluster.as_ref().unwrap();
        let mut old_matched = 0;
        let mut new_matched = 0;
        for member in &cluster.members {
            if member.match_index >= self.log.index {
                if member.in_old() {
                    old_matched += 1;
                }
                if member.in_new() {
                    new_matched += 1;
                }
            }
        }
        old_matched >= cluster.require_old_votes && new_matched >= cluster.require_new_votes
    }

    /// Record a member's ack; when that commits the entry, cut the stable
    /// successor (or exit if the committed configuration drops the leader).
    /// Returns false only when a follow-up view could not be installed.
    fn log_commited(&mut self, idx: usize) -> bool {
        {
            let member = &mut self.cluster.as_mut().unwrap().members[idx];
            if member.match_index == member.next_index - 1 {
                return true;
            }
            member.match_index = member.next_index - 1;
            if member.match_index != self.log.index {
                return true;
            }
        }
        if !self.quorum_matched() {
            return true;
        }

        let successor = match self.log.kind {
            LogKind::Old => {
                // Raft §6: a leader outside the committed configuration
                // steps down; here that is process exit.
                if self.log.old_n as usize == self.cluster.as_ref().unwrap().members.len() {
                    info!("committed configuration no longer contains this leader, exiting");
                    std::process::exit(0);
                }
                return true;
            }
            LogKind::GrowTransform => Log::grow_complete(&self.log, self.current_term),
            _ => {
                debug_assert!(self.log.kind.unstable());
                debug_assert_eq!(self.current_term, self.log.term);
                Log::stable(&self.log)
            }
        };

        if self.log.kind.joint() {
            self.leader_replace_log(Rc::new(successor));
        } else {
            self.log = Rc::new(successor);
            if let Role::Leader(leader) = &mut self.role {
                leader.replicate = true;
            }
        }
        true
    }

    fn handle_vote_res(&mut self, idx: usize) {
        let (term, granted, in_old, in_new) = {
            let member = &mut self.cluster.as_mut().unwrap().members[idx];
            let mut buf = &member.conn.buf[..VOTE_RES_SIZE];
            let term = buf.get_u64();
            let granted = buf.get_u8() != 0;
            member.conn.state = PeerState::Ready;
            (term, granted, member.in_old(), member.in_new())
        };

        if term > self.current_term {
            self.increase_term(term);
            return;
        }

        if term == self.current_term && granted {
            if let Role::Candidate(c) = &mut self.role {
                if in_old {
                    c.required_old -= 1;
                }
                if in_new {
                    c.required_new -= 1;
                }
                debug!(
                    still_required_old = c.required_old,
                    still_required_new = c.required_new,
                    "vote granted"
                );
                self.check_election_won();
            }
        }
    }

    fn handle_append_res(&mut self, idx: usize, was_append: bool) {
        let (term, applied, round, in_old, in_new) = {
            let member = &mut self.cluster.as_mut().unwrap().members[idx];
            let mut buf = &member.conn.buf[..APPEND_RES_SIZE];
            let term = buf.get_u64();
            let applied = buf.get_u8() != 0;
            member.conn.state = PeerState::Ready;
            if was_append {
                member.next_index += 1;
            }
            (
                term,
                applied,
                member.append_entry_round,
                member.in_old(),
                member.in_new(),
            )
        };

        if term > self.current_term {
            self.increase_term(term);
            return;
        }
        if !matches!(self.role, Role::Leader(_)) || term != self.current_term {
            return;
        }

        let generation = self.generation;
        if applied && !self.log_commited(idx) {
            self.convert_to_follower();
            return;
        }
        if self.generation != generation {
            // The commit replaced the member view; this ack belongs to the
            // retired one and the fresh view starts its own round.
            return;
        }

        let current_round = match &self.role {
            Role::Leader(l) => l.replicate_round,
            _ => return,
        };
        if round == current_round {
            if let Role::Leader(leader) = &mut self.role {
                if in_old {
                    leader.commit_required_old -= 1;
                }
                if in_new {
                    leader.commit_required_new -= 1;
                }
            }
        } else {
            // This member missed the current round; bring it in now.
            self.append_entry_out(idx);
        }
    }

    /// Kick a replication round: snapshot authority demand, reset the vote
    /// counters, and contact every member.
    fn replicate_entry(&mut self) {
        for (_, conn) in self.conns.iter_mut() {
            if conn.is_authority() {
                conn.authority_processing += conn.authority_pending;
                conn.authority_pending = 0;
            }
        }

        {
            let cluster = self.cluster.as_ref().expect("replicating without cluster");
            let (required_old, required_new) = (
                i64::from(cluster.require_old_votes),
                i64::from(cluster.require_new_votes),
            );
            match &mut self.role {
                Role::Leader(leader) => {
                    leader.commit_required_old = required_old;
                    leader.commit_required_new = required_new;
                    leader.replicate_round += 1;
                    leader.replicate = false;
                    leader.committed = false;
                }
                _ => unreachable!("replicating without leadership"),
            }
        }

        for idx in 0..self.member_count() {
            match self.member_conn_state(idx) {
                PeerState::Ready => self.append_entry_out(idx),
                PeerState::NotConnected => self.member_connect(idx),
                _ => {}
            }
        }
    }

    /// One broadcast interval as leader: debounce availability flips, step
    /// down on majority loss, and publish availability changes on a stable
    /// log. Returns false to demand the step-down.
    fn leader_timer_ticked(&mut self) -> bool {
        let mut available_changed = match &self.role {
            Role::Leader(l) => !l.available,
            _ => unreachable!(),
        };

        let (require_old, require_new, mut old_available, mut new_available) = {
            let cluster = self.cluster.as_mut().unwrap();
            let mut old_available = 0;
            let mut new_available = 0;
            for member in &mut cluster.members {
                if member.available_since_tick == member.available {
                    member.unstable_round = 0;
                } else {
                    member.unstable_round += 1;
                    if member.unstable_round >= UNSTABLE_ROUNDS {
                        member.available = !member.available;
                        member.unstable_round = 0;
                        available_changed = true;
                    }
                }
                member.available_since_tick = false;

                if member.available {
                    if member.in_old() {
                        old_available += 1;
                    }
                    if member.in_new() {
                        new_available += 1;
                    }
                }
            }
            (
                cluster.require_old_votes,
                cluster.require_new_votes,
                old_available,
                new_available,
            )
        };

        // The leader itself backs every count it is part of.
        if self.log.find_old(self.id).is_some() {
            old_available += 1;
        }
        if self.log.find_new(self.id).is_some() {
            new_available += 1;
        }

        if old_available < require_old || new_available < require_new {
            warn!("availability majority lost, stepping down");
            return false;
        }

        if !self.log.kind.unstable() && available_changed {
            if let Role::Leader(leader) = &mut self.role {
                leader.available = true;
            }
            debug!("publishing availability change");
            let cluster = self.cluster.as_ref().unwrap();
            let log = Log::change_available(&self.log, self.current_term, |m| {
                cluster
                    .find(m.id)
                    .map_or(true, |member| member.available)
            });
            self.log = Rc::new(log);
            if let Role::Leader(leader) = &mut self.role {
                leader.replicate = true;
            }
        }
        true
    }

    fn timer_ticked(&mut self) {
        let election_due = {
            let Some(timer) = self.timer.as_mut() else {
                return;
            };
            timer.ticks += 1;
            timer.ticks > ELECTION_TICKS
        };

        match &self.role {
            Role::Leader(_) => {
                if self.leader_timer_ticked() {
                    if let Role::Leader(leader) = &mut self.role {
                        leader.replicate = true;
                    }
                } else {
                    self.convert_to_follower();
                }
            }
            _ => {
                if election_due {
                    self.convert_to_candidate();
                }
            }
        }
    }

    // --- incoming connections --------------------------------------------

    fn accept_pending(&mut self, admin: bool) {
        loop {
            let listener = if admin {
                self.admin_listener.as_ref()
            } else {
                self.user_listener.as_ref()
            };
            let Some(listener) = listener else { return };

            match listener.accept() {
                Ok((mut stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let entry = self.conns.vacant_entry();
                    let slot = entry.key();
                    if self
                        .poll
                        .registry()
                        .register(
                            &mut stream,
                            Token(slot),
                            Interest::READABLE | Interest::WRITABLE,
                        )
                        .is_err()
                    {
                        continue;
                    }
                    debug!(%peer, admin, slot, "raft connection accepted");
                    entry.insert(InConn::new(stream, slot, admin));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(admin, "raft accept failed: {e}");
                    if admin {
                        self.admin_listener = None;
                    } else {
                        self.user_listener = None;
                    }
                    return;
                }
            }
        }
    }

    fn free_in(&mut self, slot: usize) {
        if self.conns.contains(slot) {
            let mut gone = self.conns.remove(slot);
            let _ = self.poll.registry().deregister(&mut gone.stream);
        }
    }

    /// Finish an in-flight response write, then fall back to the state the
    /// response implies.
    fn drive_in_write(&mut self, slot: usize) {
        let step = self.conns[slot].write_step();
        match step {
            IoStep::Done => {
                let conn = &mut self.conns[slot];
                if conn.state == InState::AuthorityOut {
                    conn.state = InState::AuthorityPending;
                } else {
                    conn.reset_to_in_cmd();
                }
            }
            IoStep::Again => {}
            IoStep::Failed => self.free_in(slot),
        }
    }

    fn reply_success(&mut self, slot: usize) {
        self.conns[slot].start_out(InState::OutSuccess, vec![0]);
        self.drive_in_write(slot);
    }

    fn reply_vote(&mut self, slot: usize, granted: bool) {
        let mut frame = Vec::with_capacity(VOTE_RES_SIZE);
        frame.put_u64(self.current_term);
        frame.put_u8(granted as u8);
        self.conns[slot].start_out(InState::VoteOut, frame);
        self.drive_in_write(slot);
    }

    fn reply_recv_entry(&mut self, slot: usize) {
        let mut frame = Vec::with_capacity(APPEND_RES_SIZE);
        frame.put_u64(self.current_term);
        frame.put_u8(self.server_warmed_up() as u8);
        self.conns[slot].start_out(InState::RecvEntryOut, frame);
        self.drive_in_write(slot);
    }

    fn reply_authority(&mut self, slot: usize) {
        let conn = &mut self.conns[slot];
        let mut frame = Vec::with_capacity(16);
        frame.put_u64(self.log.version);
        frame.put_u64(conn.authority_succeed);
        conn.authority_succeed = 0;
        conn.start_out(InState::AuthorityOut, frame);
        self.drive_in_write(slot);
    }

    fn handle_vote_req(&mut self, slot: usize) {
        let (candidate_id, term, log_index, log_term) = {
            let mut buf = &self.conns[slot].hdr[1..VOTE_REQ_SIZE];
            (buf.get_u32(), buf.get_u64(), buf.get_u64(), buf.get_u64())
        };

        // Raft §6: within the minimum election timeout of hearing from a
        // leader, neither update the term nor grant the vote.
        let leader_known = match &self.role {
            Role::Leader(_) => true,
            Role::Follower(f) => f.leader != 0,
            Role::Candidate(_) => false,
        };
        if leader_known {
            self.reply_vote(slot, false);
            return;
        }

        if term > self.current_term {
            self.increase_term(term);
        }

        let current_term = self.current_term;
        let up_to_date = self.log.at_least_up_to_date(log_index, log_term);
        let grant = match &mut self.role {
            Role::Follower(f)
                if term >= current_term
                    && (f.voted_for == 0 || f.voted_for == candidate_id)
                    && up_to_date =>
            {
                debug_assert_eq!(f.leader, 0);
                f.voted_for = candidate_id;
                true
            }
            _ => false,
        };
        if grant {
            self.reset_timer();
            debug!(candidate_id, term, "vote granted");
        }
        self.reply_vote(slot, grant);
    }

    fn handle_heartbeat(&mut self, slot: usize) {
        let term = {
            let mut buf = &self.conns[slot].hdr[1..HEARTBEAT_SIZE];
            buf.get_u64()
        };

        if term > self.current_term {
            self.increase_term(term);
        }
        if term == self.current_term {
            if !matches!(self.role, Role::Follower(_)) {
                self.convert_to_follower();
            }
            self.reset_timer();
        }
        self.reply_recv_entry(slot);
    }

    fn start_recv_log(&mut self, slot: usize) {
        let Some(hdr) = AppendHdr::decode(&self.conns[slot].hdr) else {
            self.free_in(slot);
            return;
        };
        let count = hdr.machines_size / MACHINE_WIRE_SIZE as u64;
        if hdr.machines_size % MACHINE_WIRE_SIZE as u64 != 0
            || count > machine::MACHINES_MAX
            || u64::from(hdr.new_n) > count
        {
            self.free_in(slot);
            return;
        }

        let conn = &mut self.conns[slot];
        conn.append = Some(hdr);
        conn.payload = vec![0; hdr.machines_size as usize];
        conn.payload_read = 0;
        conn.state = InState::RecvLogIn;
        self.state_recv_log_in(slot);
    }

    /// The replicated record is fully here: follow the leader.
    fn state_recv_log_in(&mut self, slot: usize) {
        match self.conns[slot].read_payload_step() {
            IoStep::Done => {}
            IoStep::Again => return,
            IoStep::Failed => {
                self.free_in(slot);
                return;
            }
        }

        let hdr = self.conns[slot].append.expect("log header");
        if hdr.term < self.current_term {
            self.reply_recv_entry(slot);
            return;
        }

        if self.log.index == 0 {
            self.set_timer(hdr.follower);
        }
        if hdr.term > self.current_term {
            self.increase_term(hdr.term);
        } else if !matches!(self.role, Role::Follower(_)) {
            self.convert_to_follower();
        }

        self.id = hdr.follower;
        if let Role::Follower(f) = &mut self.role {
            f.leader = hdr.leader;
        }
        self.reset_timer();

        let machines = machine::decode_machines(&self.conns[slot].payload);
        let old_n = machines.len() as u32 - hdr.new_n;
        self.log = Rc::new(Log {
            index: hdr.log_index,
            term: hdr.log_term,
            version: hdr.version,
            next_machine_version: hdr.next_machine_version,
            next_machine_id: hdr.next_machine_id,
            kind: hdr.kind,
            old_n,
            new_n: hdr.new_n,
            distinct_machines_n: hdr.distinct_machines_n,
            machines,
        });
        debug!(
            index = self.log.index,
            version = self.log.version,
            "adopted replicated configuration"
        );

        self.reply_recv_entry(slot);
    }

    fn start_cluster_read(&mut self, slot: usize, init: bool) {
        let (machines_size, preread) = {
            let conn = &self.conns[slot];
            let mut buf = &conn.hdr[1..CLUSTER_REQ_SIZE];
            (buf.get_u64(), conn.hdr_read - CLUSTER_REQ_SIZE)
        };
        if !machine::machines_size_valid(machines_size) {
            self.free_in(slot);
            return;
        }

        let change_old_n = self.log.old_n;
        let conn = &mut self.conns[slot];
        conn.payload = vec![0; machines_size as usize];
        conn.payload[..preread].copy_from_slice(&conn.hdr[CLUSTER_REQ_SIZE..CLUSTER_REQ_SIZE + preread]);
        conn.payload_read = preread;
        conn.change_old_n = change_old_n;
        conn.state = if init {
            InState::InitClusterIn
        } else {
            InState::ChangeClusterIn
        };
        if init {
            self.state_init_cluster_in(slot);
        } else {
            self.state_change_cluster_in(slot);
        }
    }

    /// Bootstrap: only a blank server takes it, and it makes this node the
    /// first leader. The reply is the success byte either way.
    fn state_init_cluster_in(&mut self, slot: usize) {
        match self.conns[slot].read_payload_step() {
            IoStep::Done => {}
            IoStep::Again => return,
            IoStep::Failed => {
                self.free_in(slot);
                return;
            }
        }

        if self.log.index == 0 {
            let machines = machine::decode_machines(&self.conns[slot].payload);
            match Log::init(machines) {
                Ok(log) => {
                    info!(machines = log.old_n, "cluster initialized, assuming leadership");
                    self.id = 1;
                    self.current_term = 1;
                    self.set_timer(1);
                    self.role = Role::Leader(LeaderState {
                        commit_required_old: 0,
                        commit_required_new: 0,
                        replicate_round: 0,
                        replicate: true,
                        committed: true,
                        available: true,
                    });
                    self.leader_replace_log(Rc::new(log));
                }
                Err(e) => debug!("cluster init rejected: {e}"),
            }
        }
        self.reply_success(slot);
    }

    /// Reconfiguration: build and adopt the joint record; validation
    /// failures drop the proposal but still answer the success byte.
    fn state_change_cluster_in(&mut self, slot: usize) {
        match self.conns[slot].read_payload_step() {
            IoStep::Done => {}
            IoStep::Again => return,
            IoStep::Failed => {
                self.free_in(slot);
                return;
            }
        }

        let acceptable = matches!(self.role, Role::Leader(_))
            && self.log.kind == LogKind::Old
            && self.log.old_n == self.conns[slot].change_old_n;
        if acceptable {
            let proposal = machine::decode_machines(&self.conns[slot].payload);
            match Log::change(&self.log, proposal, self.current_term) {
                Ok(joint) => {
                    info!(kind = ?joint.kind, "adopting reconfiguration");
                    self.leader_replace_log(Rc::new(joint));
                }
                Err(e) => debug!("reconfiguration rejected: {e}"),
            }
        }
        self.reply_success(slot);
    }

    fn handle_leader_query(&mut self, slot: usize) {
        let leader_id = match &self.role {
            Role::Leader(_) => self.id,
            Role::Follower(f) => f.leader,
            Role::Candidate(_) => 0,
        };

        let mut frame = Vec::with_capacity(peer::LEADER_RES_SIZE);
        // A leader mid-reconfiguration may be outside its own machine list.
        match (leader_id > 0).then(|| self.log.find(leader_id)).flatten() {
            Some(machine) => {
                frame.put_slice(&machine.addr.octets());
                frame.put_u16(machine.port);
                frame.put_u8(0);
            }
            None => {
                frame.put_slice(&[0; 16]);
                frame.put_u16(0);
                frame.put_u8(1);
            }
        }
        self.conns[slot].start_out(InState::LeaderOut, frame);
        self.drive_in_write(slot);
    }

    fn handle_cluster_query(&mut self, slot: usize) {
        let machines_size = self.log.old_n as usize * MACHINE_WIRE_SIZE;
        let mut frame = Vec::with_capacity(peer::CLUSTER_RES_SIZE + machines_size);
        frame.put_u8(self.log.kind as u8);
        frame.put_u64(machines_size as u64);
        frame.put_u64(self.log.version);
        machine::encode_machines(self.log.old_half(), &mut frame);

        self.conns[slot].start_out(InState::ClusterOut, frame);
        self.drive_in_write(slot);
    }

    /// Promote a raft-port connection into the data plane.
    fn handle_connect(&mut self, slot: usize) {
        let shard = {
            let mut buf = &self.conns[slot].hdr[1..CONNECT_REQ_SIZE];
            buf.get_u32()
        };
        match self.workers.get(shard as usize).cloned() {
            Some(worker) => {
                let mut conn = self.conns.remove(slot);
                let _ = self.poll.registry().deregister(&mut conn.stream);
                debug!(shard, "promoting connection to the data plane");
                worker.dispatch(conn.stream);
            }
            None => self.free_in(slot),
        }
    }

    fn handle_authority_open(&mut self, slot: usize) {
        let extra = (self.conns[slot].hdr_read - 1) as u64;
        let conn = &mut self.conns[slot];
        conn.authority_pending = extra;
        conn.authority_processing = 0;
        conn.authority_succeed = 0;
        if extra > 0 {
            if let Role::Leader(leader) = &mut self.role {
                leader.replicate = true;
            }
        }
        self.reply_authority(slot);
    }

    /// Count streamed authority tokens.
    fn authority_absorb(&mut self, slot: usize) -> bool {
        match self.conns[slot].discard_count() {
            Ok(n) => {
                self.conns[slot].authority_pending += n;
                if n > 0 {
                    if let Role::Leader(leader) = &mut self.role {
                        leader.replicate = true;
                    }
                }
                true
            }
            Err(()) => {
                self.free_in(slot);
                false
            }
        }
    }

    /// The current round committed under the current term: report to every
    /// authority stream what it had riding on it.
    fn authority_approved(&mut self) {
        if let Role::Leader(leader) = &mut self.role {
            leader.committed = true;
        }
        let slots: Vec<usize> = self
            .conns
            .iter()
            .filter(|(_, c)| c.is_authority())
            .map(|(slot, _)| slot)
            .collect();
        for slot in slots {
            let ready = {
                let conn = &mut self.conns[slot];
                conn.authority_succeed += conn.authority_processing;
                conn.authority_processing = 0;
                conn.state == InState::AuthorityPending && conn.authority_succeed > 0
            };
            if ready {
                self.reply_authority(slot);
            }
        }
    }

    fn state_in_cmd(&mut self, slot: usize) {
        while self.conns[slot].hdr_read < HDR_MAX {
            match self.conns[slot].read_hdr_step() {
                IoStep::Done => {}
                IoStep::Again => break,
                IoStep::Failed => {
                    self.free_in(slot);
                    return;
                }
            }
        }

        let (cmd, admin, read) = {
            let conn = &self.conns[slot];
            if conn.hdr_read == 0 {
                return;
            }
            (conn.hdr[0], conn.admin, conn.hdr_read)
        };
        if !admin && cmd < peer::CMD_ADMIN_DIVIDER {
            debug!(cmd, "peer command on the public channel");
            self.free_in(slot);
            return;
        }

        match cmd {
            peer::CMD_REQUEST_VOTE => match read.cmp(&VOTE_REQ_SIZE) {
                std::cmp::Ordering::Less => {}
                std::cmp::Ordering::Equal => self.handle_vote_req(slot),
                std::cmp::Ordering::Greater => self.free_in(slot),
            },
            peer::CMD_APPEND_LOG => {
                if read == HDR_MAX {
                    self.start_recv_log(slot);
                }
            }
            peer::CMD_HEARTBEAT => match read.cmp(&HEARTBEAT_SIZE) {
                std::cmp::Ordering::Less => {}
                std::cmp::Ordering::Equal => self.handle_heartbeat(slot),
                std::cmp::Ordering::Greater => self.free_in(slot),
            },
            peer::CMD_INIT_CLUSTER | peer::CMD_CHANGE_CLUSTER => {
                if read >= CLUSTER_REQ_SIZE {
                    self.start_cluster_read(slot, cmd == peer::CMD_INIT_CLUSTER);
                }
            }
            peer::CMD_LEADER => {
                if read == 1 {
                    self.handle_leader_query(slot);
                } else {
                    self.free_in(slot);
                }
            }
            peer::CMD_CLUSTER => {
                if read == 1 {
                    self.handle_cluster_query(slot);
                } else {
                    self.free_in(slot);
                }
            }
            peer::CMD_CONNECT => match read.cmp(&CONNECT_REQ_SIZE) {
                std::cmp::Ordering::Less => {}
                std::cmp::Ordering::Equal => self.handle_connect(slot),
                std::cmp::Ordering::Greater => self.free_in(slot),
            },
            peer::CMD_AUTHORITY => self.handle_authority_open(slot),
            _ => {
                debug!(cmd, "unrecognized command");
                self.free_in(slot);
            }
        }
    }

    fn process_in(&mut self, slot: usize) {
        match self.conns[slot].state {
            InState::InCmd => self.state_in_cmd(slot),
            InState::RecvLogIn => self.state_recv_log_in(slot),
            InState::InitClusterIn => self.state_init_cluster_in(slot),
            InState::ChangeClusterIn => self.state_change_cluster_in(slot),
            InState::AuthorityPending => {
                self.authority_absorb(slot);
            }
            InState::AuthorityOut => {
                if self.authority_absorb(slot) {
                    self.drive_in_write(slot);
                }
            }
            InState::OutSuccess
            | InState::VoteOut
            | InState::RecvEntryOut
            | InState::LeaderOut
            | InState::ClusterOut => self.drive_in_write(slot),
        }
    }

    // --- outgoing processing ---------------------------------------------

    fn process_out(&mut self, idx: usize) {
        let state = self.member_conn_state(idx);
        match state {
            PeerState::InProgress => {
                let connected = {
                    let member = &mut self.cluster.as_mut().unwrap().members[idx];
                    let stream = member.conn.stream.as_ref().unwrap();
                    match stream.take_error() {
                        Ok(None) => stream.peer_addr().is_ok(),
                        _ => {
                            member.conn.clear();
                            return;
                        }
                    }
                };
                if connected {
                    match &self.role {
                        Role::Leader(_) => self.append_entry_out(idx),
                        Role::Candidate(_) => self.request_vote_out(idx),
                        Role::Follower(_) => {
                            self.cluster.as_mut().unwrap().members[idx].conn.state =
                                PeerState::Ready;
                        }
                    }
                }
            }
            PeerState::VoteOut | PeerState::AppendOut | PeerState::HeartbeatOut => {
                self.drive_peer_write(idx);
            }
            PeerState::VoteIn => {
                match self.cluster.as_mut().unwrap().members[idx]
                    .conn
                    .read_step(VOTE_RES_SIZE)
                {
                    IoStep::Done => self.handle_vote_res(idx),
                    IoStep::Again => {}
                    IoStep::Failed => self.cluster.as_mut().unwrap().members[idx].conn.clear(),
                }
            }
            PeerState::AppendIn | PeerState::HeartbeatIn => {
                match self.cluster.as_mut().unwrap().members[idx]
                    .conn
                    .read_step(APPEND_RES_SIZE)
                {
                    IoStep::Done => self.handle_append_res(idx, state == PeerState::AppendIn),
                    IoStep::Again => {}
                    IoStep::Failed => self.cluster.as_mut().unwrap().members[idx].conn.clear(),
                }
            }
            PeerState::NotConnected | PeerState::Ready => {}
        }
    }

    // --- main loop --------------------------------------------------------

    pub fn run(mut self) {
        let mut events = Events::with_capacity(512);
        loop {
            if self.user_listener.is_none() || self.admin_listener.is_none() {
                std::thread::sleep(RELISTEN_BACKOFF);
                self.relisten();
            }

            let timeout = if self.user_listener.is_none() || self.admin_listener.is_none() {
                Some(Duration::ZERO)
            } else {
                self.timer
                    .as_ref()
                    .map(|t| t.next.saturating_duration_since(Instant::now()))
            };
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                panic!("raft poll failed: {e}");
            }

            for event in events.iter() {
                match event.token() {
                    USER_LISTENER => self.accept_pending(false),
                    ADMIN_LISTENER => self.accept_pending(true),
                    token if token.0 & OUT_FLAG != 0 => {
                        let (generation, idx) = decode_out_token(token);
                        let live = self
                            .cluster
                            .as_ref()
                            .is_some_and(|c| c.generation == generation && idx < c.members.len());
                        if !live {
                            continue;
                        }
                        if event.is_error() {
                            self.cluster.as_mut().unwrap().members[idx].conn.clear();
                        } else if self
                            .member_conn_state(idx)
                            .runnable(event.is_readable(), event.is_writable())
                        {
                            self.process_out(idx);
                        }
                    }
                    Token(slot) => {
                        if !self.conns.contains(slot) {
                            continue;
                        }
                        if event.is_error() {
                            self.free_in(slot);
                        } else if self.conns[slot]
                            .state
                            .runnable(event.is_readable(), event.is_writable())
                        {
                            self.process_in(slot);
                        }
                    }
                }
            }

            if let Some(timer) = self.timer.as_ref() {
                if Instant::now() >= timer.next {
                    if let Some(timer) = self.timer.as_mut() {
                        timer.next = Instant::now() + timer.tick;
                    }
                    self.timer_ticked();
                }
            }

            if matches!(self.role, Role::Leader(_)) {
                let commit_ready = match &self.role {
                    Role::Leader(l) => {
                        !l.committed && l.commit_required_old <= 0 && l.commit_required_new <= 0
                    }
                    _ => false,
                };
                if commit_ready {
                    self.authority_approved();
                }
                let replicate_due = match &self.role {
                    Role::Leader(l) => l.committed && l.replicate,
                    _ => false,
                };
                if replicate_due {
                    self.replicate_entry();
                }
            } else {
                // Authority approvals are a leader-only service.
                let authority: Vec<usize> = self
                    .conns
                    .iter()
                    .filter(|(_, c)| c.is_authority())
                    .map(|(slot, _)| slot)
                    .collect();
                for slot in authority {
                    self.free_in(slot);
                }
            }

            self.stale_clusters.clear();
        }
    }

    fn relisten(&mut self) {
        let timeout = Duration::from_millis(u64::from(self.config.tcp_timeout_ms));
        if self.user_listener.is_none() {
            if let Ok(mut listener) =
                listen_socket(self.user_addr.port(), self.config.max_conn, timeout)
            {
                if self
                    .poll
                    .registry()
                    .register(&mut listener, USER_LISTENER, Interest::READABLE)
                    .is_ok()
                {
                    self.user_listener = Some(listener);
                }
            }
        }
        if self.admin_listener.is_none() {
            if let Ok(mut listener) =
                listen_socket(self.admin_addr.port(), self.config.max_conn, timeout)
            {
                if self
                    .poll
                    .registry()
                    .register(&mut listener, ADMIN_LISTENER, Interest::READABLE)
                    .is_ok()
                {
                    self.admin_listener = Some(listener);
                }
            }
        }
    }
}

/// Bind and run the membership plane on its own thread; returns the bound
/// peer and admin addresses.
pub fn spawn(
    config: CacheConfig,
    workers: Vec<WorkerHandle>,
) -> Result<(SocketAddr, SocketAddr)> {
    let server = RaftServer::bind(config, workers)?;
    let addrs = (server.user_addr(), server.admin_addr());
    std::thread::Builder::new()
        .name("raft".to_string())
        .spawn(move || server.run())?;
    Ok(addrs)
}
