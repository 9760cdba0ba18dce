// Membership-plane tests over real sockets: bootstrap a cluster on one
// node, query it, and push a grow reconfiguration at it. Peer machines
// point at unroutable addresses, so replication never completes; everything
// asserted here is leader-local state.

use shard_cache::{CacheConfig, CacheServer};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

const CMD_INIT_CLUSTER: u8 = 3;
const CMD_CHANGE_CLUSTER: u8 = 4;
const CMD_LEADER: u8 = 6;
const CMD_CLUSTER: u8 = 7;
const CMD_CONNECT: u8 = 8;
const CMD_AUTHORITY: u8 = 9;

const MACHINE_WIRE_SIZE: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq)]
struct WireMachine {
    addr: [u8; 16],
    port: u16,
    id: u32,
    stability: u64,
    version: u64,
}

impl WireMachine {
    fn fresh(last: u8, port: u16) -> Self {
        let mut addr = [0u8; 16];
        addr[0] = 0xfd;
        addr[15] = last;
        Self {
            addr,
            port,
            id: 0,
            stability: 0,
            version: 0,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.addr);
        out.extend_from_slice(&self.port.to_be_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.stability.to_be_bytes());
        out.extend_from_slice(&self.version.to_be_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            addr: buf[..16].try_into().unwrap(),
            port: u16::from_be_bytes(buf[16..18].try_into().unwrap()),
            id: u32::from_be_bytes(buf[20..24].try_into().unwrap()),
            stability: u64::from_be_bytes(buf[24..32].try_into().unwrap()),
            version: u64::from_be_bytes(buf[32..40].try_into().unwrap()),
        }
    }
}

struct Admin {
    stream: TcpStream,
}

impl Admin {
    fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("::1", port)).expect("raft connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self { stream }
    }

    fn read_exact(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.stream.read_exact(&mut buf).unwrap();
        buf
    }

    fn send_machine_list(&mut self, cmd: u8, machines: &[WireMachine]) {
        let mut frame = vec![cmd];
        frame.extend_from_slice(&((machines.len() * MACHINE_WIRE_SIZE) as u64).to_be_bytes());
        for machine in machines {
            machine.encode(&mut frame);
        }
        self.stream.write_all(&frame).unwrap();
        assert_eq!(self.read_exact(1), vec![0]);
    }

    fn query_leader(&mut self) -> ([u8; 16], u16, bool) {
        self.stream.write_all(&[CMD_LEADER]).unwrap();
        let res = self.read_exact(19);
        (
            res[..16].try_into().unwrap(),
            u16::from_be_bytes(res[16..18].try_into().unwrap()),
            res[18] != 0,
        )
    }

    fn query_cluster(&mut self) -> (u8, u64, Vec<WireMachine>) {
        self.stream.write_all(&[CMD_CLUSTER]).unwrap();
        let header = self.read_exact(17);
        let kind = header[0];
        let machines_size = u64::from_be_bytes(header[1..9].try_into().unwrap());
        let version = u64::from_be_bytes(header[9..17].try_into().unwrap());

        let raw = self.read_exact(machines_size as usize);
        let machines = raw
            .chunks_exact(MACHINE_WIRE_SIZE)
            .map(WireMachine::decode)
            .collect();
        (kind, version, machines)
    }
}

fn start_cluster_node() -> (CacheServer, u16, u16) {
    let config = CacheConfig {
        shards: 1,
        max_conn: 32,
        mem_limit: 8 << 20,
        tcp_timeout_ms: 3000,
        port: 0,
        cluster: true,
        raft_port: 0,
    };
    let server = CacheServer::start(&config).expect("server");
    let workers = server.workers().to_vec();
    let (peer_addr, admin_addr) =
        shard_cache::raft::spawn(config, workers).expect("raft spawn");
    (server, peer_addr.port(), admin_addr.port())
}

fn init_machines() -> Vec<WireMachine> {
    (1..=4).map(|i| WireMachine::fresh(i, 7000 + i as u16)).collect()
}

#[test]
fn test_init_makes_this_node_leader() {
    let (_server, peer_port, admin_port) = start_cluster_node();

    let mut admin = Admin::connect(admin_port);
    admin.send_machine_list(CMD_INIT_CLUSTER, &init_machines());

    // LEADER is a public query; machine id 1 (the first submitted) leads.
    let mut user = Admin::connect(peer_port);
    let (addr, port, lost) = user.query_leader();
    assert!(!lost);
    assert_eq!(addr, WireMachine::fresh(1, 7001).addr);
    assert_eq!(port, 7001);

    let (kind, version, machines) = user.query_cluster();
    assert_eq!(kind, 0, "stable OLD log");
    assert_eq!(version, 1);
    assert_eq!(machines.len(), 4);
    // Identities are monotonic and the list is address-sorted.
    let mut ids: Vec<u32> = machines.iter().map(|m| m.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    let addrs: Vec<[u8; 16]> = machines.iter().map(|m| m.addr).collect();
    let mut sorted = addrs.clone();
    sorted.sort();
    assert_eq!(addrs, sorted);
    assert!(machines.iter().all(|m| m.stability & 1 == 1));
}

#[test]
fn test_init_is_idempotent_against_running_cluster() {
    let (_server, peer_port, admin_port) = start_cluster_node();

    let mut admin = Admin::connect(admin_port);
    admin.send_machine_list(CMD_INIT_CLUSTER, &init_machines());

    // A second init is acknowledged but changes nothing.
    let mut again = Admin::connect(admin_port);
    let other: Vec<WireMachine> = (10..14)
        .map(|i| WireMachine::fresh(i, 8000 + u16::from(i)))
        .collect();
    again.send_machine_list(CMD_INIT_CLUSTER, &other);

    let mut user = Admin::connect(peer_port);
    let (_, version, machines) = user.query_cluster();
    assert_eq!(version, 1);
    assert_eq!(machines[0].addr[0], 0xfd);
    assert!(machines.iter().all(|m| m.port < 8000));
}

#[test]
fn test_grow_proposal_is_adopted_as_joint_log() {
    let (_server, peer_port, admin_port) = start_cluster_node();

    let mut admin = Admin::connect(admin_port);
    admin.send_machine_list(CMD_INIT_CLUSTER, &init_machines());

    let mut user = Admin::connect(peer_port);
    let (_, _, current) = user.query_cluster();

    // Echo the cluster and double it.
    let mut proposal = current.clone();
    proposal.extend((5..=8).map(|i| WireMachine::fresh(i, 7000 + u16::from(i))));
    admin.send_machine_list(CMD_CHANGE_CLUSTER, &proposal);

    // The joint GROW record is now the leader's log; its old half is still
    // the four-machine configuration.
    let (kind, version, machines) = user.query_cluster();
    assert_eq!(kind, 3, "joint GROW log");
    assert_eq!(version, 1);
    assert_eq!(machines.len(), 4);
    assert_eq!(machines, current);
}

#[test]
fn test_wrong_size_change_is_dropped() {
    let (_server, peer_port, admin_port) = start_cluster_node();

    let mut admin = Admin::connect(admin_port);
    admin.send_machine_list(CMD_INIT_CLUSTER, &init_machines());

    let mut user = Admin::connect(peer_port);
    let (_, _, current) = user.query_cluster();

    // Tripling is not a legal reconfiguration; the proposal dies quietly.
    let mut proposal = current.clone();
    proposal.extend((5..=12).map(|i| WireMachine::fresh(i, 7000 + u16::from(i))));
    // 12 machines is a valid wire size (power of two is required, 12 is
    // not) so the frame itself is rejected before parsing.
    let mut frame = vec![CMD_CHANGE_CLUSTER];
    frame.extend_from_slice(&((proposal.len() * MACHINE_WIRE_SIZE) as u64).to_be_bytes());
    for machine in &proposal {
        machine.encode(&mut frame);
    }
    admin.stream.write_all(&frame).unwrap();

    // The connection is dropped for the malformed size.
    let mut probe = [0u8; 1];
    match admin.stream.read(&mut probe) {
        Ok(0) => {}
        Ok(_) => panic!("malformed change was answered"),
        Err(_) => {}
    }

    let (kind, _, _) = user.query_cluster();
    assert_eq!(kind, 0, "log unchanged");
}

#[test]
fn test_peer_commands_rejected_on_public_channel() {
    let (_server, peer_port, admin_port) = start_cluster_node();
    let _ = admin_port;

    let mut user = Admin::connect(peer_port);
    let mut frame = vec![CMD_INIT_CLUSTER];
    frame.extend_from_slice(&160u64.to_be_bytes());
    user.stream.write_all(&frame).unwrap();

    let mut probe = [0u8; 1];
    match user.stream.read(&mut probe) {
        Ok(0) => {}
        Ok(_) => panic!("admin command served on the public channel"),
        Err(_) => {}
    }
}

#[test]
fn test_authority_stream_reports_version() {
    let (_server, peer_port, admin_port) = start_cluster_node();

    let mut admin = Admin::connect(admin_port);
    admin.send_machine_list(CMD_INIT_CLUSTER, &init_machines());

    let mut authority = Admin::connect(peer_port);
    authority.stream.write_all(&[CMD_AUTHORITY]).unwrap();
    let res = authority.read_exact(16);
    let version = u64::from_be_bytes(res[..8].try_into().unwrap());
    let count = u64::from_be_bytes(res[8..16].try_into().unwrap());
    assert_eq!(version, 1);
    assert_eq!(count, 0);
}

#[test]
fn test_connect_promotes_to_data_plane() {
    let (_server, peer_port, _admin_port) = start_cluster_node();

    let stream = TcpStream::connect(("::1", peer_port)).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut stream = stream;
    let mut frame = vec![CMD_CONNECT];
    frame.extend_from_slice(&0u32.to_be_bytes());
    stream.write_all(&frame).unwrap();

    // The shard adopts the connection and sends its ack byte; after that
    // the normal cache protocol runs.
    let mut ack = [0u8; 1];
    stream.read_exact(&mut ack).unwrap();
    assert_eq!(ack[0], 0);

    stream.write_all(&[0x00, 0x03]).unwrap();
    stream.write_all(b"key").unwrap();
    let mut header = [0u8; 9];
    stream.read_exact(&mut header).unwrap();
    assert_eq!(header[8], 1, "fresh key misses");
    stream.write_all(&0u64.to_be_bytes()).unwrap();
    let mut status = [0u8; 1];
    stream.read_exact(&mut status).unwrap();
    assert_eq!(status[0], 0);
}
