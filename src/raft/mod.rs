// # Membership plane
//
// Raft over the cluster configuration only: values are never replicated,
// the log is the member list itself, and reconfiguration runs through joint
// consensus. One thread owns the whole plane; shards interact with it only
// through their warmed-up flags and the connections it promotes to them.

pub mod cluster;
pub mod log;
pub mod machine;
pub mod member;
pub mod peer;
pub mod server;

pub use cluster::Cluster;
pub use log::{Log, LogKind, LogRef};
pub use machine::Machine;
pub use member::Member;
pub use server::{spawn, RaftServer};
