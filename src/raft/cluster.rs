// Cluster view
//
// A cluster is the view a leader or candidate derives from one log record:
// the non-leader members with their connections and cursors, plus the vote
// thresholds of both configuration halves, pre-decremented for the leader's
// own memberships. Views are immutable in shape; when the log changes a new
// view with a fresh generation replaces the old one, and the old one lives
// on a stale queue until the loop pass ends.

use super::log::Log;
use super::member::{self, Member};

fn majority(n: u32) -> u32 {
    debug_assert!(n > 0);
    n / 2 + 1
}

#[derive(Debug)]
pub struct Cluster {
    /// Stamped into outgoing poll tokens; events from other generations are
    /// stale and dropped.
    pub generation: u64,
    pub require_old_votes: u32,
    pub require_new_votes: u32,
    /// Sorted by id.
    pub members: Vec<Member>,
}

impl Cluster {
    pub fn build(log: &Log, leader: u32, generation: u64) -> Self {
        let leader_in_old = log.find_old(leader).is_some();
        let leader_in_new = log.find_new(leader).is_some();

        let mut require_old_votes = majority(log.old_n);
        if leader_in_old {
            require_old_votes -= 1;
        }
        let require_new_votes = if log.new_n == 0 {
            0
        } else {
            majority(log.new_n) - u32::from(leader_in_new)
        };

        let members = member::members_init(log, leader);
        debug_assert_eq!(
            members.len() as u64,
            log.distinct_machines_n - u64::from(leader_in_old || leader_in_new)
        );

        Self {
            generation,
            require_old_votes,
            require_new_votes,
            members,
        }
    }

    pub fn find(&self, id: u32) -> Option<&Member> {
        self.members
            .binary_search_by_key(&id, |m| m.id)
            .ok()
            .map(|i| &self.members[i])
    }
}
