// Membership log
//
// A log record is an immutable snapshot of the cluster configuration:
// identity counters, a type encoding where in the joint-consensus dance the
// record stands, and the machine array (old half plus, for joint records,
// the proposed half). Records are shared by reference count; replication,
// queries and the server itself hold clones of the same `Rc`.
//
// The type byte layers two masks over eight values: UNSTABLE marks records
// that still need a commit in the current term before a stable successor
// can be cut, and JOINT marks records whose commit changes the member set.

use super::machine::{self, Machine};
use crate::error::{CacheError, Result};
use std::rc::Rc;

pub const UNSTABLE_MASK: u8 = 0b1110;
pub const JOINT_MASK: u8 = 0b0010;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Old = 0,
    GrowTransform = 1,
    Adjust = 2,
    Grow = 3,
    ChangeAvailable = 4,
    GrowChangeAvailable = 5,
    Shrink = 6,
    GrowComplete = 8,
}

impl LogKind {
    pub fn from_wire(byte: u8) -> Option<LogKind> {
        match byte {
            0 => Some(LogKind::Old),
            1 => Some(LogKind::GrowTransform),
            2 => Some(LogKind::Adjust),
            3 => Some(LogKind::Grow),
            4 => Some(LogKind::ChangeAvailable),
            5 => Some(LogKind::GrowChangeAvailable),
            6 => Some(LogKind::Shrink),
            8 => Some(LogKind::GrowComplete),
            _ => None,
        }
    }

    /// Records that await a commit before they can be made stable.
    pub fn unstable(self) -> bool {
        self as u8 & UNSTABLE_MASK != 0
    }

    /// Records whose commit changes the member set.
    pub fn joint(self) -> bool {
        self as u8 & JOINT_MASK != 0
    }

    /// The type the stable successor carries.
    pub fn stable_kind(self) -> LogKind {
        match self as u8 & !UNSTABLE_MASK {
            0 => LogKind::Old,
            _ => LogKind::GrowTransform,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Log {
    pub index: u64,
    pub term: u64,
    pub version: u64,
    pub next_machine_version: u64,
    pub next_machine_id: u32,
    pub kind: LogKind,
    pub old_n: u32,
    pub new_n: u32,
    pub distinct_machines_n: u64,
    /// `old_n + new_n` machines; each half sorted by address.
    pub machines: Vec<Machine>,
}

pub type LogRef = Rc<Log>;

/// Builder state while assigning identities to fresh machines.
struct Minting {
    next_machine_version: u64,
    next_machine_id: u32,
}

impl Minting {
    fn reversion(&mut self, machine: &mut Machine) {
        machine.version = self.next_machine_version;
        self.next_machine_version += 1;
    }

    fn mint(&mut self, machine: &mut Machine) {
        machine.id = self.next_machine_id;
        self.next_machine_id += 1;
        machine.set_availability(true);
        self.reversion(machine);
    }
}

impl Log {
    /// The blank pre-init record: index zero, nothing in it.
    pub fn empty() -> LogRef {
        Rc::new(Self {
            index: 0,
            term: 0,
            version: 0,
            next_machine_version: 0,
            next_machine_id: 0,
            kind: LogKind::Old,
            old_n: 0,
            new_n: 0,
            distinct_machines_n: 0,
            machines: Vec::new(),
        })
    }

    pub fn old_half(&self) -> &[Machine] {
        &self.machines[..self.old_n as usize]
    }

    pub fn new_half(&self) -> &[Machine] {
        &self.machines[self.old_n as usize..]
    }

    pub fn find(&self, id: u32) -> Option<&Machine> {
        machine::find_by_id(&self.machines, id)
    }

    pub fn find_old(&self, id: u32) -> Option<&Machine> {
        machine::find_by_id(self.old_half(), id)
    }

    pub fn find_new(&self, id: u32) -> Option<&Machine> {
        machine::find_by_id(self.new_half(), id)
    }

    /// Raft §5.4.1: a candidate at (`index`, `term`) is electable against
    /// this log if its last entry wins by term, or ties and is as long.
    pub fn at_least_up_to_date(&self, index: u64, term: u64) -> bool {
        term > self.term || (term == self.term && index >= self.index)
    }

    /// The genesis record: mint identities, sort, reject duplicates.
    pub fn init(mut machines: Vec<Machine>) -> Result<Log> {
        let mut minting = Minting {
            next_machine_version: 1,
            next_machine_id: 1,
        };
        for machine in machines.iter_mut() {
            minting.mint(machine);
        }
        machine::sort_by_addr(&mut machines);
        if machine::has_duplicate_addr(&machines) {
            return Err(CacheError::Cluster(
                "initial machine list has duplicate addresses".to_string(),
            ));
        }

        let n = machines.len() as u32;
        Ok(Self {
            index: 1,
            term: 1,
            version: 1,
            next_machine_version: minting.next_machine_version,
            next_machine_id: minting.next_machine_id,
            kind: LogKind::Old,
            old_n: n,
            new_n: 0,
            distinct_machines_n: u64::from(n),
            machines,
        })
    }

    /// Promote a committed unstable record: drop the old half, advance index
    /// and version.
    pub fn stable(unstable: &Log) -> Log {
        debug_assert!(unstable.kind.unstable());
        Self {
            index: unstable.index + 1,
            term: unstable.term,
            version: unstable.version + 1,
            next_machine_version: unstable.next_machine_version,
            next_machine_id: unstable.next_machine_id,
            kind: unstable.kind.stable_kind(),
            old_n: unstable.new_n,
            new_n: 0,
            distinct_machines_n: u64::from(unstable.new_n),
            machines: unstable.new_half().to_vec(),
        }
    }

    fn unstable_header(old: &Log, term: u64, kind: LogKind, machines: Vec<Machine>) -> Log {
        let old_n = old.old_n;
        let new_n = machines.len() as u32 - old_n;
        Self {
            index: old.index + 1,
            term,
            version: old.version,
            next_machine_version: old.next_machine_version,
            next_machine_id: old.next_machine_id,
            kind,
            old_n,
            new_n,
            distinct_machines_n: 0,
            machines,
        }
    }

    /// A committed GROW_TRANSFORM spawns its completion: both halves carry
    /// the same machines, with the lower address half handed new versions.
    pub fn grow_complete(transform: &Log, term: u64) -> Log {
        debug_assert_eq!(transform.kind, LogKind::GrowTransform);
        let n = transform.old_n as usize;
        let mut machines = Vec::with_capacity(2 * n);
        machines.extend_from_slice(transform.old_half());
        machines.extend_from_slice(transform.old_half());

        let mut log = Self::unstable_header(transform, term, LogKind::GrowComplete, machines);
        let mut minting = Minting {
            next_machine_version: log.next_machine_version,
            next_machine_id: log.next_machine_id,
        };
        for machine in &mut log.machines[n..n + n / 2] {
            minting.reversion(machine);
        }
        log.next_machine_version = minting.next_machine_version;
        log.distinct_machines_n = n as u64;
        log
    }

    /// Build the joint record for a proposed configuration: same size means
    /// ADJUST, half means SHRINK, double means GROW; anything else is
    /// rejected, as is any proposal that fails its shape's validation.
    pub fn change(old: &Log, proposal: Vec<Machine>, term: u64) -> Result<Log> {
        let old_n = old.old_n as usize;
        let new_n = proposal.len();

        let mut machines = Vec::with_capacity(old_n + new_n);
        machines.extend_from_slice(old.old_half());
        machines.extend(proposal);

        if new_n == old_n {
            let mut log = Self::unstable_header(old, term, LogKind::Adjust, machines);
            log.complete_adjust()?;
            Ok(log)
        } else if old_n >= 2 && new_n == old_n >> 1 {
            let mut log = Self::unstable_header(old, term, LogKind::Shrink, machines);
            log.complete_shrink()?;
            Ok(log)
        } else if new_n == old_n << 1 {
            let mut log = Self::unstable_header(old, term, LogKind::Grow, machines);
            log.complete_grow()?;
            Ok(log)
        } else {
            Err(CacheError::Cluster(format!(
                "proposal of {new_n} machines cannot follow a cluster of {old_n}"
            )))
        }
    }

    /// ADJUST: machines present in the old configuration keep their
    /// identity, fresh addresses are minted, and every machine whose data
    /// responsibility moves gets a new version. At least half must be kept,
    /// and keeping everything is not a change.
    fn complete_adjust(&mut self) -> Result<()> {
        let n = self.old_n as usize;
        let mut minting = Minting {
            next_machine_version: self.next_machine_version,
            next_machine_id: self.next_machine_id,
        };

        let (old_half, proposal) = self.machines.split_at_mut(n);
        machine::sort_by_addr(proposal);

        let mut keeps = 0;
        let mut added = 0;
        for i in 0..n {
            if proposal[i].addr_key() == old_half[i].addr_key() {
                proposal[i] = old_half[i];
                keeps += 1;
            } else if let Some(j) = machine::search_by_addr(old_half, &proposal[i]) {
                proposal[i] = old_half[j];
            } else {
                minting.mint(&mut proposal[i]);
                added += 1;
            }
        }
        if keeps == n {
            return Err(CacheError::Cluster("adjust changes nothing".to_string()));
        }
        if keeps < n / 2 {
            return Err(CacheError::Cluster(
                "adjust keeps less than half of the cluster".to_string(),
            ));
        }

        let mut check = proposal.to_vec();
        machine::sort_by_addr(&mut check);
        if machine::has_duplicate_addr(&check) {
            return Err(CacheError::Cluster(
                "adjust proposal has duplicate addresses".to_string(),
            ));
        }

        // Version upgrades ripple backwards from every replaced slot until
        // an available kept machine stops them.
        let mut lead = 0;
        while lead < n && proposal[lead].id == old_half[lead].id && !old_half[lead].available() {
            lead += 1;
        }
        let mut upgrade = lead < n && proposal[lead].id != old_half[lead].id;
        for i in (0..n).rev() {
            if proposal[i].id != old_half[i].id {
                upgrade = true;
            } else if proposal[i].available() {
                upgrade = false;
            }
            if upgrade {
                minting.reversion(&mut proposal[i]);
            }
        }

        self.next_machine_version = minting.next_machine_version;
        self.next_machine_id = minting.next_machine_id;
        self.distinct_machines_n = (n + added) as u64;
        Ok(())
    }

    /// SHRINK: the survivors must be exactly the leading half of the old
    /// configuration, byte for byte.
    fn complete_shrink(&mut self) -> Result<()> {
        let keep = self.new_n as usize;
        if self.new_half() != &self.old_half()[..keep] {
            return Err(CacheError::Cluster(
                "shrink must keep the leading half of the cluster".to_string(),
            ));
        }
        self.distinct_machines_n = u64::from(self.old_n);
        Ok(())
    }

    /// GROW: the proposal's first half must echo the old configuration and
    /// the added half must be fresh, duplicate-free addresses.
    fn complete_grow(&mut self) -> Result<()> {
        let n = self.old_n as usize;
        let mut minting = Minting {
            next_machine_version: self.next_machine_version,
            next_machine_id: self.next_machine_id,
        };

        if self.new_half()[..n] != *self.old_half() {
            return Err(CacheError::Cluster(
                "grow proposal must echo the current cluster".to_string(),
            ));
        }

        let added_at = 2 * n;
        machine::sort_by_addr(&mut self.machines[added_at..]);
        if machine::has_duplicate_addr(&self.machines[added_at..]) {
            return Err(CacheError::Cluster(
                "grow proposal has duplicate addresses".to_string(),
            ));
        }

        // Sorted merge walk: any address in both halves is a conflict.
        {
            let (head, added) = self.machines.split_at(added_at);
            let old_half = &head[..n];
            let mut i = 0;
            let mut j = 0;
            while i < n && j < n {
                match old_half[i].addr_key().cmp(&added[j].addr_key()) {
                    std::cmp::Ordering::Less => i += 1,
                    std::cmp::Ordering::Greater => j += 1,
                    std::cmp::Ordering::Equal => {
                        return Err(CacheError::Cluster(
                            "grow proposal reuses an existing address".to_string(),
                        ))
                    }
                }
            }
        }

        for machine in &mut self.machines[added_at..] {
            minting.mint(machine);
        }
        self.next_machine_version = minting.next_machine_version;
        self.next_machine_id = minting.next_machine_id;
        self.distinct_machines_n = u64::from(self.new_n);
        Ok(())
    }

    /// Availability update: the new half copies the old configuration with
    /// stability flipped to what the leader observed; machines whose
    /// availability changed (and runs ending at them) get new versions.
    pub fn change_available(
        old: &Log,
        term: u64,
        desired: impl Fn(&Machine) -> bool,
    ) -> Log {
        debug_assert!(matches!(
            old.kind,
            LogKind::Old | LogKind::GrowTransform
        ));
        let kind = if old.kind == LogKind::Old {
            LogKind::ChangeAvailable
        } else {
            LogKind::GrowChangeAvailable
        };

        let n = old.old_n as usize;
        let mut machines = Vec::with_capacity(2 * n);
        machines.extend_from_slice(old.old_half());
        machines.extend_from_slice(old.old_half());
        for machine in &mut machines[n..] {
            let available = desired(machine);
            machine.set_availability(available);
        }

        let mut log = Self::unstable_header(old, term, kind, machines);
        let mut minting = Minting {
            next_machine_version: log.next_machine_version,
            next_machine_id: log.next_machine_id,
        };
        {
            let (old_half, new_half) = log.machines.split_at_mut(n);
            let mut lead = 0;
            while lead < n && !old_half[lead].available() && !new_half[lead].available() {
                lead += 1;
            }
            let mut upgrade =
                lead < n && old_half[lead].available() != new_half[lead].available();
            for i in (0..n).rev() {
                let available = old_half[i].available();
                if new_half[i].available() != available {
                    upgrade = true;
                } else if available {
                    upgrade = false;
                }
                if upgrade {
                    minting.reversion(&mut new_half[i]);
                }
            }
        }
        log.next_machine_version = minting.next_machine_version;
        log.distinct_machines_n = n as u64;
        log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn machine(last: u16) -> Machine {
        Machine::new(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, last), 7000)
    }

    fn four() -> Log {
        Log::init(vec![machine(1), machine(2), machine(3), machine(4)]).unwrap()
    }

    #[test]
    fn test_kind_masks() {
        assert!(!LogKind::Old.unstable());
        assert!(!LogKind::GrowTransform.unstable());
        for kind in [
            LogKind::Adjust,
            LogKind::Grow,
            LogKind::Shrink,
            LogKind::ChangeAvailable,
            LogKind::GrowChangeAvailable,
            LogKind::GrowComplete,
        ] {
            assert!(kind.unstable(), "{kind:?}");
        }

        assert!(LogKind::Adjust.joint());
        assert!(LogKind::Grow.joint());
        assert!(LogKind::Shrink.joint());
        assert!(!LogKind::ChangeAvailable.joint());
        assert!(!LogKind::GrowComplete.joint());

        assert_eq!(LogKind::Adjust.stable_kind(), LogKind::Old);
        assert_eq!(LogKind::Grow.stable_kind(), LogKind::GrowTransform);
        assert_eq!(LogKind::GrowComplete.stable_kind(), LogKind::Old);
        assert_eq!(LogKind::GrowChangeAvailable.stable_kind(), LogKind::GrowTransform);
    }

    #[test]
    fn test_init_assigns_monotonic_identity() {
        let log = four();
        assert_eq!(log.index, 1);
        assert_eq!(log.term, 1);
        assert_eq!(log.old_n, 4);
        assert_eq!(log.new_n, 0);
        assert_eq!(log.next_machine_id, 5);
        assert_eq!(log.next_machine_version, 5);

        let mut ids: Vec<u32> = log.machines.iter().map(|m| m.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert!(log.machines.iter().all(Machine::available));

        let keys: Vec<_> = log.machines.iter().map(Machine::addr_key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_init_rejects_duplicates() {
        let result = Log::init(vec![machine(1), machine(2), machine(2), machine(3)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_grow_then_stabilize() {
        let old = four();
        let mut proposal = old.old_half().to_vec();
        proposal.extend([machine(5), machine(6), machine(7), machine(8)]);

        let joint = Log::change(&old, proposal, 1).unwrap();
        assert_eq!(joint.kind, LogKind::Grow);
        assert_eq!(joint.old_n, 4);
        assert_eq!(joint.new_n, 8);
        assert_eq!(joint.index, old.index + 1);
        assert_eq!(joint.distinct_machines_n, 8);
        // Added machines got fresh ids.
        let added: Vec<u32> = joint.new_half()[4..].iter().map(|m| m.id).collect();
        assert_eq!(added, vec![5, 6, 7, 8]);

        let transform = Log::stable(&joint);
        assert_eq!(transform.kind, LogKind::GrowTransform);
        assert_eq!(transform.old_n, 8);
        assert_eq!(transform.version, joint.version + 1);

        let complete = Log::grow_complete(&transform, 2);
        assert_eq!(complete.kind, LogKind::GrowComplete);
        assert_eq!(complete.old_n, 8);
        assert_eq!(complete.new_n, 8);

        let settled = Log::stable(&complete);
        assert_eq!(settled.kind, LogKind::Old);
        assert_eq!(settled.old_n, 8);
        assert_eq!(settled.new_n, 0);
    }

    #[test]
    fn test_grow_rejects_overlap_and_mismatch() {
        let old = four();

        // Reused address in the added half.
        let mut proposal = old.old_half().to_vec();
        proposal.extend([machine(1), machine(6), machine(7), machine(8)]);
        assert!(Log::change(&old, proposal, 1).is_err());

        // First half does not echo the cluster.
        let mut proposal = old.old_half().to_vec();
        proposal[0].version += 1;
        proposal.extend([machine(5), machine(6), machine(7), machine(8)]);
        assert!(Log::change(&old, proposal, 1).is_err());
    }

    #[test]
    fn test_shrink_requires_leading_half() {
        let eight = Log::init((1..=8).map(machine).collect()).unwrap();

        let keep = eight.old_half()[..4].to_vec();
        let joint = Log::change(&eight, keep, 1).unwrap();
        assert_eq!(joint.kind, LogKind::Shrink);
        assert_eq!(joint.distinct_machines_n, 8);
        let settled = Log::stable(&joint);
        assert_eq!(settled.old_n, 4);

        let tail = eight.old_half()[4..].to_vec();
        assert!(Log::change(&eight, tail, 1).is_err());
    }

    #[test]
    fn test_adjust_swaps_one_machine() {
        let old = four();
        let mut proposal = old.old_half().to_vec();
        proposal[3] = machine(9);

        let joint = Log::change(&old, proposal, 1).unwrap();
        assert_eq!(joint.kind, LogKind::Adjust);
        assert_eq!(joint.new_n, 4);
        assert_eq!(joint.distinct_machines_n, 5);

        // The newcomer exists with a fresh id; replaced machine is gone.
        let kept: Vec<u32> = joint.new_half().iter().map(|m| m.id).collect();
        assert!(kept.contains(&5));
        let old_ids: Vec<u32> = old.old_half().iter().map(|m| m.id).collect();
        assert_eq!(kept.iter().filter(|id| old_ids.contains(id)).count(), 3);
    }

    #[test]
    fn test_adjust_rejects_no_change_and_mass_replacement() {
        let old = four();
        assert!(Log::change(&old, old.old_half().to_vec(), 1).is_err());

        let proposal = vec![machine(11), machine(12), machine(13), machine(14)];
        assert!(Log::change(&old, proposal, 1).is_err());
    }

    #[test]
    fn test_wrong_size_change_is_rejected() {
        let old = four();
        let proposal = vec![machine(1), machine(2), machine(3)];
        assert!(Log::change(&old, proposal, 1).is_err());
    }

    #[test]
    fn test_change_available_flips_and_reversions() {
        let old = four();
        let victim = old.old_half()[1];

        let log = Log::change_available(&old, 2, |m| m.id != victim.id);
        assert_eq!(log.kind, LogKind::ChangeAvailable);
        assert_eq!(log.old_n, 4);
        assert_eq!(log.new_n, 4);

        let flipped = log.find_new(victim.id).unwrap();
        assert!(!flipped.available());
        assert!(flipped.version > victim.version);

        // Stabilizing keeps the same membership.
        let settled = Log::stable(&log);
        assert_eq!(settled.kind, LogKind::Old);
        assert_eq!(settled.old_n, 4);
        assert!(!settled.find(victim.id).unwrap().available());
    }

    #[test]
    fn test_up_to_date_comparison() {
        let log = four();
        assert!(log.at_least_up_to_date(1, 1));
        assert!(log.at_least_up_to_date(5, 1));
        assert!(log.at_least_up_to_date(0, 2));
        assert!(!log.at_least_up_to_date(0, 1));
        assert!(!log.at_least_up_to_date(9, 0));
    }
}
