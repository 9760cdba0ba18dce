// Cluster machines
//
// A machine is one cache instance as the membership plane sees it: address
// and port, a cluster-assigned id, a stability counter whose low bit is the
// availability flag, and a data version that advances whenever the machine's
// responsibility changes. Machine lists travel as 40-byte big-endian records
// and are kept sorted by (address, port) with no duplicates.

use bytes::{Buf, BufMut};
use std::net::Ipv6Addr;

/// Bytes one machine occupies on the wire.
pub const MACHINE_WIRE_SIZE: usize = 40;

/// Smallest and largest legal cluster sizes; counts are powers of two.
pub const MACHINES_MIN: u64 = 4;
pub const MACHINES_MAX: u64 = i32::MAX as u64;

pub const MACHINES_SIZE_MIN: u64 = MACHINE_WIRE_SIZE as u64 * MACHINES_MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Machine {
    pub addr: Ipv6Addr,
    pub port: u16,
    pub id: u32,
    pub stability: u64,
    pub version: u64,
}

impl Machine {
    pub fn new(addr: Ipv6Addr, port: u16) -> Self {
        Self {
            addr,
            port,
            id: 0,
            stability: 0,
            version: 0,
        }
    }

    /// The low stability bit carries availability.
    pub fn available(&self) -> bool {
        self.stability & 1 == 1
    }

    /// Flip availability by bumping the stability counter.
    pub fn set_availability(&mut self, available: bool) {
        if self.available() != available {
            self.stability += 1;
        }
    }

    /// Sort key: address bytes, then port.
    pub fn addr_key(&self) -> ([u8; 16], u16) {
        (self.addr.octets(), self.port)
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.addr.octets());
        buf.put_u16(self.port);
        buf.put_u16(0);
        buf.put_u32(self.id);
        buf.put_u64(self.stability);
        buf.put_u64(self.version);
    }

    pub fn decode(buf: &mut impl Buf) -> Self {
        let mut octets = [0u8; 16];
        buf.copy_to_slice(&mut octets);
        let port = buf.get_u16();
        let _pad = buf.get_u16();
        Self {
            addr: Ipv6Addr::from(octets),
            port,
            id: buf.get_u32(),
            stability: buf.get_u64(),
            version: buf.get_u64(),
        }
    }
}

/// Whether a wire byte count describes a legal machine list.
pub fn machines_size_valid(size: u64) -> bool {
    size >= MACHINES_SIZE_MIN
        && size <= MACHINE_WIRE_SIZE as u64 * MACHINES_MAX
        && size % MACHINE_WIRE_SIZE as u64 == 0
        && (size / MACHINE_WIRE_SIZE as u64).is_power_of_two()
}

pub fn sort_by_addr(machines: &mut [Machine]) {
    machines.sort_unstable_by_key(Machine::addr_key);
}

/// Adjacent duplicate scan; the slice must already be sorted by address.
pub fn has_duplicate_addr(machines: &[Machine]) -> bool {
    machines
        .windows(2)
        .any(|pair| pair[0].addr_key() == pair[1].addr_key())
}

pub fn find_by_id(machines: &[Machine], id: u32) -> Option<&Machine> {
    machines.iter().find(|m| m.id == id)
}

/// Binary search in an address-sorted slice.
pub fn search_by_addr(machines: &[Machine], needle: &Machine) -> Option<usize> {
    machines
        .binary_search_by_key(&needle.addr_key(), Machine::addr_key)
        .ok()
}

pub fn encode_machines(machines: &[Machine], buf: &mut impl BufMut) {
    for machine in machines {
        machine.encode(buf);
    }
}

pub fn decode_machines(mut bytes: &[u8]) -> Vec<Machine> {
    debug_assert_eq!(bytes.len() % MACHINE_WIRE_SIZE, 0);
    let mut machines = Vec::with_capacity(bytes.len() / MACHINE_WIRE_SIZE);
    while bytes.remaining() >= MACHINE_WIRE_SIZE {
        machines.push(Machine::decode(&mut bytes));
    }
    machines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(last: u16, port: u16) -> Machine {
        Machine::new(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, last), port)
    }

    #[test]
    fn test_availability_tracks_stability_bit() {
        let mut m = machine(1, 7000);
        assert!(!m.available());
        m.set_availability(true);
        assert_eq!(m.stability, 1);
        assert!(m.available());
        // No-op when already in the requested state.
        m.set_availability(true);
        assert_eq!(m.stability, 1);
        m.set_availability(false);
        assert_eq!(m.stability, 2);
    }

    #[test]
    fn test_wire_roundtrip() {
        let mut m = machine(9, 7009);
        m.id = 42;
        m.stability = 3;
        m.version = 17;

        let mut buf = Vec::new();
        m.encode(&mut buf);
        assert_eq!(buf.len(), MACHINE_WIRE_SIZE);

        let decoded = Machine::decode(&mut buf.as_slice());
        assert_eq!(decoded, m);
    }

    #[test]
    fn test_size_validation() {
        let one = MACHINE_WIRE_SIZE as u64;
        assert!(machines_size_valid(4 * one));
        assert!(machines_size_valid(8 * one));
        assert!(!machines_size_valid(2 * one));
        assert!(!machines_size_valid(6 * one));
        assert!(!machines_size_valid(4 * one + 1));
        assert!(!machines_size_valid(0));
    }

    #[test]
    fn test_sort_and_duplicates() {
        let mut machines = vec![machine(3, 1), machine(1, 2), machine(1, 1), machine(2, 1)];
        sort_by_addr(&mut machines);
        let keys: Vec<_> = machines.iter().map(Machine::addr_key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert!(!has_duplicate_addr(&machines));

        machines.push(machine(3, 1));
        sort_by_addr(&mut machines);
        assert!(has_duplicate_addr(&machines));
    }

    #[test]
    fn test_search_by_addr() {
        let mut machines = vec![machine(5, 1), machine(2, 1), machine(9, 1)];
        sort_by_addr(&mut machines);
        let idx = search_by_addr(&machines, &machine(5, 1)).unwrap();
        assert_eq!(machines[idx].addr, machine(5, 1).addr);
        assert!(search_by_addr(&machines, &machine(6, 1)).is_none());
    }
}
