// Hash index
//
// Bucketed chaining over a power-of-two bucket array, with incremental
// rehashing: a resize installs a fresh array and leaves the old one in
// place; every insert evacuates the bucket its key would have hit plus one
// cursor step, every delete advances the cursor, and the old array is handed
// back once the cursor passes its end. Lookups prefer a not-yet-evacuated
// old bucket so a key is always found exactly once.
//
// A bucket chains two container shapes: records, and connections installed
// as lock placeholders while they fill a miss. Both embed a `HashNode`
// directly followed by their length-prefixed key, so one probe loop serves
// both; the node's kind byte tells the caller which container it got.

use super::list::{self, ListNode};
use crate::memory::{Accountant, PAGE_SHIFT};
use std::ptr::NonNull;

/// What kind of container a hash node is embedded in.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Record = 0,
    Placeholder = 1,
}

/// A node chained into a hash bucket.
///
/// The embedding container must place its key buffer directly after this
/// field; the index derives the key address from the node alone.
#[repr(C)]
#[derive(Debug)]
pub struct HashNode {
    pub link: ListNode,
    pub kind: EntryKind,
}

/// Offset from a hash node to the key it indexes.
pub const KEY_OFFSET: usize = std::mem::size_of::<HashNode>();

const _: () = assert!(KEY_OFFSET == 24);
const _: () = assert!(KEY_OFFSET % 8 == 0);

/// A typed view of a bucket entry.
#[derive(Debug, Clone, Copy)]
pub enum IndexEntry {
    /// An enabled record; the pointer is to its embedded hash node.
    Record(NonNull<HashNode>),
    /// A connection holding the key lock.
    Placeholder(NonNull<HashNode>),
}

impl IndexEntry {
    /// # Safety
    ///
    /// `node` must be embedded in a container matching its kind byte.
    pub unsafe fn of(node: NonNull<HashNode>) -> Self {
        match (*node.as_ptr()).kind {
            EntryKind::Record => IndexEntry::Record(node),
            EntryKind::Placeholder => IndexEntry::Placeholder(node),
        }
    }
}

/// Key address of a hash node.
///
/// # Safety
///
/// `node` must be embedded per the [`HashNode`] contract.
pub unsafe fn node_key(node: NonNull<HashNode>) -> *const u8 {
    node.as_ptr().cast::<u8>().add(KEY_OFFSET)
}

unsafe fn node_of_link(link: NonNull<ListNode>) -> NonNull<HashNode> {
    // `link` is the first field of `HashNode`.
    link.cast::<HashNode>()
}

// --- MurmurHash3 x64 128 -------------------------------------------------
//
// Kept in-module: the index is its only consumer and the exact algorithm is
// pinned (seed 47, high half selects the bucket).

const HASH_SEED: u64 = 47;

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51afd7ed558ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ceb9fe1a85ec53);
    k ^= k >> 33;
    k
}

fn murmur3_x64_128(data: &[u8], seed: u64) -> (u64, u64) {
    const C1: u64 = 0x87c37b91114253d5;
    const C2: u64 = 0x4cf5ad432745937f;

    let mut h1 = seed;
    let mut h2 = seed;
    let nblocks = data.len() / 16;

    for block in data.chunks_exact(16).take(nblocks) {
        let mut k1 = u64::from_le_bytes(block[0..8].try_into().unwrap());
        let mut k2 = u64::from_le_bytes(block[8..16].try_into().unwrap());

        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1
            .rotate_left(27)
            .wrapping_add(h2)
            .wrapping_mul(5)
            .wrapping_add(0x52dce729);

        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2
            .rotate_left(31)
            .wrapping_add(h1)
            .wrapping_mul(5)
            .wrapping_add(0x38495ab5);
    }

    let tail = &data[nblocks * 16..];
    let mut k1: u64 = 0;
    let mut k2: u64 = 0;
    for (i, &b) in tail.iter().enumerate().skip(8) {
        k2 |= u64::from(b) << ((i - 8) * 8);
    }
    if tail.len() > 8 {
        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
    }
    for (i, &b) in tail.iter().enumerate().take(8) {
        k1 |= u64::from(b) << (i * 8);
    }
    if !tail.is_empty() {
        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u64;
    h2 ^= data.len() as u64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix64(h1);
    h2 = fmix64(h2);
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    (h1, h2)
}

/// Hash of a length-prefixed key.
///
/// # Safety
///
/// `key` must point at a length byte followed by that many key bytes.
unsafe fn key_hash(key: *const u8) -> u64 {
    let len = 1 + usize::from(*key);
    let bytes = std::slice::from_raw_parts(key, len);
    murmur3_x64_128(bytes, HASH_SEED).1
}

/// 8-byte stride equality over zero-padded keys.
///
/// # Safety
///
/// Both keys must be 8-byte aligned, length-prefixed and zero-padded to the
/// next 8-byte boundary.
pub unsafe fn key_equal(a: *const u8, b: *const u8) -> bool {
    debug_assert_eq!(a as usize % 8, 0);
    debug_assert_eq!(b as usize % 8, 0);

    let words = usize::from(*a) / 8 + 1;
    let a = a.cast::<u64>();
    let b = b.cast::<u64>();
    for i in 0..words {
        if a.add(i).read() != b.add(i).read() {
            return false;
        }
    }
    true
}

// --- Index ---------------------------------------------------------------

// Buckets are 16-byte ring heads.
const BUCKET_SHIFT: u32 = 4;

const fn pages_to_mask(pages: u64) -> u64 {
    (pages << (PAGE_SHIFT - BUCKET_SHIFT)) - 1
}

const fn mask_to_pages(mask: u64) -> u64 {
    (mask + 1) >> (PAGE_SHIFT - BUCKET_SHIFT)
}

const MIN_MASK: u64 = pages_to_mask(1);

/// How many evacuated buckets one cursor step may skip over.
const MIGRATE_BURST: u64 = 1024;

/// Incrementally-resized hash index of one shard.
#[derive(Debug)]
pub struct HashIndex {
    n: u64,
    mask: u64,
    buckets: NonNull<ListNode>,

    old_buckets: Option<NonNull<ListNode>>,
    old_mask: u64,
    migrated: u64,
}

unsafe fn init_buckets(buckets: NonNull<ListNode>, mask: u64) {
    for i in 0..=mask {
        list::init(bucket_at(buckets, i));
    }
}

unsafe fn bucket_at(buckets: NonNull<ListNode>, i: u64) -> NonNull<ListNode> {
    NonNull::new_unchecked(buckets.as_ptr().add(i as usize))
}

unsafe fn bucket_is_empty(bucket: NonNull<ListNode>) -> bool {
    list::is_self_linked(bucket)
}

impl HashIndex {
    /// Build an index with the minimum bucket array, paid for by `mem`.
    pub fn new(mem: &mut Accountant) -> Option<Self> {
        let buckets = mem.alloc(mask_to_pages(MIN_MASK))?.cast::<ListNode>();
        unsafe { init_buckets(buckets, MIN_MASK) };
        Some(Self {
            n: 0,
            mask: MIN_MASK,
            buckets,
            old_buckets: None,
            old_mask: 0,
            migrated: 0,
        })
    }

    pub fn len(&self) -> u64 {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn bucket_count(&self) -> u64 {
        self.mask + 1
    }

    pub fn is_migrating(&self) -> bool {
        self.old_buckets.is_some()
    }

    /// Bucket currently holding `key`: its old bucket while that is not yet
    /// evacuated, the new one otherwise.
    unsafe fn bucket_for(&self, hash: u64) -> NonNull<ListNode> {
        if let Some(old) = self.old_buckets {
            let bucket = bucket_at(old, hash & self.old_mask);
            if !bucket_is_empty(bucket) {
                return bucket;
            }
        }
        bucket_at(self.buckets, hash & self.mask)
    }

    /// Find the entry for `key`.
    ///
    /// # Safety
    ///
    /// `key` must be aligned, length-prefixed and zero-padded.
    pub unsafe fn get(&self, key: *const u8) -> Option<IndexEntry> {
        let bucket = self.bucket_for(key_hash(key));
        let mut curr = (*bucket.as_ptr()).next;
        while curr != bucket.as_ptr() {
            let node = node_of_link(NonNull::new_unchecked(curr));
            if key_equal(node_key(node), key) {
                return Some(IndexEntry::of(node));
            }
            curr = (*curr).next;
        }
        None
    }

    /// Rehash every entry of old bucket `i` into the new array, then advance
    /// the migration cursor by one step.
    unsafe fn evacuate(&mut self, i: u64, mem: &mut Accountant) {
        let Some(old) = self.old_buckets else { return };

        let bucket = bucket_at(old, i);
        let (buckets, mask) = (self.buckets, self.mask);
        list::for_each_safe(bucket, |link| unsafe {
            list::unlink(link);
            let node = node_of_link(link);
            let hash = key_hash(node_key(node));
            list::insert_after(bucket_at(buckets, hash & mask), link);
        });

        if i == self.migrated {
            self.migrated += 1;
            let stop = (self.migrated + MIGRATE_BURST).min(self.old_mask + 1);
            while self.migrated < stop && bucket_is_empty(bucket_at(old, self.migrated)) {
                self.migrated += 1;
            }
            if self.migrated > self.old_mask {
                mem.free(old.cast(), mask_to_pages(self.old_mask));
                self.old_buckets = None;
            }
        }
    }

    unsafe fn migrate_step(&mut self, mem: &mut Accountant) {
        if self.old_buckets.is_some() {
            self.evacuate(self.migrated, mem);
        }
    }

    fn should_grow(&self) -> bool {
        self.old_buckets.is_none() && self.n > (self.mask << 3)
    }

    fn grow_pages(&self) -> u64 {
        mask_to_pages(self.mask) << 1
    }

    fn should_shrink(&self) -> bool {
        self.old_buckets.is_none() && self.mask > MIN_MASK && self.n < (self.mask << 1)
    }

    fn shrink_pages(&self) -> u64 {
        mask_to_pages(self.mask) >> 1
    }

    /// Chain `node` in. Duplicate keys are the caller's problem.
    ///
    /// Returns the number of pages a pending grow would need, so the caller
    /// can reclaim toward it before calling [`HashIndex::grow`]; zero when no
    /// resize is due.
    ///
    /// # Safety
    ///
    /// `node` must be embedded per the [`HashNode`] contract and stay put
    /// until removed.
    pub unsafe fn insert(&mut self, node: NonNull<HashNode>, mem: &mut Accountant) -> u64 {
        self.n += 1;

        let hash = key_hash(node_key(node));
        if self.old_buckets.is_some() {
            self.evacuate(hash & self.old_mask, mem);
            self.migrate_step(mem);
        }

        list::insert_after(
            bucket_at(self.buckets, hash & self.mask),
            NonNull::from(&mut (*node.as_ptr()).link),
        );

        if self.should_grow() {
            self.grow_pages()
        } else {
            0
        }
    }

    /// Unchain `node`. Returns the page need of a pending shrink, or zero.
    ///
    /// # Safety
    ///
    /// `node` must currently be chained in this index.
    pub unsafe fn remove(&mut self, node: NonNull<HashNode>, mem: &mut Accountant) -> u64 {
        self.n -= 1;
        list::unlink(NonNull::from(&mut (*node.as_ptr()).link));
        self.migrate_step(mem);

        if self.should_shrink() {
            self.shrink_pages()
        } else {
            0
        }
    }

    fn resize(&mut self, pages: u64, mem: &mut Accountant) -> bool {
        let Some(buckets) = mem.alloc(pages) else {
            return false;
        };
        let buckets = buckets.cast::<ListNode>();
        let mask = pages_to_mask(pages);
        unsafe { init_buckets(buckets, mask) };

        self.old_buckets = Some(self.buckets);
        self.old_mask = self.mask;
        self.migrated = 0;
        self.buckets = buckets;
        self.mask = mask;
        true
    }

    /// Start a grow migration if one is still due. Returns false only when
    /// the new array could not be paid for; the next mutation retries.
    pub fn grow(&mut self, mem: &mut Accountant) -> bool {
        !self.should_grow() || self.resize(self.grow_pages(), mem)
    }

    /// Start a shrink migration if one is still due.
    pub fn shrink(&mut self, mem: &mut Accountant) -> bool {
        !self.should_shrink() || self.resize(self.shrink_pages(), mem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct TestEntry {
        hash_node: HashNode,
        key: [u8; 256],
    }

    const _: () = assert!(std::mem::offset_of!(TestEntry, key) == KEY_OFFSET);

    fn entry(key: &[u8]) -> Box<TestEntry> {
        assert!(key.len() <= 255);
        let mut e = Box::new(TestEntry {
            hash_node: HashNode {
                link: ListNode::new(),
                kind: EntryKind::Record,
            },
            key: [0; 256],
        });
        e.key[0] = key.len() as u8;
        e.key[1..1 + key.len()].copy_from_slice(key);
        e
    }

    fn node(e: &mut TestEntry) -> NonNull<HashNode> {
        NonNull::from(&mut e.hash_node)
    }

    #[test]
    fn test_murmur_is_deterministic_and_disperses() {
        let a = murmur3_x64_128(b"\x03foo", HASH_SEED);
        assert_eq!(a, murmur3_x64_128(b"\x03foo", HASH_SEED));
        assert_ne!(a, murmur3_x64_128(b"\x03fop", HASH_SEED));
        assert_ne!(a, murmur3_x64_128(b"\x03foo", HASH_SEED + 1));
        // Block + tail path: longer than one 16-byte block.
        let long = b"\x14abcdefghijklmnopqrst";
        assert_ne!(murmur3_x64_128(long, HASH_SEED).1, 0);
    }

    #[test]
    fn test_key_equal_honours_padding() {
        let a = entry(b"hello");
        let mut b = entry(b"hello");
        unsafe {
            assert!(key_equal(a.key.as_ptr(), b.key.as_ptr()));
        }
        // Same prefix, different length.
        b.key[0] = 4;
        unsafe {
            assert!(!key_equal(a.key.as_ptr(), b.key.as_ptr()));
        }
        let c = entry(b"hellp");
        unsafe {
            assert!(!key_equal(a.key.as_ptr(), c.key.as_ptr()));
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let mut mem = Accountant::new(64);
        let mut index = HashIndex::new(&mut mem).unwrap();

        let mut a = entry(b"alpha");
        let mut b = entry(b"beta");
        unsafe {
            index.insert(node(&mut a), &mut mem);
            index.insert(node(&mut b), &mut mem);

            assert!(matches!(
                index.get(a.key.as_ptr()),
                Some(IndexEntry::Record(n)) if n == node(&mut a)
            ));
            assert!(index.get(entry(b"gamma").key.as_ptr()).is_none());

            index.remove(node(&mut a), &mut mem);
            assert!(index.get(a.key.as_ptr()).is_none());
            assert!(index.get(b.key.as_ptr()).is_some());
            index.remove(node(&mut b), &mut mem);
        }
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_placeholder_kind_is_reported() {
        let mut mem = Accountant::new(64);
        let mut index = HashIndex::new(&mut mem).unwrap();
        let mut e = entry(b"lock");
        e.hash_node.kind = EntryKind::Placeholder;
        unsafe {
            index.insert(node(&mut e), &mut mem);
            assert!(matches!(
                index.get(e.key.as_ptr()),
                Some(IndexEntry::Placeholder(_))
            ));
            index.remove(node(&mut e), &mut mem);
        }
    }

    #[test]
    fn test_grow_and_shrink_preserve_lookups() {
        let mut mem = Accountant::new(1024);
        let mut index = HashIndex::new(&mut mem).unwrap();
        let initial_buckets = index.bucket_count();

        let mut entries: Vec<Box<TestEntry>> = (0..2500u32)
            .map(|i| entry(format!("key-{i:05}").as_bytes()))
            .collect();

        unsafe {
            for e in entries.iter_mut() {
                let need = index.insert(node(e), &mut mem);
                if need > 0 {
                    assert!(index.grow(&mut mem));
                }
            }
            assert!(index.bucket_count() > initial_buckets);

            // Every key must resolve while the migration is still draining.
            for e in entries.iter_mut() {
                let found = index.get(e.key.as_ptr());
                assert!(matches!(found, Some(IndexEntry::Record(n)) if n == node(e)));
            }

            // Delete most entries; shrink kicks in and lookups still work.
            let keep = 100;
            for e in entries.iter_mut().skip(keep) {
                let need = index.remove(node(e), &mut mem);
                if need > 0 {
                    assert!(index.shrink(&mut mem));
                }
            }
            for e in entries.iter_mut().take(keep) {
                assert!(index.get(e.key.as_ptr()).is_some());
            }
            for e in entries.iter_mut().take(keep) {
                index.remove(node(e), &mut mem);
            }
        }
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_resize_is_skipped_without_memory() {
        let mut mem = Accountant::new(1);
        let mut index = HashIndex::new(&mut mem).unwrap();
        assert_eq!(mem.free_pages(), 0);

        let mut entries: Vec<Box<TestEntry>> = (0..2100u32)
            .map(|i| entry(format!("k{i}").as_bytes()))
            .collect();
        unsafe {
            for e in entries.iter_mut() {
                let need = index.insert(node(e), &mut mem);
                if need > 0 {
                    // No pages: grow silently declines, index keeps working.
                    assert!(!index.grow(&mut mem));
                }
            }
            for e in entries.iter_mut() {
                assert!(index.get(e.key.as_ptr()).is_some());
            }
            for e in entries.iter_mut() {
                index.remove(node(e), &mut mem);
            }
        }
    }
}
