// KV records
//
// A record is a single allocation: header, zero-padded key, then the value
// bytes. Three layouts cover the size spectrum:
//
// - small records live whole in one slab object,
// - mid-sized records split: whole pages carry the head and a slab object
//   carries the value tail plus a back-pointer to the head's tag field,
// - large records take whole pages and fake a self-referential tag.
//
// The `soo` tag at offset zero is the pivot of slab compaction: for a slab
// resident record it names the record itself; for a concat head it names the
// slab tail, whose first word points back at the head's tag field. The
// migration visitor reads those two words to tell the shapes apart.

use super::index::{EntryKind, HashNode, KEY_OFFSET};
use super::list::{self, container_of, ListNode};
use crate::memory::slab::Migrate;
use crate::memory::{SlabObj, OBJ_SIZE_MAX, PAGE_MASK, PAGE_SHIFT};
use std::ptr::NonNull;

/// Record header; the key and value bytes follow the struct directly.
#[repr(C)]
pub struct Record {
    /// Slab tag: self-referential, or the concat tail's tag.
    pub soo: SlabObj,
    /// Shard LRU membership; self-linked while the record is disabled.
    pub lru: ListNode,
    /// Ring of connections currently reading or writing this record.
    pub borrowers: ListNode,
    pub val_size: u64,
    /// Index membership, valid only while enabled.
    pub hash_node: HashNode,
    // data: [u8] — padded key, then value
}

pub const RECORD_HEADER_SIZE: usize = std::mem::size_of::<Record>();

const _: () = assert!(std::mem::offset_of!(Record, soo) == 0);
const _: () = assert!(RECORD_HEADER_SIZE % 8 == 0);
// The index derives the key address from the hash node alone.
const _: () = assert!(RECORD_HEADER_SIZE - std::mem::offset_of!(Record, hash_node) == KEY_OFFSET);

/// Bytes a padded, length-prefixed key occupies.
pub fn padded_key_size(key: *const u8) -> usize {
    (1 + unsafe { usize::from(*key) } + 7) & !7
}

/// Total allocation size for a key/value pair.
pub fn record_size(key: *const u8, val_size: u64) -> u64 {
    RECORD_HEADER_SIZE as u64 + padded_key_size(key) as u64 + val_size
}

/// How a record's bytes are laid out in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLayout {
    /// One slab object.
    Inline,
    /// Page-aligned head plus a slab tail holding the value overflow.
    Concat { tail: SlabObj },
    /// Whole pages only.
    Pages,
}

impl Record {
    /// # Safety
    ///
    /// `rec` must be a valid record allocation.
    pub unsafe fn key(rec: NonNull<Record>) -> *mut u8 {
        rec.as_ptr().cast::<u8>().add(RECORD_HEADER_SIZE)
    }

    /// # Safety
    ///
    /// `rec` must have its key written.
    pub unsafe fn key_size(rec: NonNull<Record>) -> usize {
        padded_key_size(Self::key(rec))
    }

    /// # Safety
    ///
    /// `rec` must have its key written.
    pub unsafe fn val(rec: NonNull<Record>) -> *mut u8 {
        Self::key(rec).add(Self::key_size(rec))
    }

    /// # Safety
    ///
    /// `rec` must have its key written.
    pub unsafe fn total_size(rec: NonNull<Record>) -> u64 {
        RECORD_HEADER_SIZE as u64 + Self::key_size(rec) as u64 + (*rec.as_ptr()).val_size
    }

    /// Write the key and reset the bookkeeping of a fresh allocation. The
    /// tag is the allocator's business and is left alone.
    ///
    /// # Safety
    ///
    /// `rec` must be freshly allocated for this key/value size; `key` must
    /// be zero-padded out to its 8-byte boundary.
    pub unsafe fn init(rec: NonNull<Record>, key: *const u8, val_size: u64) {
        (*rec.as_ptr()).val_size = val_size;
        list::init(NonNull::from(&mut (*rec.as_ptr()).lru));
        list::init(NonNull::from(&mut (*rec.as_ptr()).borrowers));
        (*rec.as_ptr()).hash_node.kind = EntryKind::Record;
        std::ptr::copy_nonoverlapping(key, Self::key(rec), padded_key_size(key));
    }

    /// Enabled records are on the LRU and reachable through the index.
    ///
    /// # Safety
    ///
    /// `rec` must be initialized.
    pub unsafe fn enabled(rec: NonNull<Record>) -> bool {
        !list::is_self_linked(NonNull::from(&mut (*rec.as_ptr()).lru))
    }

    /// # Safety
    ///
    /// `rec` must be initialized.
    pub unsafe fn no_borrowers(rec: NonNull<Record>) -> bool {
        list::is_self_linked(NonNull::from(&mut (*rec.as_ptr()).borrowers))
    }

    /// # Safety
    ///
    /// `rec` must be initialized with key and tag in place.
    pub unsafe fn layout(rec: NonNull<Record>) -> RecordLayout {
        if Self::total_size(rec) <= OBJ_SIZE_MAX as u64 {
            return RecordLayout::Inline;
        }
        let soo = (*rec.as_ptr()).soo;
        if soo.obj().cast::<Record>() == rec {
            RecordLayout::Pages
        } else {
            RecordLayout::Concat { tail: soo }
        }
    }

    /// Raw ranges covering the value bytes from offset `from` on: at most
    /// two, head pages first, concat tail second.
    ///
    /// # Safety
    ///
    /// `rec` must be fully allocated and `from <= val_size`.
    pub unsafe fn val_ranges(rec: NonNull<Record>, from: u64) -> ([(*mut u8, usize); 2], usize) {
        let val_size = (*rec.as_ptr()).val_size;
        debug_assert!(from <= val_size);
        let mut ranges = [(std::ptr::null_mut(), 0); 2];

        match Self::layout(rec) {
            RecordLayout::Inline | RecordLayout::Pages => {
                if from == val_size {
                    return (ranges, 0);
                }
                ranges[0] = (
                    Self::val(rec).add(from as usize),
                    (val_size - from) as usize,
                );
                (ranges, 1)
            }
            RecordLayout::Concat { tail } => {
                let total = Self::total_size(rec);
                let head_pages = total >> PAGE_SHIFT;
                let tail_len = (total & PAGE_MASK as u64) as usize;
                let head_len =
                    ((head_pages << PAGE_SHIFT) - RECORD_HEADER_SIZE as u64) as usize
                        - Self::key_size(rec);
                let tail_data = tail.obj().as_ptr().add(8);

                let mut n = 0;
                if (from as usize) < head_len {
                    ranges[n] = (
                        Self::val(rec).add(from as usize),
                        head_len - from as usize,
                    );
                    n += 1;
                    if tail_len > 0 {
                        ranges[n] = (tail_data, tail_len);
                        n += 1;
                    }
                } else {
                    let into_tail = from as usize - head_len;
                    if tail_len > into_tail {
                        ranges[n] = (tail_data.add(into_tail), tail_len - into_tail);
                        n += 1;
                    }
                }
                (ranges, n)
            }
        }
    }
}

/// A connection's claim on a record.
#[repr(C)]
#[derive(Debug)]
pub struct Borrower {
    pub node: ListNode,
    pub record: *mut Record,
}

impl Borrower {
    pub const fn new() -> Self {
        Self {
            node: ListNode::new(),
            record: std::ptr::null_mut(),
        }
    }
}

impl Default for Borrower {
    fn default() -> Self {
        Self::new()
    }
}

/// Chain `borrower` onto `rec`.
///
/// # Safety
///
/// `borrower` must not currently hold a record.
pub unsafe fn borrow(rec: NonNull<Record>, borrower: NonNull<Borrower>) {
    debug_assert!((*borrower.as_ptr()).record.is_null());
    (*borrower.as_ptr()).record = rec.as_ptr();
    list::insert_after(
        NonNull::from(&mut (*rec.as_ptr()).borrowers),
        NonNull::from(&mut (*borrower.as_ptr()).node),
    );
}

/// Return a borrow; the caller decides whether the record must now die.
///
/// # Safety
///
/// `borrower` must hold a record.
pub unsafe fn give_back(borrower: NonNull<Borrower>) -> NonNull<Record> {
    let rec = (*borrower.as_ptr()).record;
    debug_assert!(!rec.is_null());
    list::unlink(NonNull::from(&mut (*borrower.as_ptr()).node));
    (*borrower.as_ptr()).record = std::ptr::null_mut();
    NonNull::new_unchecked(rec)
}

/// Slab relocation visitor for the record pools.
pub struct RecordMigrate;

impl Migrate for RecordMigrate {
    unsafe fn fix_self_references(from: SlabObj, to: SlabObj) {
        let from_ptr = from.obj().as_ptr();
        let to_ptr = to.obj().as_ptr();

        // First word: a record head stores its own tag, a concat tail the
        // address of its head's tag field.
        let first = (from_ptr as *const usize).read();
        if (first & !7) != from_ptr as usize {
            let head_soo = first as *mut SlabObj;
            debug_assert_eq!(*head_soo, from);
            *head_soo = to;
            return;
        }

        let from_rec = NonNull::new_unchecked(from_ptr.cast::<Record>());
        let to_rec = NonNull::new_unchecked(to_ptr.cast::<Record>());
        (*to_rec.as_ptr()).soo = to;
        // Slab residents are always the Inline layout.
        debug_assert!(Record::total_size(to_rec) <= OBJ_SIZE_MAX as u64);

        if Record::enabled(from_rec) {
            list::fix(NonNull::from(&mut (*to_rec.as_ptr()).lru));
            list::fix(NonNull::from(&mut (*to_rec.as_ptr()).hash_node.link));
        } else {
            list::init(NonNull::from(&mut (*to_rec.as_ptr()).lru));
        }

        if Record::no_borrowers(from_rec) {
            list::init(NonNull::from(&mut (*to_rec.as_ptr()).borrowers));
        } else {
            let head = NonNull::from(&mut (*to_rec.as_ptr()).borrowers);
            list::fix(head);
            let mut curr = (*head.as_ptr()).next;
            while curr != head.as_ptr() {
                let borrower = container_of!(NonNull::new_unchecked(curr), Borrower, node);
                (*borrower).record = to_rec.as_ptr();
                curr = (*curr).next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Accountant, Pool, PAGE_SIZE};

    fn padded_key(key: &[u8]) -> [u8; 256] {
        let mut buf = [0u8; 256];
        buf[0] = key.len() as u8;
        buf[1..1 + key.len()].copy_from_slice(key);
        buf
    }

    unsafe fn alloc_inline(
        pool: &mut Pool,
        mem: &mut Accountant,
        key: &[u8],
        val: &[u8],
    ) -> NonNull<Record> {
        let tag = pool.alloc(mem);
        assert!(!tag.is_null());
        let rec = tag.obj().cast::<Record>();
        (*rec.as_ptr()).soo = tag;
        let kb = padded_key(key);
        Record::init(rec, kb.as_ptr(), val.len() as u64);
        std::ptr::copy_nonoverlapping(val.as_ptr(), Record::val(rec), val.len());
        rec
    }

    #[test]
    fn test_inline_layout_and_value_range() {
        let mut mem = Accountant::new(16);
        let mut pool = Pool::new(256);
        unsafe {
            let rec = alloc_inline(&mut pool, &mut mem, b"foo", b"barbar");
            assert_eq!(Record::key_size(rec), 8);
            assert_eq!(Record::layout(rec), RecordLayout::Inline);
            assert!(!Record::enabled(rec));
            assert!(Record::no_borrowers(rec));

            let (ranges, n) = Record::val_ranges(rec, 0);
            assert_eq!(n, 1);
            let val = std::slice::from_raw_parts(ranges[0].0, ranges[0].1);
            assert_eq!(val, b"barbar");

            let (ranges, n) = Record::val_ranges(rec, 4);
            assert_eq!(n, 1);
            assert_eq!(std::slice::from_raw_parts(ranges[0].0, ranges[0].1), b"ar");

            let (_, n) = Record::val_ranges(rec, 6);
            assert_eq!(n, 0);
        }
    }

    #[test]
    fn test_concat_layout_splits_value() {
        let mut mem = Accountant::new(16);
        let mut tail_pool = Pool::new(512);
        unsafe {
            // One head page plus a few hundred tail bytes.
            let kb = padded_key(b"big");
            let val_size = (PAGE_SIZE - RECORD_HEADER_SIZE - 8 + 300) as u64;
            let total = record_size(kb.as_ptr(), val_size);
            assert_eq!(total >> PAGE_SHIFT, 1);
            let overflow = (total & PAGE_MASK as u64) as usize;
            assert!(overflow > 0 && overflow + 8 <= OBJ_SIZE_MAX);

            let head = mem.alloc(1).unwrap().cast::<Record>();
            Record::init(head, kb.as_ptr(), val_size);

            let tail = tail_pool.alloc(&mut mem);
            assert!(!tail.is_null());
            (tail.obj().as_ptr() as *mut usize)
                .write(std::ptr::addr_of_mut!((*head.as_ptr()).soo) as usize);
            (*head.as_ptr()).soo = tail;

            assert_eq!(Record::layout(head), RecordLayout::Concat { tail });

            let (ranges, n) = Record::val_ranges(head, 0);
            assert_eq!(n, 2);
            assert_eq!(ranges[0].1 + ranges[1].1, val_size as usize);
            assert_eq!(ranges[1].1, overflow);

            // Offsets inside the tail yield a single range.
            let head_len = ranges[0].1;
            let (ranges, n) = Record::val_ranges(head, head_len as u64 + 10);
            assert_eq!(n, 1);
            assert_eq!(ranges[0].1, overflow - 10);

            mem.free(head.cast(), 1);
        }
    }

    #[test]
    fn test_pages_layout_fakes_own_tag() {
        let mut mem = Accountant::new(16);
        unsafe {
            let kb = padded_key(b"huge");
            // An exact page multiple forces the pure page layout.
            let val_size = (2 * PAGE_SIZE - RECORD_HEADER_SIZE - 8) as u64;
            let total = record_size(kb.as_ptr(), val_size);
            assert_eq!(total & PAGE_MASK as u64, 0);

            let rec = mem.alloc(2).unwrap().cast::<Record>();
            (*rec.as_ptr()).soo = SlabObj::new(rec.cast(), rec.cast());
            Record::init(rec, kb.as_ptr(), val_size);
            assert_eq!(Record::layout(rec), RecordLayout::Pages);
            mem.free(rec.cast(), 2);
        }
    }

    #[test]
    fn test_borrow_return_cycle() {
        let mut mem = Accountant::new(16);
        let mut pool = Pool::new(128);
        unsafe {
            let rec = alloc_inline(&mut pool, &mut mem, b"k", b"v");
            let mut a = Borrower::new();
            let mut b = Borrower::new();
            borrow(rec, NonNull::from(&mut a));
            borrow(rec, NonNull::from(&mut b));
            assert!(!Record::no_borrowers(rec));

            assert_eq!(give_back(NonNull::from(&mut a)), rec);
            assert!(!Record::no_borrowers(rec));
            assert_eq!(give_back(NonNull::from(&mut b)), rec);
            assert!(Record::no_borrowers(rec));
        }
    }

    #[test]
    fn test_migration_rewires_borrowers_and_lists() {
        let mut mem = Accountant::new(16);
        let mut pool = Pool::new(128);
        unsafe {
            let first = alloc_inline(&mut pool, &mut mem, b"first", b"aaaa");
            let second = alloc_inline(&mut pool, &mut mem, b"second", b"bbbb");

            // Wire `second` into stand-in LRU and bucket rings, and borrow it.
            let mut lru_head = Box::new(ListNode::new());
            let mut bucket = Box::new(ListNode::new());
            list::init(NonNull::from(&mut *lru_head));
            list::init(NonNull::from(&mut *bucket));
            list::unlink(NonNull::from(&mut (*second.as_ptr()).lru));
            list::insert_after(
                NonNull::from(&mut *lru_head),
                NonNull::from(&mut (*second.as_ptr()).lru),
            );
            list::insert_after(
                NonNull::from(&mut *bucket),
                NonNull::from(&mut (*second.as_ptr()).hash_node.link),
            );
            let mut holder = Borrower::new();
            borrow(second, NonNull::from(&mut holder));

            // Freeing `first` migrates `second` (the slab tail) into its slot.
            let first_tag = (*first.as_ptr()).soo;
            pool.free::<RecordMigrate>(first_tag, &mut mem);

            let moved = holder.record;
            assert_ne!(moved, second.as_ptr());
            let moved = NonNull::new_unchecked(moved);
            assert!(Record::enabled(moved));
            assert_eq!((*moved.as_ptr()).soo.obj().cast::<Record>(), moved);

            // Both rings lead to the relocated record.
            assert_eq!(
                list::first(NonNull::from(&mut *lru_head)).as_ptr(),
                std::ptr::addr_of_mut!((*moved.as_ptr()).lru)
            );
            assert_eq!(
                list::first(NonNull::from(&mut *bucket)).as_ptr(),
                std::ptr::addr_of_mut!((*moved.as_ptr()).hash_node.link)
            );
            assert_eq!(
                std::slice::from_raw_parts(Record::val(moved), 4),
                b"bbbb"
            );
        }
    }
}
