// Slab blocks
//
// A slab is a page-aligned block of `2^order` pages: a small header followed
// by equal-sized, 8-byte-aligned objects. Allocation bumps `free_offset`;
// freeing bumps it back down and relocates the previous tail object into the
// hole, so live objects always occupy a dense prefix and an empty slab can
// be handed back to the accountant wholesale.
//
// Objects are referred to by a packed tag that carries the object address
// and, in the low three bits, the page distance from the object's page back
// to the slab header. That makes the owning slab recoverable from any tag
// without a lookup structure.

use super::{PAGE_MASK, PAGE_SHIFT};
use std::ptr::NonNull;

/// Alignment of every slab object; also the number of tag bits borrowed for
/// the page offset.
pub const OBJ_ALIGN: usize = 8;

const OFFSET_MASK: u64 = (OBJ_ALIGN as u64) - 1;

/// Largest supported slab order (8 pages).
pub const ORDER_MAX: u32 = 3;

/// Size of the in-band slab header.
pub const SLAB_HEADER_SIZE: usize = std::mem::size_of::<SlabHeader>();

/// Bytes available for objects in a slab of the given order.
pub const fn data_size(order: u32) -> usize {
    ((1usize << order) << PAGE_SHIFT) - SLAB_HEADER_SIZE
}

/// Largest object size a slab will carry. Anything bigger goes straight to
/// the page accountant.
pub const OBJ_SIZE_MAX: usize =
    (data_size(ORDER_MAX) / ((1 << ORDER_MAX) + 1)) & !(OBJ_ALIGN - 1);

/// Marker for a slab that is not on its pool's partial list.
pub const NO_PARTIAL_SLOT: u32 = u32::MAX;

/// In-band header at the start of every slab block.
#[repr(C)]
pub struct SlabHeader {
    /// Offset from the data area to the next free slot.
    pub free_offset: u32,
    /// Largest value `free_offset` can reach.
    pub max_offset: u32,
    /// Slot in the owning pool's partial list, or [`NO_PARTIAL_SLOT`].
    pub partial_slot: u32,
    _reserved: u32,
}

const _: () = assert!(SLAB_HEADER_SIZE % OBJ_ALIGN == 0);
const _: () = assert!(OFFSET_MASK as usize >= (1 << ORDER_MAX) - 1);
const _: () = assert!(OBJ_SIZE_MAX % OBJ_ALIGN == 0);

/// Relocation visitor: after an object's bytes move, its embedded references
/// (and any foreign pointers at it) must be rewritten to the new location.
pub trait Migrate {
    /// Fix every self-reference of the object now living at `to`; the bytes
    /// have already been copied from `from`, whose memory is still intact.
    ///
    /// # Safety
    ///
    /// `from` and `to` must refer to objects of the implementor's layout.
    unsafe fn fix_self_references(from: SlabObj, to: SlabObj);
}

/// Packed reference to a slab-allocated object: the object address with the
/// page offset to the slab header in the low bits. Zero is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabObj(u64);

impl SlabObj {
    pub const NULL: SlabObj = SlabObj(0);

    /// Build a tag for `obj`, allocated from the slab at `slab`.
    pub fn new(slab: NonNull<SlabHeader>, obj: NonNull<u8>) -> Self {
        let obj = obj.as_ptr() as u64;
        let slab = slab.as_ptr() as u64;
        debug_assert_eq!(obj & OFFSET_MASK, 0);
        debug_assert_eq!(slab & PAGE_MASK as u64, 0);

        let page = obj & !(PAGE_MASK as u64);
        let offset = (page - slab) >> PAGE_SHIFT;
        debug_assert!(offset <= OFFSET_MASK);
        SlabObj(obj | offset)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address of the referenced object.
    pub fn obj(self) -> NonNull<u8> {
        debug_assert!(!self.is_null());
        unsafe { NonNull::new_unchecked((self.0 & !OFFSET_MASK) as *mut u8) }
    }

    /// Address of the owning slab's header.
    pub fn slab(self) -> NonNull<SlabHeader> {
        let obj = self.0 & !OFFSET_MASK;
        let page = obj & !(PAGE_MASK as u64);
        let slab = page - ((self.0 & OFFSET_MASK) << PAGE_SHIFT);
        unsafe { NonNull::new_unchecked(slab as *mut SlabHeader) }
    }
}

/// Pick the smallest slab order whose waste for `obj_size` stays acceptable.
///
/// Fractions 1/16, 1/8, 1/4, ... of the data area are tried as the waste
/// ceiling; for each ceiling the orders are tried smallest first.
pub fn calculate_order(obj_size: usize) -> u32 {
    debug_assert!(obj_size % OBJ_ALIGN == 0);
    debug_assert!(obj_size <= OBJ_SIZE_MAX);

    let mut fraction = 16;
    loop {
        for order in 0..=ORDER_MAX {
            let size = data_size(order);
            if size % obj_size <= size / fraction {
                return order;
            }
        }
        fraction /= 2;
        debug_assert!(fraction > 0);
    }
}

fn data_ptr(slab: NonNull<SlabHeader>) -> *mut u8 {
    unsafe { slab.as_ptr().cast::<u8>().add(SLAB_HEADER_SIZE) }
}

/// Initialize a freshly allocated block as an empty slab for `obj_size`
/// objects.
///
/// # Safety
///
/// `slab` must point to `2^order` pages owned by the caller.
pub unsafe fn slab_init(slab: NonNull<SlabHeader>, order: u32, obj_size: u32) {
    let objects = data_size(order) as u32 / obj_size;
    let header = slab.as_ptr();
    (*header).free_offset = 0;
    (*header).max_offset = objects * obj_size;
    (*header).partial_slot = NO_PARTIAL_SLOT;
}

/// # Safety
///
/// `slab` must be an initialized slab.
pub unsafe fn slab_is_full(slab: NonNull<SlabHeader>) -> bool {
    let header = slab.as_ptr();
    (*header).free_offset == (*header).max_offset
}

/// # Safety
///
/// `slab` must be an initialized slab.
pub unsafe fn slab_is_empty(slab: NonNull<SlabHeader>) -> bool {
    (*slab.as_ptr()).free_offset == 0
}

/// Number of free slots left in `slab`.
///
/// # Safety
///
/// `slab` must be an initialized slab for `obj_size` objects.
pub unsafe fn slab_free_slots(slab: NonNull<SlabHeader>, obj_size: u32) -> u32 {
    let header = slab.as_ptr();
    ((*header).max_offset - (*header).free_offset) / obj_size
}

/// Allocate the next bump slot.
///
/// # Safety
///
/// `slab` must be an initialized, non-full slab for `obj_size` objects.
pub unsafe fn slab_alloc(slab: NonNull<SlabHeader>, obj_size: u32) -> SlabObj {
    let header = slab.as_ptr();
    debug_assert!((*header).free_offset < (*header).max_offset);

    let obj = data_ptr(slab).add((*header).free_offset as usize);
    (*header).free_offset += obj_size;
    SlabObj::new(slab, NonNull::new_unchecked(obj))
}

/// Tag of the object at `offset` within `slab`'s data area.
///
/// # Safety
///
/// `offset` must be in bounds and object aligned.
pub unsafe fn slab_obj_at(slab: NonNull<SlabHeader>, offset: u32) -> SlabObj {
    let obj = data_ptr(slab).add(offset as usize);
    SlabObj::new(slab, NonNull::new_unchecked(obj))
}

/// Free the slot at `tag`, keeping the slab dense: the tail object moves
/// into the hole (bytes plus `M` pointer fix-up) unless the hole already is
/// the tail.
///
/// # Safety
///
/// `tag` must be a live object of `tag.slab()` with size `obj_size`.
pub unsafe fn slab_free<M: Migrate>(tag: SlabObj, obj_size: u32) {
    let slab = tag.slab();
    let header = slab.as_ptr();
    debug_assert!((*header).free_offset >= obj_size);

    (*header).free_offset -= obj_size;
    let tail = slab_obj_at(slab, (*header).free_offset);
    if tail != tag {
        std::ptr::copy_nonoverlapping(tail.obj().as_ptr(), tag.obj().as_ptr(), obj_size as usize);
        M::fix_self_references(tail, tag);
    }
}
