// Size-class pools
//
// A pool owns every slab of one object size. Slabs with free slots sit on
// the partial list; allocation bumps the most recently touched one. Freeing
// keeps slabs dense through tail migration, and once a pool accumulates two
// slabs' worth of free slots it drains its emptiest slab — migrating the
// survivors into the other slabs — and returns the pages to the accountant.
//
// The pool set maps any request size to a class through a table built once
// at startup; two adjacent classes exist only when their slab footprint
// differs, so the table is the only size logic on the hot path.

use super::accountant::Accountant;
use super::slab::{
    calculate_order, data_size, slab_alloc, slab_free, slab_free_slots, slab_init, slab_is_full,
    slab_obj_at, Migrate, SlabHeader, SlabObj, NO_PARTIAL_SLOT, OBJ_ALIGN, OBJ_SIZE_MAX,
};
use std::ptr::NonNull;

/// Smallest object size a pool serves.
pub const OBJ_SIZE_MIN: usize = 16;

/// Pool of slabs for one object size.
#[derive(Debug)]
pub struct Pool {
    obj_size: u32,
    order: u32,
    pages_per_slab: u64,
    objects_per_slab: u32,
    free_objects: u32,
    partial: Vec<NonNull<SlabHeader>>,
}

impl Pool {
    pub fn new(obj_size: usize) -> Self {
        let obj_size = (obj_size + OBJ_ALIGN - 1) & !(OBJ_ALIGN - 1);
        assert!((OBJ_SIZE_MIN..=OBJ_SIZE_MAX).contains(&obj_size));

        let order = calculate_order(obj_size);
        Self {
            obj_size: obj_size as u32,
            order,
            pages_per_slab: 1 << order,
            objects_per_slab: (data_size(order) / obj_size) as u32,
            free_objects: 0,
            partial: Vec::new(),
        }
    }

    pub fn obj_size(&self) -> u32 {
        self.obj_size
    }

    pub fn pages_per_slab(&self) -> u64 {
        self.pages_per_slab
    }

    pub fn objects_per_slab(&self) -> u32 {
        self.objects_per_slab
    }

    pub fn free_objects(&self) -> u32 {
        self.free_objects
    }

    /// Slab shape of this pool; equal shapes mean two sizes share a class.
    fn footprint(&self) -> (u64, u32) {
        (self.pages_per_slab, self.objects_per_slab)
    }

    fn push_partial(&mut self, slab: NonNull<SlabHeader>) {
        unsafe {
            debug_assert_eq!((*slab.as_ptr()).partial_slot, NO_PARTIAL_SLOT);
            (*slab.as_ptr()).partial_slot = self.partial.len() as u32;
        }
        self.partial.push(slab);
    }

    fn remove_partial(&mut self, slab: NonNull<SlabHeader>) {
        unsafe {
            let slot = (*slab.as_ptr()).partial_slot as usize;
            debug_assert_eq!(self.partial[slot], slab);
            (*slab.as_ptr()).partial_slot = NO_PARTIAL_SLOT;
            self.partial.swap_remove(slot);
            if let Some(&moved) = self.partial.get(slot) {
                (*moved.as_ptr()).partial_slot = slot as u32;
            }
        }
    }

    fn add_slab(&mut self, mem: &mut Accountant) -> bool {
        let Some(block) = mem.alloc(self.pages_per_slab) else {
            return false;
        };
        let slab = block.cast::<SlabHeader>();
        unsafe { slab_init(slab, self.order, self.obj_size) };
        self.push_partial(slab);
        self.free_objects += self.objects_per_slab;
        true
    }

    /// Take one slot from the partial list. The list must not be empty.
    fn alloc_slot(&mut self) -> SlabObj {
        let slab = *self.partial.last().expect("partial slab");
        let tag = unsafe { slab_alloc(slab, self.obj_size) };
        self.free_objects -= 1;
        if unsafe { slab_is_full(slab) } {
            self.remove_partial(slab);
        }
        tag
    }

    /// Allocate one object, growing by a slab if necessary.
    ///
    /// Returns [`SlabObj::NULL`] when no slab space can be obtained.
    pub fn alloc(&mut self, mem: &mut Accountant) -> SlabObj {
        if self.partial.is_empty() && !self.add_slab(mem) {
            return SlabObj::NULL;
        }
        self.alloc_slot()
    }

    /// Free the object at `tag`; `M` rewires whatever object gets moved into
    /// the hole. Reaching two slabs' worth of free slots reclaims one slab.
    ///
    /// # Safety
    ///
    /// `tag` must be a live allocation of this pool.
    pub unsafe fn free<M: Migrate>(&mut self, tag: SlabObj, mem: &mut Accountant) {
        let slab = tag.slab();
        if (*slab.as_ptr()).partial_slot == NO_PARTIAL_SLOT {
            self.push_partial(slab);
        }
        slab_free::<M>(tag, self.obj_size);
        self.free_objects += 1;

        if self.free_objects >= 2 * self.objects_per_slab {
            self.reclaim::<M>(mem);
        }
    }

    /// Drain the emptiest slab and hand its pages back.
    unsafe fn reclaim<M: Migrate>(&mut self, mem: &mut Accountant) {
        let drain = *self
            .partial
            .iter()
            .min_by_key(|slab| unsafe { (*slab.as_ptr()).free_offset })
            .expect("reclaim without partial slabs");
        self.remove_partial(drain);
        let drained_free = slab_free_slots(drain, self.obj_size);

        // Migrate the dense live prefix into the remaining slabs; the free
        // count guarantees they have room.
        let live_end = (*drain.as_ptr()).free_offset;
        let mut offset = 0;
        while offset < live_end {
            let from = slab_obj_at(drain, offset);
            let to = self.alloc_slot();
            std::ptr::copy_nonoverlapping(
                from.obj().as_ptr(),
                to.obj().as_ptr(),
                self.obj_size as usize,
            );
            M::fix_self_references(from, to);
            offset += self.obj_size;
        }

        self.free_objects -= drained_free;
        mem.free(drain.cast(), self.pages_per_slab);
    }
}

/// The family of pools of one shard plus the size-to-class table.
#[derive(Debug)]
pub struct PoolSet {
    pools: Vec<Pool>,
    size_to_class: Vec<u16>,
}

impl PoolSet {
    pub fn new() -> Self {
        let mut pools: Vec<Pool> = Vec::new();
        let mut size_to_class = Vec::with_capacity((OBJ_SIZE_MAX - OBJ_SIZE_MIN) / 8 + 1);

        for size in (OBJ_SIZE_MIN..=OBJ_SIZE_MAX).step_by(8) {
            let candidate = Pool::new(size);
            match pools.last_mut() {
                // Same slab shape: widen the class to this size instead.
                Some(last) if last.footprint() == candidate.footprint() => *last = candidate,
                _ => pools.push(candidate),
            }
            size_to_class.push((pools.len() - 1) as u16);
        }

        Self {
            pools,
            size_to_class,
        }
    }

    pub fn class_count(&self) -> usize {
        self.pools.len()
    }

    /// Class index serving objects of `size` bytes.
    pub fn class_of(&self, size: u64) -> usize {
        debug_assert!(size <= OBJ_SIZE_MAX as u64);
        let size = (size.max(OBJ_SIZE_MIN as u64) as usize + 7) & !7;
        self.size_to_class[(size - OBJ_SIZE_MIN) / 8] as usize
    }

    pub fn pool_for(&mut self, size: u64) -> &mut Pool {
        let class = self.class_of(size);
        let pool = &mut self.pools[class];
        debug_assert!(u64::from(pool.obj_size) >= size);
        pool
    }

    pub fn pool_mut(&mut self, class: usize) -> &mut Pool {
        &mut self.pools[class]
    }
}

impl Default for PoolSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    // Test objects carry their own tag at offset 0 and an id at offset 8;
    // migration rewrites the tag and reports the move to the registry.
    thread_local! {
        static REGISTRY: RefCell<HashMap<u64, SlabObj>> = RefCell::new(HashMap::new());
    }

    struct TestMigrate;

    impl Migrate for TestMigrate {
        unsafe fn fix_self_references(from: SlabObj, to: SlabObj) {
            let obj = to.obj().as_ptr();
            assert_eq!((obj as *const SlabObj).read(), from);
            (obj as *mut SlabObj).write(to);
            let id = (obj.add(8) as *const u64).read();
            REGISTRY.with(|r| r.borrow_mut().insert(id, to));
        }
    }

    unsafe fn alloc_obj(pool: &mut Pool, mem: &mut Accountant, id: u64) -> SlabObj {
        let tag = pool.alloc(mem);
        assert!(!tag.is_null());
        let obj = tag.obj().as_ptr();
        (obj as *mut SlabObj).write(tag);
        (obj.add(8) as *mut u64).write(id);
        REGISTRY.with(|r| r.borrow_mut().insert(id, tag));
        tag
    }

    #[test]
    fn test_class_table_shape() {
        let set = PoolSet::new();
        assert!(set.class_count() > 16);
        for size in (OBJ_SIZE_MIN..=OBJ_SIZE_MAX).step_by(8) {
            let class = set.class_of(size as u64);
            let pool = &set.pools[class];
            assert!(pool.obj_size() as usize >= size);
            // A smaller class either cannot hold the size or needs a bigger
            // slab for it.
            if class > 0 {
                let prev = &set.pools[class - 1];
                assert!(
                    (prev.obj_size() as usize) < size
                        || prev.pages_per_slab() > pool.pages_per_slab()
                );
            }
        }
    }

    #[test]
    fn test_odd_sizes_round_up() {
        let set = PoolSet::new();
        assert_eq!(set.class_of(1), set.class_of(OBJ_SIZE_MIN as u64));
        assert_eq!(set.class_of(17), set.class_of(24));
    }

    #[test]
    fn test_alloc_spills_to_new_slab() {
        let mut mem = Accountant::new(64);
        let mut pool = Pool::new(512);
        let per_slab = pool.objects_per_slab() as u64;

        for id in 0..per_slab + 1 {
            unsafe { alloc_obj(&mut pool, &mut mem, id) };
        }
        assert_eq!(
            mem.free_pages(),
            64 - 2 * pool.pages_per_slab(),
            "second slab should have been borrowed"
        );
    }

    #[test]
    fn test_alloc_fails_cleanly_when_budget_gone() {
        let mut mem = Accountant::new(0);
        let mut pool = Pool::new(64);
        assert!(pool.alloc(&mut mem).is_null());
        assert_eq!(pool.free_objects(), 0);
    }

    #[test]
    fn test_reclaim_returns_slab_to_accountant() {
        let mut mem = Accountant::new(64);
        let mut pool = Pool::new(256);
        let per_slab = pool.objects_per_slab() as u64;

        // Fill two slabs, then free everything from one of them; the free
        // threshold cannot trip before both slabs carry free slots.
        let mut tags = Vec::new();
        for id in 0..2 * per_slab {
            tags.push(unsafe { alloc_obj(&mut pool, &mut mem, id) });
        }
        assert_eq!(mem.free_pages(), 64 - 2 * pool.pages_per_slab());

        for id in 0..2 * per_slab {
            let tag = REGISTRY.with(|r| r.borrow()[&id]);
            unsafe { pool.free::<TestMigrate>(tag, &mut mem) };
            assert!(pool.free_objects() < 2 * pool.objects_per_slab());
        }
        // All objects are gone; at most one slab may remain borrowed.
        assert!(mem.free_pages() >= 64 - pool.pages_per_slab());
    }

    #[test]
    fn test_random_churn_keeps_accounting() {
        let mut mem = Accountant::new(256);
        let mut pool = Pool::new(128);
        let mut live: Vec<u64> = Vec::new();
        let mut next_id = 0u64;
        // Deterministic xorshift so failures reproduce.
        let mut state = 0x9e3779b97f4a7c15u64;
        let mut rng = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        for _ in 0..4000 {
            if live.is_empty() || rng() % 3 != 0 {
                unsafe { alloc_obj(&mut pool, &mut mem, next_id) };
                live.push(next_id);
                next_id += 1;
            } else {
                let victim = live.swap_remove((rng() % live.len() as u64) as usize);
                let tag = REGISTRY.with(|r| r.borrow()[&victim]);
                unsafe { pool.free::<TestMigrate>(tag, &mut mem) };
            }

            // Every live object's registered tag must still hold its id.
            if next_id % 97 == 0 {
                for &id in &live {
                    let tag = REGISTRY.with(|r| r.borrow()[&id]);
                    let stored = unsafe { (tag.obj().as_ptr().add(8) as *const u64).read() };
                    assert_eq!(stored, id);
                }
            }
        }

        for &id in &live {
            let tag = REGISTRY.with(|r| r.borrow()[&id]);
            unsafe { pool.free::<TestMigrate>(tag, &mut mem) };
        }
        assert!(mem.free_pages() >= 256 - pool.pages_per_slab());
    }
}
