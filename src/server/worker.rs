// Shard workers
//
// One worker thread owns one shard outright: page accountant, slab pools,
// hash index, LRU, clock ring and the connection table. The loop is a
// readiness poll; every suspension point is a would-block on a socket.
// The listener hands accepted streams over a channel and pokes the waker,
// and the worker absorbs everything pending on each wake-up.
//
// Allocation on this path is reclaim-backed: when pages run short the LRU
// tail is evicted until the request fits, with one aggressive over-reclaim
// retry for oversized requests.

use crate::cache::index::{EntryKind, HashIndex, IndexEntry};
use crate::cache::list::{self, container_of, ListNode};
use crate::cache::record::{self, Record, RecordLayout, RecordMigrate};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::memory::{Accountant, PoolSet, SlabObj, OBJ_SIZE_MAX, PAGE_MASK, PAGE_SHIFT};
use crate::server::conn::{Conn, ConnState};
use crate::server::proto::{
    CMD_DEL, CMD_GET_OR_SET, CMD_SIZE_MAX, CMD_SIZE_MIN, GET_RES_SIZE, SET_REQ_SIZE,
};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Ticks a fresh key lock gets on the shard clock.
const LOCK_CLOCK_TICKS: u8 = 2;

/// Cross-thread handoff into a worker.
pub enum WorkerMsg {
    /// A connection that already passed the shard handshake.
    Conn(TcpStream),
    /// Close every data connection, then acknowledge.
    Drain(Sender<()>),
}

/// The listener's side of one worker.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: Sender<WorkerMsg>,
    waker: Arc<Waker>,
    warmed_up: Arc<AtomicBool>,
}

impl WorkerHandle {
    /// Hand a connected stream to the shard.
    pub fn dispatch(&self, stream: TcpStream) {
        if self.tx.send(WorkerMsg::Conn(stream)).is_ok() {
            let _ = self.waker.wake();
        }
    }

    /// Ask the shard to close all of its connections and wait for the ack.
    pub fn drain(&self) {
        let (ack_tx, ack_rx) = std::sync::mpsc::channel();
        if self.tx.send(WorkerMsg::Drain(ack_tx)).is_ok() {
            let _ = self.waker.wake();
            let _ = ack_rx.recv();
        }
    }

    /// Whether this shard has evicted at least once since start.
    pub fn warmed_up(&self) -> bool {
        self.warmed_up.load(Ordering::Relaxed)
    }
}

/// One shard's whole world.
pub struct Worker {
    shard: u32,
    tick: Duration,
    max_conn: usize,

    poll: Poll,
    rx: Receiver<WorkerMsg>,
    warmed_up: Arc<AtomicBool>,

    mem: Accountant,
    pools: PoolSet,
    index: HashIndex,
    lru: Box<ListNode>,
    clock: Box<ListNode>,
    conns: Slab<Conn>,
}

// Worker owns its raw-pointer-based structures (HashIndex, ListNode, Conn)
// exclusively; it is moved wholly into its own thread by `spawn` and never
// touched by the spawning thread again, so no data race is possible.
unsafe impl Send for Worker {}

impl Worker {
    pub fn new(shard: u32, config: &CacheConfig) -> Result<(Self, WorkerHandle)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (tx, rx) = std::sync::mpsc::channel();
        let warmed_up = Arc::new(AtomicBool::new(false));

        let mut mem = Accountant::new(config.pages_per_shard());
        let index = HashIndex::new(&mut mem).ok_or_else(|| {
            CacheError::Memory(format!("shard {shard}: no pages for the hash index"))
        })?;

        let mut lru = Box::new(ListNode::new());
        let mut clock = Box::new(ListNode::new());
        unsafe {
            list::init(NonNull::from(&mut *lru));
            list::init(NonNull::from(&mut *clock));
        }

        let max_conn = config.conn_per_shard();
        let worker = Self {
            shard,
            tick: Duration::from_millis(u64::from(config.tcp_timeout_ms)),
            max_conn,
            poll,
            rx,
            warmed_up: warmed_up.clone(),
            mem,
            pools: PoolSet::new(),
            index,
            lru,
            clock,
            conns: Slab::with_capacity(max_conn),
        };
        let handle = WorkerHandle {
            tx,
            waker,
            warmed_up,
        };
        Ok((worker, handle))
    }

    /// Run the shard loop forever.
    pub fn run(mut self) {
        let mut events = Events::with_capacity(self.max_conn.max(64));
        let mut next_tick = Instant::now() + self.tick;

        loop {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                panic!("shard {}: poll failed: {e}", self.shard);
            }

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    self.absorb_handoffs();
                    continue;
                }
                let slot = event.token().0;
                let Some(conn) = self.conns.get_mut(slot) else {
                    continue;
                };
                let conn = NonNull::from(conn);
                unsafe {
                    if event.is_error() {
                        self.free_conn(conn);
                    } else if (*conn.as_ptr())
                        .state
                        .runnable(event.is_readable(), event.is_writable())
                    {
                        self.process(conn);
                    }
                }
            }

            let now = Instant::now();
            if now >= next_tick {
                let behind = now.duration_since(next_tick);
                let extra = (behind.as_millis() / self.tick.as_millis().max(1)) as u64;
                next_tick += self.tick * (extra as u32 + 1);
                unsafe { self.clock_tick((extra + 1).min(255)) };
            }
        }
    }

    fn absorb_handoffs(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(WorkerMsg::Conn(stream)) => self.accept_stream(stream),
                Ok(WorkerMsg::Drain(ack)) => {
                    unsafe { self.drain_all() };
                    let _ = ack.send(());
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn accept_stream(&mut self, mut stream: TcpStream) {
        if self.conns.len() >= self.max_conn {
            debug!(shard = self.shard, "connection table full, closing");
            return;
        }
        let entry = self.conns.vacant_entry();
        let slot = entry.key();
        if let Err(e) =
            self.poll
                .registry()
                .register(&mut stream, Token(slot), Interest::READABLE | Interest::WRITABLE)
        {
            warn!(shard = self.shard, "register failed: {e}");
            return;
        }
        let conn = NonNull::from(entry.insert(Conn::new(stream, slot)));
        trace!(shard = self.shard, slot, "connection adopted");
        // Freshly adopted connections owe the client the connected ack byte.
        unsafe { self.process(conn) };
    }

    unsafe fn drain_all(&mut self) {
        let slots: Vec<usize> = self.conns.iter().map(|(slot, _)| slot).collect();
        for slot in slots {
            if self.conns.contains(slot) {
                let conn = NonNull::from(self.conns.get_mut(slot).unwrap());
                self.free_conn(conn);
            }
        }
    }

    // --- connection teardown --------------------------------------------

    /// Release everything `conn` holds and close it.
    unsafe fn free_conn(&mut self, conn: NonNull<Conn>) {
        trace!(shard = self.shard, slot = (*conn.as_ptr()).slot, "free conn");

        if (*conn.as_ptr()).state.holds_key_lock() {
            self.unlock_key_for_failure(conn);
        } else if !(*conn.as_ptr()).borrower.record.is_null() {
            self.return_record_of(conn);
        } else if (*conn.as_ptr()).state == ConnState::GetBlocked {
            list::unlink(NonNull::from(&mut (*conn.as_ptr()).interest));
        }

        let slot = (*conn.as_ptr()).slot;
        let mut gone = self.conns.remove(slot);
        let _ = self.poll.registry().deregister(&mut gone.stream);
    }

    /// The lock holder failed: drop the placeholder and send every waiter
    /// back through the GET path; the first becomes the new holder.
    unsafe fn unlock_key_for_failure(&mut self, conn: NonNull<Conn>) {
        self.cancel_clock(conn);
        self.hash_remove_advance(NonNull::from(&mut (*conn.as_ptr()).hash_node));
        if !(*conn.as_ptr()).borrower.record.is_null() {
            self.return_record_of(conn);
        }

        let head = NonNull::from(&mut (*conn.as_ptr()).interest);
        list::for_each_safe(head, |node| unsafe {
            list::unlink(node);
            let waiter = container_of!(node, Conn, interest);
            self.cmd_get(NonNull::new_unchecked(waiter));
        });
    }

    /// The value arrived: enable the record in place of the placeholder and
    /// serve every waiter from it.
    unsafe fn unlock_key_for_success(&mut self, conn: NonNull<Conn>) {
        self.cancel_clock(conn);
        self.enable_record(conn);
        let rec = NonNull::new_unchecked((*conn.as_ptr()).borrower.record);

        let head = NonNull::from(&mut (*conn.as_ptr()).interest);
        list::for_each_safe(head, |node| unsafe {
            list::unlink(node);
            let waiter = NonNull::new_unchecked(container_of!(node, Conn, interest));
            self.borrow_record(waiter, rec);
            self.change_to_get_out_hit(waiter);
        });

        self.return_record_of(conn);
    }

    // --- clock ----------------------------------------------------------

    unsafe fn call_clock(&mut self, owner: NonNull<Conn>) {
        if (*owner.as_ptr()).clock_time_left == 0 {
            (*owner.as_ptr()).clock_time_left = LOCK_CLOCK_TICKS;
            list::insert_after(
                NonNull::from(&mut *self.clock),
                NonNull::from(&mut (*owner.as_ptr()).clock_node),
            );
        }
    }

    unsafe fn cancel_clock(&mut self, conn: NonNull<Conn>) {
        if (*conn.as_ptr()).clock_time_left > 0 {
            (*conn.as_ptr()).clock_time_left = 0;
            list::unlink(NonNull::from(&mut (*conn.as_ptr()).clock_node));
        }
    }

    /// A timer period (or `elapsed` of them) passed: expire stalled lock
    /// holders, cascading their waiters back through GET.
    unsafe fn clock_tick(&mut self, elapsed: u64) {
        let head = NonNull::from(&mut *self.clock);
        list::for_each_safe(head, |node| unsafe {
            let conn = NonNull::new_unchecked(container_of!(node, Conn, clock_node));
            debug_assert!((*conn.as_ptr()).state.holds_key_lock());
            if elapsed >= u64::from((*conn.as_ptr()).clock_time_left) {
                debug!(shard = self.shard, "key lock expired, closing holder");
                self.free_conn(conn);
            } else {
                (*conn.as_ptr()).clock_time_left -= elapsed as u8;
            }
        });
    }

    // --- reclaim-backed allocation --------------------------------------

    /// Evict the LRU tail once. Fails when the LRU is empty or the tail is
    /// still borrowed.
    unsafe fn reclaim_lru(&mut self) -> bool {
        let head = NonNull::from(&mut *self.lru);
        if list::is_self_linked(head) {
            return false;
        }
        let rec = NonNull::new_unchecked(container_of!(list::last(head), Record, lru));
        if !Record::no_borrowers(rec) {
            return false;
        }

        // The first eviction marks this shard warmed up for the cluster
        // plane.
        self.warmed_up.store(true, Ordering::Relaxed);

        self.disable_record(rec);
        self.record_free(rec);
        true
    }

    fn reserve_pages(&mut self, pages: u64) {
        while self.mem.free_pages() < pages && unsafe { self.reclaim_lru() } {}
    }

    /// Reserve ignoring what is currently free, to satisfy one request that
    /// is larger than the steady-state free pool.
    fn reserve_pages_aggressive(&mut self, pages: u64) {
        let target = self.mem.free_pages() + pages;
        while self.mem.free_pages() < target && unsafe { self.reclaim_lru() } {}
    }

    fn alloc_pages_advance(&mut self, pages: u64) -> Option<NonNull<u8>> {
        self.reserve_pages(pages);
        if let Some(ptr) = self.mem.alloc(pages) {
            return Some(ptr);
        }
        self.reserve_pages_aggressive(pages);
        self.mem.alloc(pages)
    }

    fn pool_alloc_advance(&mut self, size: u64) -> SlabObj {
        let class = self.pools.class_of(size);
        loop {
            let pool = self.pools.pool_mut(class);
            let (free_objects, pages) = (pool.free_objects(), pool.pages_per_slab());
            if free_objects > 0 || self.mem.free_pages() >= pages {
                break;
            }
            if !unsafe { self.reclaim_lru() } {
                break;
            }
        }
        let tag = self.pools.pool_mut(class).alloc(&mut self.mem);
        if !tag.is_null() {
            return tag;
        }

        let pages = self.pools.pool_mut(class).pages_per_slab();
        let target = self.mem.free_pages() + pages;
        loop {
            let free_objects = self.pools.pool_mut(class).free_objects();
            if free_objects > 0 || self.mem.free_pages() >= target {
                break;
            }
            if !unsafe { self.reclaim_lru() } {
                break;
            }
        }
        self.pools.pool_mut(class).alloc(&mut self.mem)
    }

    // --- record lifecycle -----------------------------------------------

    /// Allocate a record for `key`/`val_size` in whichever layout fits.
    unsafe fn record_alloc(&mut self, key: *const u8, val_size: u64) -> Option<NonNull<Record>> {
        let size = record::record_size(key, val_size);

        if size <= OBJ_SIZE_MAX as u64 {
            let tag = self.pool_alloc_advance(size);
            if tag.is_null() {
                return None;
            }
            let rec = tag.obj().cast::<Record>();
            (*rec.as_ptr()).soo = tag;
            return Some(rec);
        }

        let overflow = size & PAGE_MASK as u64;
        if overflow == 0 || overflow + 8 > OBJ_SIZE_MAX as u64 {
            let pages = (size + PAGE_MASK as u64) >> PAGE_SHIFT;
            let rec = self.alloc_pages_advance(pages)?.cast::<Record>();
            // Self-referential tag so the layout probe sees "not concat".
            (*rec.as_ptr()).soo = SlabObj::new(rec.cast(), rec.cast());
            return Some(rec);
        }

        let pages = size >> PAGE_SHIFT;
        let head = self.alloc_pages_advance(pages)?.cast::<Record>();
        let tail = self.pool_alloc_advance(overflow + 8);
        if tail.is_null() {
            self.mem.free(head.cast(), pages);
            return None;
        }
        (tail.obj().as_ptr() as *mut usize)
            .write(std::ptr::addr_of_mut!((*head.as_ptr()).soo) as usize);
        (*head.as_ptr()).soo = tail;
        Some(head)
    }

    /// Free a disabled, unborrowed record.
    unsafe fn record_free(&mut self, rec: NonNull<Record>) {
        debug_assert!(Record::no_borrowers(rec) && !Record::enabled(rec));

        let size = Record::total_size(rec);
        if size <= OBJ_SIZE_MAX as u64 {
            let tag = (*rec.as_ptr()).soo;
            self.pools
                .pool_for(size)
                .free::<RecordMigrate>(tag, &mut self.mem);
        } else if let RecordLayout::Concat { tail } = Record::layout(rec) {
            let tail_size = (size & PAGE_MASK as u64) + 8;
            self.pools
                .pool_for(tail_size)
                .free::<RecordMigrate>(tail, &mut self.mem);
            self.mem.free(rec.cast(), size >> PAGE_SHIFT);
        } else {
            self.mem
                .free(rec.cast(), (size + PAGE_MASK as u64) >> PAGE_SHIFT);
        }
    }

    unsafe fn borrow_record(&mut self, conn: NonNull<Conn>, rec: NonNull<Record>) {
        debug_assert!(Record::enabled(rec));
        record::borrow(rec, NonNull::from(&mut (*conn.as_ptr()).borrower));
        // Touch: move to the LRU front.
        list::unlink(NonNull::from(&mut (*rec.as_ptr()).lru));
        list::insert_after(
            NonNull::from(&mut *self.lru),
            NonNull::from(&mut (*rec.as_ptr()).lru),
        );
    }

    unsafe fn return_record_of(&mut self, conn: NonNull<Conn>) {
        let rec = record::give_back(NonNull::from(&mut (*conn.as_ptr()).borrower));
        if Record::no_borrowers(rec) && !Record::enabled(rec) {
            self.record_free(rec);
        }
    }

    /// Swap the lock placeholder's bucket slot for the record itself and put
    /// the record on the LRU.
    unsafe fn enable_record(&mut self, conn: NonNull<Conn>) {
        let rec = NonNull::new_unchecked((*conn.as_ptr()).borrower.record);
        (*rec.as_ptr()).hash_node.link.prev = (*conn.as_ptr()).hash_node.link.prev;
        (*rec.as_ptr()).hash_node.link.next = (*conn.as_ptr()).hash_node.link.next;
        debug_assert!((*rec.as_ptr()).hash_node.kind == EntryKind::Record);
        list::fix(NonNull::from(&mut (*rec.as_ptr()).hash_node.link));

        list::insert_after(
            NonNull::from(&mut *self.lru),
            NonNull::from(&mut (*rec.as_ptr()).lru),
        );
    }

    /// Unhook an enabled record from the LRU and the index.
    unsafe fn disable_record(&mut self, rec: NonNull<Record>) {
        debug_assert!(Record::enabled(rec));
        // Off the LRU first so a reclaim inside the index shrink can never
        // pick this record again.
        list::unlink(NonNull::from(&mut (*rec.as_ptr()).lru));
        list::init(NonNull::from(&mut (*rec.as_ptr()).lru));
        self.hash_remove_advance(NonNull::from(&mut (*rec.as_ptr()).hash_node));
    }

    // --- index wrappers with reclaim ------------------------------------

    unsafe fn hash_insert_advance(&mut self, node: NonNull<crate::cache::HashNode>) {
        let need = self.index.insert(node, &mut self.mem);
        if need > 0 {
            self.reserve_pages(need);
            if !self.index.grow(&mut self.mem) {
                self.reserve_pages_aggressive(need);
                let _ = self.index.grow(&mut self.mem);
            }
        }
    }

    unsafe fn hash_remove_advance(&mut self, node: NonNull<crate::cache::HashNode>) {
        let need = self.index.remove(node, &mut self.mem);
        if need > 0 {
            self.reserve_pages(need);
            if !self.index.shrink(&mut self.mem) {
                self.reserve_pages_aggressive(need);
                let _ = self.index.shrink(&mut self.mem);
            }
        }
    }

    // --- socket I/O helpers ---------------------------------------------

    /// Account a read/write result against `unio`. A would-block reports no
    /// progress; anything else fatal closes the connection.
    unsafe fn io_result(&mut self, conn: NonNull<Conn>, res: io::Result<usize>) -> bool {
        match res {
            Ok(n) if n > 0 => {
                debug_assert!((*conn.as_ptr()).unio >= n as u64);
                (*conn.as_ptr()).unio -= n as u64;
                true
            }
            Ok(_) => {
                self.free_conn(conn);
                false
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(_) => {
                self.free_conn(conn);
                false
            }
        }
    }

    /// Read up to `unio` bytes into `dst`.
    unsafe fn read_some(&mut self, conn: NonNull<Conn>, dst: *mut u8) -> bool {
        let unio = (*conn.as_ptr()).unio as usize;
        debug_assert!(unio > 0);
        let buf = std::slice::from_raw_parts_mut(dst, unio);
        let res = (*conn.as_ptr()).stream.read(buf);
        self.io_result(conn, res)
    }

    unsafe fn full_read(&mut self, conn: NonNull<Conn>, dst: *mut u8) -> bool {
        self.read_some(conn, dst) && (*conn.as_ptr()).unio == 0
    }

    unsafe fn full_read_vectored(&mut self, conn: NonNull<Conn>, bufs: &mut [IoSliceMut<'_>]) -> bool {
        debug_assert!((*conn.as_ptr()).unio > 0);
        let res = (*conn.as_ptr()).stream.read_vectored(bufs);
        self.io_result(conn, res) && (*conn.as_ptr()).unio == 0
    }

    unsafe fn full_write(&mut self, conn: NonNull<Conn>, src: *const u8) -> bool {
        let unio = (*conn.as_ptr()).unio as usize;
        debug_assert!(unio > 0);
        let buf = std::slice::from_raw_parts(src, unio);
        let res = (*conn.as_ptr()).stream.write(buf);
        self.io_result(conn, res) && (*conn.as_ptr()).unio == 0
    }

    unsafe fn full_write_vectored(&mut self, conn: NonNull<Conn>, bufs: &[IoSlice<'_>]) -> bool {
        debug_assert!((*conn.as_ptr()).unio > 0);
        let res = (*conn.as_ptr()).stream.write_vectored(bufs);
        self.io_result(conn, res) && (*conn.as_ptr()).unio == 0
    }

    /// Single status byte; all-or-nothing.
    unsafe fn write_byte(&mut self, conn: NonNull<Conn>, byte: u8) -> bool {
        match (*conn.as_ptr()).stream.write(&[byte]) {
            Ok(n) if n > 0 => true,
            Ok(_) => {
                self.free_conn(conn);
                false
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(_) => {
                self.free_conn(conn);
                false
            }
        }
    }

    // --- the state machine ----------------------------------------------

    unsafe fn process(&mut self, conn: NonNull<Conn>) {
        match (*conn.as_ptr()).state {
            ConnState::InCmd => self.state_in_cmd(conn),
            ConnState::OutSuccess => self.state_out_success(conn),
            ConnState::GetOutHit => self.state_get_out_hit(conn),
            ConnState::GetOutMiss => self.state_get_out_miss(conn),
            ConnState::SetInValueSize => self.state_set_in_value_size(conn),
            ConnState::SetInValue => self.state_set_in_value(conn),
            // Parked connections get no events of their own.
            ConnState::GetBlocked => unreachable!("blocked connection dispatched"),
        }
    }

    unsafe fn change_to_in_cmd(&mut self, conn: NonNull<Conn>) {
        debug_assert!(matches!(
            (*conn.as_ptr()).state,
            ConnState::OutSuccess | ConnState::GetOutHit
        ));
        debug_assert!((*conn.as_ptr()).borrower.record.is_null());
        (*conn.as_ptr()).state = ConnState::InCmd;
        (*conn.as_ptr()).unio = CMD_SIZE_MAX as u64;
        // No eager read: we just wrote, so the readable edge for the next
        // command has not fired yet.
    }

    unsafe fn state_out_success(&mut self, conn: NonNull<Conn>) {
        if self.write_byte(conn, 0) {
            self.change_to_in_cmd(conn);
        }
    }

    unsafe fn change_to_out_success(&mut self, conn: NonNull<Conn>) {
        (*conn.as_ptr()).state = ConnState::OutSuccess;
        self.state_out_success(conn);
    }

    unsafe fn state_get_out_hit(&mut self, conn: NonNull<Conn>) {
        let rec = NonNull::new_unchecked((*conn.as_ptr()).borrower.record);
        let val_size = (*rec.as_ptr()).val_size;
        let written = GET_RES_SIZE as u64 + val_size - (*conn.as_ptr()).unio;

        let mut bufs: [IoSlice<'_>; 3] = [
            IoSlice::new(&[]),
            IoSlice::new(&[]),
            IoSlice::new(&[]),
        ];
        let n;
        if written < GET_RES_SIZE as u64 {
            let header = &(&(*conn.as_ptr()).out_buf)[written as usize..GET_RES_SIZE];
            bufs[0] = IoSlice::new(header);
            let (ranges, count) = Record::val_ranges(rec, 0);
            for i in 0..count {
                bufs[1 + i] = IoSlice::new(std::slice::from_raw_parts(ranges[i].0, ranges[i].1));
            }
            n = 1 + count;
        } else {
            let (ranges, count) = Record::val_ranges(rec, written - GET_RES_SIZE as u64);
            for i in 0..count {
                bufs[i] = IoSlice::new(std::slice::from_raw_parts(ranges[i].0, ranges[i].1));
            }
            n = count;
        }

        if self.full_write_vectored(conn, &bufs[..n]) {
            self.return_record_of(conn);
            self.change_to_in_cmd(conn);
        }
    }

    unsafe fn change_to_get_out_hit(&mut self, conn: NonNull<Conn>) {
        let rec = NonNull::new_unchecked((*conn.as_ptr()).borrower.record);
        let val_size = (*rec.as_ptr()).val_size;
        (&mut (*conn.as_ptr()).out_buf)[..8].copy_from_slice(&val_size.to_be_bytes());
        (*conn.as_ptr()).out_buf[8] = 0;
        (*conn.as_ptr()).state = ConnState::GetOutHit;
        (*conn.as_ptr()).unio = GET_RES_SIZE as u64 + val_size;
        self.state_get_out_hit(conn);
    }

    unsafe fn state_get_out_miss(&mut self, conn: NonNull<Conn>) {
        let written = GET_RES_SIZE as u64 - (*conn.as_ptr()).unio;
        let src = (*conn.as_ptr()).out_buf.as_ptr().add(written as usize);
        if self.full_write(conn, src) {
            (*conn.as_ptr()).state = ConnState::SetInValueSize;
            (*conn.as_ptr()).unio = SET_REQ_SIZE as u64;
            // The value size follows from the peer; wait for its edge.
        }
    }

    unsafe fn change_to_get_out_miss(&mut self, conn: NonNull<Conn>) {
        (&mut (*conn.as_ptr()).out_buf)[..8].fill(0);
        (*conn.as_ptr()).out_buf[8] = 1;
        (*conn.as_ptr()).state = ConnState::GetOutMiss;
        (*conn.as_ptr()).unio = GET_RES_SIZE as u64;
        self.state_get_out_miss(conn);
    }

    unsafe fn change_to_set_in_value_success(&mut self, conn: NonNull<Conn>) {
        self.unlock_key_for_success(conn);
        self.change_to_out_success(conn);
    }

    unsafe fn state_set_in_value(&mut self, conn: NonNull<Conn>) {
        let rec = NonNull::new_unchecked((*conn.as_ptr()).borrower.record);
        let done = (*rec.as_ptr()).val_size - (*conn.as_ptr()).unio;
        let (ranges, count) = Record::val_ranges(rec, done);

        let mut bufs: [IoSliceMut<'_>; 2] = [IoSliceMut::new(&mut []), IoSliceMut::new(&mut [])];
        for i in 0..count {
            bufs[i] = IoSliceMut::new(std::slice::from_raw_parts_mut(ranges[i].0, ranges[i].1));
        }
        if self.full_read_vectored(conn, &mut bufs[..count]) {
            self.change_to_set_in_value_success(conn);
        }
    }

    unsafe fn change_to_set_in_value(&mut self, conn: NonNull<Conn>) {
        let rec = NonNull::new_unchecked((*conn.as_ptr()).borrower.record);
        if (*rec.as_ptr()).val_size == 0 {
            self.change_to_set_in_value_success(conn);
        } else {
            (*conn.as_ptr()).state = ConnState::SetInValue;
            (*conn.as_ptr()).unio = (*rec.as_ptr()).val_size;
            self.state_set_in_value(conn);
        }
    }

    unsafe fn state_set_in_value_size(&mut self, conn: NonNull<Conn>) {
        let done = SET_REQ_SIZE as u64 - (*conn.as_ptr()).unio;
        let dst = (*conn.as_ptr()).out_buf.as_mut_ptr().add(done as usize);
        if !self.full_read(conn, dst) {
            return;
        }

        let val_size = u64::from_be_bytes((&(*conn.as_ptr()).out_buf)[..8].try_into().unwrap());
        if val_size == 0 {
            // The peer declined to fill; unlock with failure so a waiter can
            // take over, but the decline itself is answered with success.
            self.unlock_key_for_failure(conn);
            self.change_to_out_success(conn);
            return;
        }

        (*conn.as_ptr()).val_size = val_size;
        let key = (*conn.as_ptr()).key.as_ptr();
        match self.record_alloc(key, val_size) {
            Some(rec) => {
                Record::init(rec, key, val_size);
                record::borrow(rec, NonNull::from(&mut (*conn.as_ptr()).borrower));
                self.change_to_set_in_value(conn);
            }
            None => {
                debug!(shard = self.shard, "record allocation failed, closing setter");
                self.free_conn(conn);
            }
        }
    }

    unsafe fn lock_key(&mut self, conn: NonNull<Conn>) {
        (*conn.as_ptr()).hash_node.kind = EntryKind::Placeholder;
        self.hash_insert_advance(NonNull::from(&mut (*conn.as_ptr()).hash_node));
        list::init(NonNull::from(&mut (*conn.as_ptr()).interest));
    }

    unsafe fn cmd_get(&mut self, conn: NonNull<Conn>) {
        let key = (*conn.as_ptr()).key.as_ptr();
        match self.index.get(key) {
            None => {
                self.lock_key(conn);
                self.change_to_get_out_miss(conn);
            }
            Some(IndexEntry::Placeholder(node)) => {
                let owner = NonNull::new_unchecked(container_of!(node, Conn, hash_node));
                (*conn.as_ptr()).state = ConnState::GetBlocked;
                list::insert_after(
                    NonNull::from(&mut (*owner.as_ptr()).interest),
                    NonNull::from(&mut (*conn.as_ptr()).interest),
                );
                self.call_clock(owner);
            }
            Some(IndexEntry::Record(node)) => {
                let rec = NonNull::new_unchecked(container_of!(node, Record, hash_node));
                self.borrow_record(conn, rec);
                self.change_to_get_out_hit(conn);
            }
        }
    }

    unsafe fn cmd_del(&mut self, conn: NonNull<Conn>) {
        let key = (*conn.as_ptr()).key.as_ptr();
        match self.index.get(key) {
            None => {}
            Some(IndexEntry::Placeholder(node)) => {
                // Deleting a key someone is filling kills the filler; its
                // waiters re-run GET and see the deletion.
                let owner = NonNull::new_unchecked(container_of!(node, Conn, hash_node));
                debug_assert!((*owner.as_ptr()).state.holds_key_lock());
                self.free_conn(owner);
            }
            Some(IndexEntry::Record(node)) => {
                let rec = NonNull::new_unchecked(container_of!(node, Record, hash_node));
                self.disable_record(rec);
                if Record::no_borrowers(rec) {
                    self.record_free(rec);
                }
            }
        }
        self.change_to_out_success(conn);
    }

    unsafe fn state_in_cmd(&mut self, conn: NonNull<Conn>) {
        debug_assert!((*conn.as_ptr()).borrower.record.is_null());

        let done = CMD_SIZE_MAX as u64 - (*conn.as_ptr()).unio;
        let dst = (*conn.as_ptr()).in_buf.as_mut_ptr().add(done as usize);
        if !self.read_some(conn, dst) {
            return;
        }

        let done = (CMD_SIZE_MAX as u64 - (*conn.as_ptr()).unio) as usize;
        if done < CMD_SIZE_MIN {
            return;
        }
        let klen = (*conn.as_ptr()).in_buf[1] as usize;
        if done < CMD_SIZE_MIN + klen {
            return;
        }

        // Stage the key zero-padded to the 8-byte comparison stride.
        let conn_ref = &mut *conn.as_ptr();
        conn_ref.key[0] = klen as u8;
        conn_ref.key[1..1 + klen].copy_from_slice(&conn_ref.in_buf[2..2 + klen]);
        let padded = (1 + klen + 7) & !7;
        conn_ref.key[1 + klen..padded].fill(0);

        match conn_ref.in_buf[0] {
            CMD_GET_OR_SET => self.cmd_get(conn),
            CMD_DEL => self.cmd_del(conn),
            cmd => {
                debug!(shard = self.shard, cmd, "unknown command");
                self.free_conn(conn);
            }
        }
    }
}

/// Spawn a worker on its own thread; the handle stays with the caller.
pub fn spawn(shard: u32, config: &CacheConfig) -> Result<WorkerHandle> {
    let (worker, handle) = Worker::new(shard, config)?;
    std::thread::Builder::new()
        .name(format!("shard-{shard}"))
        .spawn(move || worker.run())
        .map_err(CacheError::Io)?;
    Ok(handle)
}
