//! Fixed packet pool.
//!
//! The controller owns a fixed inventory of message buffers. Every buffer is
//! either on the free list, queued (a unit FIFO or the deferred response
//! queue), or held as a unit's in-progress packet; `free + in_flight` is
//! constant. Queues are intrusive singly-linked lists of handles threaded
//! through the pool slots, and handles carry a generation so a stale handle
//! can never reach a recycled slot.

use crate::proto::Packet;

/// Number of packet buffers in the pool.
pub const POOL_SIZE: usize = 32;

/// Generation-checked handle to a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PktRef {
    idx: u8,
    gen: u32,
}

struct Slot {
    pkt: Packet,
    gen: u32,
    next: Option<PktRef>,
    live: bool,
}

pub struct PacketPool {
    slots: Vec<Slot>,
    free_head: Option<PktRef>,
    free_count: usize,
}

impl PacketPool {
    pub fn new() -> Self {
        let mut pool = Self {
            slots: (0..POOL_SIZE)
                .map(|_| Slot {
                    pkt: Packet::zeroed(),
                    gen: 0,
                    next: None,
                    live: false,
                })
                .collect(),
            free_head: None,
            free_count: 0,
        };
        pool.reset();
        pool
    }

    /// Return every slot to the free list (controller reset).
    pub fn reset(&mut self) {
        self.free_head = None;
        self.free_count = POOL_SIZE;
        for idx in (0..POOL_SIZE).rev() {
            let gen = self.slots[idx].gen.wrapping_add(1);
            self.slots[idx] = Slot {
                pkt: Packet::zeroed(),
                gen,
                next: self.free_head,
                live: false,
            };
            self.free_head = Some(PktRef { idx: idx as u8, gen });
        }
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    pub fn in_flight(&self) -> usize {
        POOL_SIZE - self.free_count
    }

    /// Take a zeroed packet off the free list.
    pub fn alloc(&mut self) -> Option<PktRef> {
        let head = self.free_head?;
        let slot = &mut self.slots[head.idx as usize];
        debug_assert_eq!(slot.gen, head.gen);
        self.free_head = slot.next;
        slot.next = None;
        slot.live = true;
        slot.pkt = Packet::zeroed();
        self.free_count -= 1;
        Some(head)
    }

    /// Return a packet to the free list. The handle (and any copies of it)
    /// is dead afterwards.
    pub fn free(&mut self, r: PktRef) {
        let slot = &mut self.slots[r.idx as usize];
        debug_assert!(slot.live && slot.gen == r.gen, "double free or stale handle");
        if !slot.live || slot.gen != r.gen {
            return;
        }
        slot.gen = slot.gen.wrapping_add(1);
        slot.live = false;
        slot.next = self.free_head;
        self.free_head = Some(PktRef {
            idx: r.idx,
            gen: slot.gen,
        });
        self.free_count += 1;
    }

    pub fn get(&self, r: PktRef) -> &Packet {
        let slot = &self.slots[r.idx as usize];
        assert!(slot.live && slot.gen == r.gen, "stale packet handle");
        &slot.pkt
    }

    pub fn get_mut(&mut self, r: PktRef) -> &mut Packet {
        let slot = &mut self.slots[r.idx as usize];
        assert!(slot.live && slot.gen == r.gen, "stale packet handle");
        &mut slot.pkt
    }

    fn link(&mut self, r: PktRef) -> &mut Option<PktRef> {
        let slot = &mut self.slots[r.idx as usize];
        debug_assert!(slot.live && slot.gen == r.gen);
        &mut slot.next
    }
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Intrusive FIFO of pool packets.
///
/// `push_tail` is the normal enqueue; `push_head` exists solely to put back a
/// provisionally dequeued packet unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PktQueue {
    head: Option<PktRef>,
    tail: Option<PktRef>,
    len: usize,
}

impl PktQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn push_tail(&mut self, pool: &mut PacketPool, r: PktRef) {
        *pool.link(r) = None;
        match self.tail {
            Some(t) => *pool.link(t) = Some(r),
            None => self.head = Some(r),
        }
        self.tail = Some(r);
        self.len += 1;
    }

    pub fn push_head(&mut self, pool: &mut PacketPool, r: PktRef) {
        *pool.link(r) = self.head;
        if self.head.is_none() {
            self.tail = Some(r);
        }
        self.head = Some(r);
        self.len += 1;
    }

    pub fn pop_head(&mut self, pool: &mut PacketPool) -> Option<PktRef> {
        let head = self.head?;
        self.head = *pool.link(head);
        if self.head.is_none() {
            self.tail = None;
        }
        *pool.link(head) = None;
        self.len -= 1;
        Some(head)
    }

    /// Remove and return the first queued packet matching `pred`.
    pub fn remove_where(
        &mut self,
        pool: &mut PacketPool,
        pred: impl Fn(&Packet) -> bool,
    ) -> Option<PktRef> {
        let mut prev: Option<PktRef> = None;
        let mut cur = self.head;
        while let Some(r) = cur {
            let next = *pool.link(r);
            if pred(pool.get(r)) {
                match prev {
                    Some(p) => *pool.link(p) = next,
                    None => self.head = next,
                }
                if self.tail == Some(r) {
                    self.tail = prev;
                }
                *pool.link(r) = None;
                self.len -= 1;
                return Some(r);
            }
            prev = cur;
            cur = next;
        }
        None
    }

    /// Drain every queued packet back to the free list.
    pub fn clear(&mut self, pool: &mut PacketPool) {
        while let Some(r) = self.pop_head(pool) {
            pool.free(r);
        }
    }
}
