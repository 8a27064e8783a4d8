//! Per-service arena allocator.
//!
//! Each service owns one arena and funnels its small-object churn through
//! it. Three regimes, picked by request size:
//!
//! * **small** (≤ 256 B): 32 size classes of 8-byte stride, each with a LIFO
//!   free list, falling back to bump allocation from the current 32 KiB
//!   chunk, then to splitting a block from a larger class.
//! * **big** (≤ 32 KiB − 16 B): 8-byte-aligned blocks with a leading size
//!   header, recycled through a free list searched at most
//!   [`BIG_SEARCH_DEPTH`] entries deep; oversized hits are split and the
//!   remainder returned to whichever pool fits it.
//! * **huge**: one anonymous mapping per block, kept on a doubly-linked
//!   list; growth tries `mremap` in place before copying.
//!
//! The whole interface is [`Arena::realloc`]: `ptr == null` allocates,
//! `new_size == 0` frees. The caller owns size bookkeeping: `old_size`
//! must be exactly what was asked for, or the free lists are corrupted.
//! There is no internal locking; an arena belongs to a single service.

use std::num::NonZeroUsize;
use std::ptr;

use nix::sys::mman::{mmap, mremap, munmap, MRemapFlags, MapFlags, ProtFlags};

const SMALL_STRIDE: usize = 8;
const SMALL_LEVEL: usize = 32;
const SMALL_LIMIT: usize = SMALL_STRIDE * SMALL_LEVEL;
const CHUNK_SIZE: usize = 32 * 1024;
const HUGE_THRESHOLD: usize = CHUNK_SIZE - 16;
const BIG_SEARCH_DEPTH: usize = 128;

struct Chunk {
    next: *mut Chunk,
}

struct SmallBlock {
    next: *mut SmallBlock,
}

// Only `sz` is live while the block is handed out; `next` overlays user
// data on the free list. Big blocks are > 256 B so both fields always fit.
struct BigBlock {
    sz: usize,
    next: *mut BigBlock,
}

struct HugeBlock {
    prev: *mut HugeBlock,
    next: *mut HugeBlock,
    sz: usize,
}

/// Counters reported by [`Arena::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    pub chunks: usize,
    pub chunk_bytes: usize,
    pub huge_blocks: usize,
    pub huge_bytes: usize,
}

pub struct Arena {
    small: [*mut SmallBlock; SMALL_LEVEL + 1],
    chunk_list: *mut Chunk,
    chunk_used: usize,
    big_head: *mut BigBlock,
    big_tail: *mut BigBlock,
    huge_head: *mut HugeBlock,
}

// SAFETY: the arena owns all the memory its pointers reach; it is handed
// off whole between threads but never shared.
unsafe impl Send for Arena {}

fn map_pages(size: usize) -> *mut u8 {
    let len = match NonZeroUsize::new(size) {
        Some(len) => len,
        None => return ptr::null_mut(),
    };
    // SAFETY: anonymous private mapping, no fd, no fixed address.
    match unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            -1,
            0,
        )
    } {
        Ok(p) => p as *mut u8,
        Err(_) => ptr::null_mut(),
    }
}

impl Arena {
    pub fn new() -> Arena {
        let chunk = map_pages(CHUNK_SIZE) as *mut Chunk;
        assert!(!chunk.is_null(), "arena: initial chunk mapping failed");
        unsafe { (*chunk).next = ptr::null_mut() };
        Arena {
            small: [ptr::null_mut(); SMALL_LEVEL + 1],
            chunk_list: chunk,
            chunk_used: std::mem::size_of::<Chunk>(),
            big_head: ptr::null_mut(),
            big_tail: ptr::null_mut(),
            huge_head: ptr::null_mut(),
        }
    }

    /// Allocate `size` bytes. Returns null only if the kernel refuses a
    /// mapping.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        if size <= SMALL_LIMIT {
            self.alloc_small((size - 1) / SMALL_STRIDE)
        } else if size <= HUGE_THRESHOLD {
            self.alloc_big(size)
        } else {
            self.alloc_huge(size)
        }
    }

    /// Return a block to the pool it came from.
    ///
    /// # Safety
    /// `ptr` must have come from this arena with a request of exactly
    /// `size` bytes, and must not be used afterwards.
    pub unsafe fn free(&mut self, ptr: *mut u8, size: usize) {
        if ptr.is_null() {
            return;
        }
        if size <= SMALL_LIMIT {
            self.free_small(ptr as *mut SmallBlock, (size - 1) / SMALL_STRIDE);
        } else if size <= HUGE_THRESHOLD {
            self.free_big(ptr);
        } else {
            self.free_huge(ptr);
        }
    }

    /// The single entry point the runtime hands out: `ptr == null` means
    /// allocate, `new_size == 0` means free, anything else reallocates
    /// preserving the first `min(old_size, new_size)` bytes.
    ///
    /// # Safety
    /// As for [`Arena::free`]: `old_size` must be the exact size the block
    /// was requested with.
    pub unsafe fn realloc(&mut self, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(new_size);
        }
        if new_size == 0 {
            self.free(ptr, old_size);
            return ptr::null_mut();
        }
        if old_size > HUGE_THRESHOLD && new_size > HUGE_THRESHOLD {
            return self.realloc_huge(ptr, old_size, new_size);
        }
        if new_size <= old_size {
            return ptr;
        }
        let fresh = self.alloc(new_size);
        if fresh.is_null() {
            return ptr::null_mut();
        }
        ptr::copy_nonoverlapping(ptr, fresh, old_size);
        self.free(ptr, old_size);
        fresh
    }

    pub fn stats(&self) -> ArenaStats {
        let mut stats = ArenaStats {
            chunks: 0,
            chunk_bytes: 0,
            huge_blocks: 0,
            huge_bytes: 0,
        };
        let mut c = self.chunk_list;
        while !c.is_null() {
            stats.chunks += 1;
            stats.chunk_bytes += CHUNK_SIZE;
            c = unsafe { (*c).next };
        }
        let mut h = self.huge_head;
        while !h.is_null() {
            stats.huge_blocks += 1;
            stats.huge_bytes += unsafe { (*h).sz };
            h = unsafe { (*h).next };
        }
        stats
    }

    fn chunk_new(&mut self, size: usize) -> *mut u8 {
        let chunk = map_pages(CHUNK_SIZE) as *mut Chunk;
        if chunk.is_null() {
            return ptr::null_mut();
        }
        unsafe {
            (*chunk).next = self.chunk_list;
            self.chunk_list = chunk;
            self.chunk_used = std::mem::size_of::<Chunk>() + size;
            chunk.add(1) as *mut u8
        }
    }

    fn bump(&mut self, size: usize) -> *mut u8 {
        let at = self.chunk_used;
        self.chunk_used += size;
        unsafe { (self.chunk_list as *mut u8).add(at) }
    }

    fn alloc_small(&mut self, class: usize) -> *mut u8 {
        let node = self.small[class];
        if !node.is_null() {
            self.small[class] = unsafe { (*node).next };
            return node as *mut u8;
        }
        let size = (class + 1) * SMALL_STRIDE;
        if self.chunk_used + size <= CHUNK_SIZE {
            return self.bump(size);
        }
        // Steal from a larger class and give the tail back to the class
        // that matches the remainder.
        for larger in class + 1..=SMALL_LEVEL {
            let block = self.small[larger];
            if !block.is_null() {
                unsafe {
                    self.small[larger] = (*block).next;
                    let rest = (block as *mut u8).add(size) as *mut SmallBlock;
                    self.free_small(rest, larger - class - 1);
                }
                return block as *mut u8;
            }
        }
        self.chunk_new(size)
    }

    fn free_small(&mut self, block: *mut SmallBlock, class: usize) {
        unsafe { (*block).next = self.small[class] };
        self.small[class] = block;
    }

    fn alloc_big(&mut self, size: usize) -> *mut u8 {
        let size = (size + std::mem::size_of::<usize>() + 7) & !7;
        if self.chunk_used + size <= CHUNK_SIZE {
            let block = self.bump(size) as *mut BigBlock;
            unsafe {
                (*block).sz = size;
                return (block as *mut u8).add(std::mem::size_of::<usize>());
            }
        }
        let block = match self.take_from_big_list(size) {
            Some(b) => b,
            None => {
                let b = self.chunk_new(size) as *mut BigBlock;
                if b.is_null() {
                    return ptr::null_mut();
                }
                unsafe { (*b).sz = size };
                b
            }
        };
        unsafe { (block as *mut u8).add(std::mem::size_of::<usize>()) }
    }

    fn free_big(&mut self, ptr: *mut u8) {
        let block = unsafe { ptr.sub(std::mem::size_of::<usize>()) } as *mut BigBlock;
        unsafe {
            if self.big_head.is_null() {
                (*block).next = ptr::null_mut();
                self.big_head = block;
                self.big_tail = block;
            } else {
                (*block).next = self.big_head;
                self.big_head = block;
            }
        }
    }

    /// Put a split remainder of `size` bytes at `ptr` back into whichever
    /// pool it fits.
    unsafe fn recycle_split(&mut self, ptr: *mut u8, size: usize) {
        let class = (size - 1) / SMALL_STRIDE;
        if class < SMALL_LEVEL {
            self.free_small(ptr as *mut SmallBlock, class);
        } else {
            let rest = ptr as *mut BigBlock;
            (*rest).sz = size;
            (*rest).next = ptr::null_mut();
            if self.big_head.is_null() {
                self.big_head = rest;
                self.big_tail = rest;
            } else {
                (*self.big_tail).next = rest;
                self.big_tail = rest;
            }
        }
    }

    fn take_from_big_list(&mut self, size: usize) -> Option<*mut BigBlock> {
        if self.big_head.is_null() {
            return None;
        }
        unsafe {
            let head = self.big_head;
            if head == self.big_tail {
                // Single entry: take it whole or split it.
                if (*head).sz < size {
                    return None;
                }
                let spare = (*head).sz - size;
                self.big_head = ptr::null_mut();
                self.big_tail = ptr::null_mut();
                if spare > 0 {
                    (*head).sz = size;
                    self.recycle_split((head as *mut u8).add(size), spare);
                }
                return Some(head);
            }
            // Rotate through the list, bounded, moving misses to the tail.
            let term = head;
            let mut block = head;
            let mut seen = 0;
            loop {
                self.big_head = (*block).next;
                if (*block).sz >= size {
                    let spare = (*block).sz - size;
                    if spare > 0 {
                        (*block).sz = size;
                        self.recycle_split((block as *mut u8).add(size), spare);
                    }
                    return Some(block);
                }
                (*block).next = ptr::null_mut();
                (*self.big_tail).next = block;
                self.big_tail = block;
                block = self.big_head;
                seen += 1;
                if block == term || seen >= BIG_SEARCH_DEPTH {
                    return None;
                }
            }
        }
    }

    fn alloc_huge(&mut self, size: usize) -> *mut u8 {
        let head = map_pages(std::mem::size_of::<HugeBlock>() + size) as *mut HugeBlock;
        if head.is_null() {
            return ptr::null_mut();
        }
        unsafe {
            (*head).prev = ptr::null_mut();
            (*head).next = self.huge_head;
            (*head).sz = size;
            if !self.huge_head.is_null() {
                (*self.huge_head).prev = head;
            }
            self.huge_head = head;
            head.add(1) as *mut u8
        }
    }

    unsafe fn unlink_huge(&mut self, block: *mut HugeBlock) {
        if (*block).prev.is_null() {
            self.huge_head = (*block).next;
        } else {
            (*(*block).prev).next = (*block).next;
        }
        if !(*block).next.is_null() {
            (*(*block).next).prev = (*block).prev;
        }
    }

    unsafe fn free_huge(&mut self, ptr: *mut u8) {
        let block = (ptr as *mut HugeBlock).sub(1);
        self.unlink_huge(block);
        let len = (*block).sz + std::mem::size_of::<HugeBlock>();
        let _ = munmap(block as *mut _, len);
    }

    unsafe fn realloc_huge(&mut self, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
        let block = (ptr as *mut HugeBlock).sub(1);
        let header = std::mem::size_of::<HugeBlock>();
        match mremap(
            block as *mut _,
            old_size + header,
            new_size + header,
            MRemapFlags::MREMAP_MAYMOVE,
            None,
        ) {
            Ok(moved) => {
                let moved = moved as *mut HugeBlock;
                (*moved).sz = new_size;
                if moved != block {
                    // The mapping moved; repoint the neighbours.
                    if (*moved).prev.is_null() {
                        self.huge_head = moved;
                    } else {
                        (*(*moved).prev).next = moved;
                    }
                    if !(*moved).next.is_null() {
                        (*(*moved).next).prev = moved;
                    }
                }
                moved.add(1) as *mut u8
            }
            Err(_) => {
                let fresh = self.alloc_huge(new_size);
                if fresh.is_null() {
                    return ptr::null_mut();
                }
                ptr::copy_nonoverlapping(ptr, fresh, old_size.min(new_size));
                self.free_huge(ptr);
                fresh
            }
        }
    }
}

impl Default for Arena {
    fn default() -> Self {
        Arena::new()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            let mut h = self.huge_head;
            while !h.is_null() {
                let next = (*h).next;
                let len = (*h).sz + std::mem::size_of::<HugeBlock>();
                let _ = munmap(h as *mut _, len);
                h = next;
            }
            let mut c = self.chunk_list;
            while !c.is_null() {
                let next = (*c).next;
                let _ = munmap(c as *mut _, CHUNK_SIZE);
                c = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_free_then_alloc_reuses_block() {
        let mut a = Arena::new();
        let p = a.alloc(24);
        assert!(!p.is_null());
        unsafe {
            a.free(p, 24);
            let q = a.alloc(24);
            assert_eq!(p, q, "a quiescent arena hands the same block back");
            a.free(q, 24);
        }
    }

    #[test]
    fn realloc_preserves_prefix() {
        let mut a = Arena::new();
        unsafe {
            let p = a.realloc(ptr::null_mut(), 0, 100);
            for i in 0..100 {
                *p.add(i) = i as u8;
            }
            let q = a.realloc(p, 100, 5000);
            for i in 0..100 {
                assert_eq!(*q.add(i), i as u8);
            }
            let r = a.realloc(q, 5000, 2000);
            assert_eq!(q, r, "shrinking keeps the block");
            a.realloc(r, 5000, 0);
        }
    }

    #[test]
    fn big_blocks_recycle_through_free_list() {
        let mut a = Arena::new();
        // Two 20 KiB blocks cannot share a 32 KiB chunk, so the third
        // allocation cannot bump; it must come from the free list.
        let p1 = a.alloc(20_000);
        let p2 = a.alloc(20_000);
        assert!(!p1.is_null() && !p2.is_null());
        unsafe {
            a.free(p1, 20_000);
            let p3 = a.alloc(20_000);
            assert_eq!(p3, p1, "freed big block is reused");
            a.free(p3, 20_000);
            a.free(p2, 20_000);
        }
    }

    #[test]
    fn huge_blocks_map_and_grow() {
        let mut a = Arena::new();
        let size = CHUNK_SIZE * 2;
        let p = a.alloc(size);
        assert!(!p.is_null());
        assert_eq!(a.stats().huge_blocks, 1);
        unsafe {
            *p = 0xAB;
            *p.add(size - 1) = 0xCD;
            let q = a.realloc(p, size, size * 4);
            assert!(!q.is_null());
            assert_eq!(*q, 0xAB);
            assert_eq!(*q.add(size - 1), 0xCD);
            assert_eq!(a.stats().huge_blocks, 1);
            a.free(q, size * 4);
        }
        assert_eq!(a.stats().huge_blocks, 0);
    }

    #[test]
    fn stats_count_chunks() {
        let mut a = Arena::new();
        let before = a.stats().chunks;
        // Force a couple of fresh chunks.
        let p = a.alloc(30 * 1024);
        let q = a.alloc(30 * 1024);
        assert!(a.stats().chunks >= before + 1);
        unsafe {
            a.free(p, 30 * 1024);
            a.free(q, 30 * 1024);
        }
    }
}
