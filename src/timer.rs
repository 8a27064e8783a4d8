//! Hierarchical timing wheel at 10 ms resolution.
//!
//! One near ring of 256 buckets plus four far rings of 64. A pending
//! node lives in the bucket picked by how many high bits of its expiry
//! tick already match the current tick; every time the clock crosses a
//! ring boundary the matching far bucket is walked and its nodes fall
//! back toward the near ring. Insert is O(1), expiry O(1) amortized.
//!
//! The wheel lock is dropped across dispatch callbacks, so a callback may
//! schedule new timeouts freely.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use nix::time::{clock_gettime, ClockId};

use crate::lock::SpinLock;

const NEAR_SHIFT: u32 = 8;
const NEAR: usize = 1 << NEAR_SHIFT;
const NEAR_MASK: u32 = NEAR as u32 - 1;
const LEVEL_SHIFT: u32 = 6;
const LEVEL: usize = 1 << LEVEL_SHIFT;
const LEVEL_MASK: u32 = LEVEL as u32 - 1;

struct Node<T> {
    expire: u32,
    item: T,
}

struct Wheel<T> {
    time: u32,
    near: [Vec<Node<T>>; NEAR],
    far: [[Vec<Node<T>>; LEVEL]; 4],
}

pub struct Timer<T> {
    wheel: SpinLock<Wheel<T>>,
    /// Centiseconds since start, 32-bit, wrapping.
    current: AtomicU32,
    /// Wall-clock seconds baseline; advanced when `current` wraps.
    start: AtomicU32,
    /// Last observed monotonic centisecond reading. Only the driving
    /// thread writes it.
    checkpoint: AtomicU64,
}

fn monotonic_centis() -> u64 {
    let ts = clock_gettime(ClockId::CLOCK_MONOTONIC_RAW).expect("monotonic clock unavailable");
    ts.tv_sec() as u64 * 100 + ts.tv_nsec() as u64 / 10_000_000
}

fn wall_clock() -> (u32, u32) {
    let ts = clock_gettime(ClockId::CLOCK_REALTIME).expect("wall clock unavailable");
    (ts.tv_sec() as u32, (ts.tv_nsec() / 10_000_000) as u32)
}

impl<T> Timer<T> {
    pub fn new() -> Timer<T> {
        let (sec, centis) = wall_clock();
        Timer {
            wheel: SpinLock::new(Wheel {
                time: 0,
                near: std::array::from_fn(|_| Vec::new()),
                far: std::array::from_fn(|_| std::array::from_fn(|_| Vec::new())),
            }),
            current: AtomicU32::new(centis),
            start: AtomicU32::new(sec),
            checkpoint: AtomicU64::new(monotonic_centis()),
        }
    }

    /// Schedule `item` to fire `ticks` ticks from now (one tick = 10 ms).
    pub fn timeout(&self, ticks: u32, item: T) {
        let mut w = self.wheel.lock();
        let expire = w.time.wrapping_add(ticks);
        add_node(&mut w, Node { expire, item });
    }

    /// Catch the wheel up to the monotonic clock, firing due nodes through
    /// `dispatch`. A clock that ran backwards only rewrites the baseline.
    pub fn update(&self, dispatch: &mut impl FnMut(T)) {
        let now = monotonic_centis();
        let was = self.checkpoint.load(Ordering::Relaxed);
        if now < was {
            self.checkpoint.store(now, Ordering::Relaxed);
            return;
        }
        if now == was {
            return;
        }
        let diff = (now - was) as u32;
        self.checkpoint.store(now, Ordering::Relaxed);
        let before = self.current.load(Ordering::Relaxed);
        let after = before.wrapping_add(diff);
        self.current.store(after, Ordering::Relaxed);
        if after < before {
            // 32-bit centisecond counter wrapped: push the start-of-run
            // second baseline forward by the span of the counter.
            self.start.fetch_add(0xffff_ffff / 100, Ordering::Relaxed);
        }
        self.advance(diff, dispatch);
    }

    /// Centiseconds since the runtime came up.
    pub fn now(&self) -> u32 {
        self.current.load(Ordering::Relaxed)
    }

    /// Wall-clock seconds at (adjusted) start of run.
    pub fn start_time(&self) -> u32 {
        self.start.load(Ordering::Relaxed)
    }

    fn advance(&self, ticks: u32, dispatch: &mut impl FnMut(T)) {
        for _ in 0..ticks {
            self.tick(dispatch);
        }
    }

    fn tick(&self, dispatch: &mut impl FnMut(T)) {
        let mut w = self.wheel.lock();
        w = self.run_due(w, dispatch);
        shift(&mut w);
        w = self.run_due(w, dispatch);
        drop(w);
    }

    /// Fire everything in the current near bucket, releasing the lock
    /// around the callbacks. Loops because a callback may add to the same
    /// bucket.
    fn run_due<'a>(
        &'a self,
        mut w: crate::lock::SpinGuard<'a, Wheel<T>>,
        dispatch: &mut impl FnMut(T),
    ) -> crate::lock::SpinGuard<'a, Wheel<T>> {
        loop {
            let idx = (w.time & NEAR_MASK) as usize;
            if w.near[idx].is_empty() {
                return w;
            }
            let batch = std::mem::take(&mut w.near[idx]);
            drop(w);
            for node in batch {
                dispatch(node.item);
            }
            w = self.wheel.lock();
        }
    }
}

fn add_node<T>(w: &mut Wheel<T>, node: Node<T>) {
    let expire = node.expire;
    let time = w.time;
    if (expire | NEAR_MASK) == (time | NEAR_MASK) {
        w.near[(expire & NEAR_MASK) as usize].push(node);
        return;
    }
    let mut level = 0;
    let mut mask: u32 = (NEAR as u32) << LEVEL_SHIFT;
    while level < 3 {
        if (expire | (mask - 1)) == (time | (mask - 1)) {
            break;
        }
        mask <<= LEVEL_SHIFT;
        level += 1;
    }
    let idx = (expire >> (NEAR_SHIFT + level as u32 * LEVEL_SHIFT)) & LEVEL_MASK;
    w.far[level][idx as usize].push(node);
}

fn cascade<T>(w: &mut Wheel<T>, level: usize, idx: usize) {
    let nodes = std::mem::take(&mut w.far[level][idx]);
    for node in nodes {
        add_node(w, node);
    }
}

fn shift<T>(w: &mut Wheel<T>) {
    w.time = w.time.wrapping_add(1);
    let ct = w.time;
    if ct == 0 {
        cascade(w, 3, 0);
        return;
    }
    let mut level = 0;
    let mut mask = NEAR as u32;
    let mut time = ct >> NEAR_SHIFT;
    while ct & (mask - 1) == 0 {
        let idx = (time & LEVEL_MASK) as usize;
        if idx != 0 {
            cascade(w, level, idx);
            break;
        }
        mask <<= LEVEL_SHIFT;
        time >>= LEVEL_SHIFT;
        level += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn drive(timer: &Timer<u32>, ticks: u32, fired: &RefCell<Vec<(u32, u32)>>, clock: &mut u32) {
        for _ in 0..ticks {
            *clock += 1;
            let at = *clock;
            timer.advance(1, &mut |item| fired.borrow_mut().push((item, at)));
        }
    }

    #[test]
    fn fires_no_earlier_than_requested() {
        let timer: Timer<u32> = Timer::new();
        let fired = RefCell::new(Vec::new());
        let mut clock = 0;
        for (i, ticks) in [1u32, 2, 100, 255, 256, 257, 5000].iter().enumerate() {
            timer.timeout(*ticks, i as u32);
        }
        drive(&timer, 6000, &fired, &mut clock);
        let fired = fired.into_inner();
        assert_eq!(fired.len(), 7);
        let expect = [1u32, 2, 100, 255, 256, 257, 5000];
        for (item, at) in fired {
            let want = expect[item as usize];
            assert!(at >= want, "timer {} fired at {} before {}", item, at, want);
            assert_eq!(at, want, "timer {} fired late: {} != {}", item, at, want);
        }
    }

    #[test]
    fn cascades_through_far_rings() {
        let timer: Timer<u32> = Timer::new();
        let fired = RefCell::new(Vec::new());
        let mut clock = 0;
        // Past the first far ring (2^14 ticks) so two cascades happen.
        timer.timeout(20_000, 42);
        drive(&timer, 19_999, &fired, &mut clock);
        assert!(fired.borrow().is_empty());
        drive(&timer, 1, &fired, &mut clock);
        assert_eq!(*fired.borrow(), vec![(42, 20_000)]);
    }

    #[test]
    fn same_tick_fires_in_fifo_order() {
        let timer: Timer<u32> = Timer::new();
        let fired = RefCell::new(Vec::new());
        let mut clock = 0;
        for i in 0..10 {
            timer.timeout(5, i);
        }
        drive(&timer, 5, &fired, &mut clock);
        let order: Vec<u32> = fired.into_inner().into_iter().map(|(i, _)| i).collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn callback_may_reschedule() {
        let timer: Timer<u32> = Timer::new();
        let mut chain = 0u32;
        let mut pending = true;
        timer.timeout(1, 0);
        for _ in 0..10 {
            timer.advance(1, &mut |item| {
                chain = item;
                pending = true;
            });
            if std::mem::take(&mut pending) && chain < 5 {
                timer.timeout(1, chain + 1);
            }
        }
        assert_eq!(chain, 5);
    }

    #[test]
    fn now_is_monotonic() {
        let timer: Timer<u32> = Timer::new();
        let a = timer.now();
        timer.update(&mut |_| {});
        let b = timer.now();
        assert!(b.wrapping_sub(a) < u32::MAX / 2);
    }
}
