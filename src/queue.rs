//! Per-service mailbox and per-worker run queue.
//!
//! A mailbox is a growable ring of messages behind a spinlock. Pushing
//! never blocks: the ring doubles when full (it starts at 16 entries). A
//! mailbox that goes from idle to non-empty is appended to its worker's
//! run queue. At most one copy of a mailbox is ever queued, guarded by
//! the `in_run_queue` flag. Each service is pinned to one worker queue for
//! its lifetime, which is what makes dispatch serial without a per-service
//! lock.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::index::Handle;
use crate::lock::SpinLock;
use crate::service::Message;

const QUEUE_CAP: usize = 16;
const QUEUE_OVERLOAD: usize = 1024;

struct MailboxInner {
    ring: VecDeque<Message>,
    in_run_queue: bool,
    release: bool,
    overload: usize,
    overload_threshold: usize,
}

pub struct Mailbox {
    handle: Handle,
    worker: Arc<WorkerQueue>,
    inner: SpinLock<MailboxInner>,
}

impl Mailbox {
    /// A fresh mailbox claims the `in_run_queue` flag so nothing enqueues
    /// it before the host does, once the service is actually constructed.
    pub fn new(handle: Handle, worker: Arc<WorkerQueue>) -> Arc<Mailbox> {
        Arc::new(Mailbox {
            handle,
            worker,
            inner: SpinLock::new(MailboxInner {
                ring: VecDeque::with_capacity(QUEUE_CAP),
                in_run_queue: true,
                release: false,
                overload: 0,
                overload_threshold: QUEUE_OVERLOAD,
            }),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Append the mailbox to its worker's run queue unconditionally, used
    /// once by the host right after the service comes up.
    pub fn enqueue(self: &Arc<Self>) {
        self.worker.push(self.clone());
    }

    /// Push a message; returns true if the mailbox just became ready (the
    /// caller should wake a sleeping worker).
    pub fn push(self: &Arc<Self>, m: Message) -> bool {
        let mut inner = self.inner.lock();
        inner.ring.push_back(m);
        if !inner.in_run_queue {
            inner.in_run_queue = true;
            self.worker.push(self.clone());
            return true;
        }
        false
    }

    /// Pop one message. On empty the mailbox leaves the run queue and the
    /// overload threshold resets.
    pub fn pop(&self) -> Option<Message> {
        let mut inner = self.inner.lock();
        match inner.ring.pop_front() {
            Some(m) => {
                let len = inner.ring.len();
                while len > inner.overload_threshold {
                    inner.overload = len;
                    inner.overload_threshold *= 2;
                }
                Some(m)
            }
            None => {
                inner.in_run_queue = false;
                inner.overload_threshold = QUEUE_OVERLOAD;
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the recorded overload high-water mark, clearing it.
    pub fn take_overload(&self) -> usize {
        let mut inner = self.inner.lock();
        std::mem::replace(&mut inner.overload, 0)
    }

    /// Mark the mailbox for teardown. If it is idle, queue it so a worker
    /// observes the flag and finalizes it.
    pub fn try_release(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        inner.release = true;
        if !inner.in_run_queue {
            inner.in_run_queue = true;
            self.worker.push(self.clone());
        }
    }

    /// Finalize a mailbox whose service is gone: route every remaining
    /// message through `dead_letter` exactly once. If teardown has not been
    /// requested yet, the mailbox is re-queued for a later pass and this
    /// returns false.
    pub fn finalize(self: &Arc<Self>, mut dead_letter: impl FnMut(Message)) -> bool {
        {
            let inner = self.inner.lock();
            if !inner.release {
                drop(inner);
                self.worker.push(self.clone());
                return false;
            }
        }
        while let Some(m) = self.pop() {
            dead_letter(m);
        }
        true
    }
}

/// FIFO of ready mailboxes, one per worker thread.
pub struct WorkerQueue {
    queue: SpinLock<VecDeque<Arc<Mailbox>>>,
}

impl WorkerQueue {
    pub fn new() -> Arc<WorkerQueue> {
        Arc::new(WorkerQueue {
            queue: SpinLock::new(VecDeque::new()),
        })
    }

    pub fn push(&self, mq: Arc<Mailbox>) {
        self.queue.lock().push_back(mq);
    }

    pub fn pop(&self) -> Option<Arc<Mailbox>> {
        self.queue.lock().pop_front()
    }
}
