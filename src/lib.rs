/*!
An in-process actor runtime: many lightweight *services* that communicate
only by asynchronous message passing, dispatched by a fixed pool of worker
threads. Each service drains its own mailbox serially while different
services run in parallel; the runtime supplies the plumbing they lean on:
a hierarchical timing wheel for scheduled wake-ups, a single-threaded
socket reactor that fans network readiness back into the mesh, and a
per-service arena allocator for small-object churn.

A service is whatever implements [`Module`] (one-shot construction) and
[`Actor`] (serial dispatch, teardown on drop); the runtime never looks
inside. Messages own their payloads: the sender allocates, the mailbox
holds, the worker frees after dispatch.

## Usage

```no_run
use std::sync::Arc;
use hive::{Actor, Config, Handle, Message, Module, Runtime};

struct Ping;
struct PingActor;

impl Module for Ping {
    fn create(&self, rt: &Arc<Runtime>, handle: Handle, _param: &str) -> Option<Box<dyn Actor>> {
        // Fire a timer at ourselves: one RESP message in ~100 ms.
        rt.timeout(handle, 10);
        Some(Box::new(PingActor))
    }
}

impl Actor for PingActor {
    fn dispatch(&mut self, rt: &Arc<Runtime>, handle: Handle, m: &Message) -> i32 {
        rt.log(handle, format!("tick, session {}", m.session));
        rt.release(handle); // our own reference: last one out shuts down
        0
    }
}

Runtime::run(Config { threads: 2, ..Config::default() }, &Ping).unwrap();
```

## Threads

`N` workers plus a timer thread (advances the wheel every ~2.5 ms), a
socket thread (blocks in the poller), and a monitor thread (flags
dispatches that appear stuck). Services are pinned to a worker by handle,
which is what makes per-service dispatch serial without any per-service
lock.

This crate is Linux-only: it leans on epoll, eventfd, and `mremap`.
*/

pub mod arena;
pub mod codec;
pub mod env;
pub mod event;
pub mod index;
pub mod lock;
pub mod queue;
pub mod service;
pub mod socket;
pub mod timer;

pub use arena::{Arena, ArenaStats};
pub use index::Handle;
pub use service::{Actor, Config, LogModule, Message, Module, Payload, Proto, Runtime};
pub use socket::{Priority, SocketEvent, SocketMessage, SocketPool};
