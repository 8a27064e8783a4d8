//! Service host: the runtime context, the service lifecycle, and the four
//! thread families (workers, timer, socket, monitor).
//!
//! A service is a mailbox plus an [`Actor`] produced by a [`Module`]. The
//! host guarantees `create` runs before any `dispatch`, `dispatch` runs
//! serially on the one worker the handle is pinned to, and the actor is
//! dropped (its `release`) exactly once, after the final reference goes
//! away and the mailbox has been drained.
//!
//! There is no global state: everything lives in [`Runtime`], and entry
//! points take it explicitly.

use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::codec::hex_dump;
use crate::env::Env;
use crate::index::{Handle, Index};
use crate::lock::SpinLock;
use crate::queue::{Mailbox, WorkerQueue};
use crate::socket::{Reactor, SocketEvent, SocketMessage, SocketPool};
use crate::timer::Timer;

/// Message protocol tags.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Proto {
    /// Replies and timer expiries.
    Resp,
    /// Failure notices (dead-letter replies).
    Error,
    /// Reactor events.
    Socket,
}

impl Proto {
    pub fn tag(self) -> i32 {
        match self {
            Proto::Resp => 0,
            Proto::Error => 1,
            Proto::Socket => 2,
        }
    }
}

#[derive(Debug)]
pub enum Payload {
    Empty,
    Bytes(Box<[u8]>),
    Socket(Box<SocketMessage>),
}

impl Payload {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Payload::Bytes(b) => b,
            _ => &[],
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Empty => 0,
            Payload::Bytes(b) => b.len(),
            Payload::Socket(_) => std::mem::size_of::<SocketMessage>(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One mailbox entry. Ownership of `data` moves with the message: the
/// sender allocates, the mailbox holds, the worker drops it after dispatch.
#[derive(Debug)]
pub struct Message {
    pub source: Handle,
    pub proto: Proto,
    pub session: i32,
    pub data: Payload,
}

/// Service behavior factory. `create` runs once, before any dispatch; a
/// `None` return aborts the launch.
pub trait Module: Send + Sync {
    fn create(&self, rt: &Arc<Runtime>, handle: Handle, param: &str) -> Option<Box<dyn Actor>>;
}

/// Service behavior. Dispatch is serial per handle; teardown is `Drop`.
pub trait Actor: Send {
    fn dispatch(&mut self, rt: &Arc<Runtime>, handle: Handle, m: &Message) -> i32;
}

impl<F> Module for F
where
    F: Fn(&Arc<Runtime>, Handle, &str) -> Option<Box<dyn Actor>> + Send + Sync,
{
    fn create(&self, rt: &Arc<Runtime>, handle: Handle, param: &str) -> Option<Box<dyn Actor>> {
        self(rt, handle, param)
    }
}

impl<F> Actor for F
where
    F: FnMut(&Arc<Runtime>, Handle, &Message) -> i32 + Send,
{
    fn dispatch(&mut self, rt: &Arc<Runtime>, handle: Handle, m: &Message) -> i32 {
        self(rt, handle, m)
    }
}

/// Startup parameters. Parsing a config file is the caller's business;
/// the runtime only consumes this value. `values` is copied into the
/// config store verbatim.
pub struct Config {
    /// Worker thread count.
    pub threads: usize,
    /// Parameter for the log service: a file path, or `None` for stderr.
    pub log: Option<String>,
    /// Parameter handed to the bootstrap module.
    pub boot_param: String,
    pub values: Vec<(String, String)>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            threads: 4,
            log: None,
            boot_param: String::new(),
            values: Vec::new(),
        }
    }
}

#[derive(Clone, Copy)]
struct TimerEvent {
    session: i32,
    handle: Handle,
}

struct Service {
    handle: Handle,
    queue: Arc<Mailbox>,
    session: AtomicI32,
    actor: UnsafeCell<Option<Box<dyn Actor>>>,
    logfile: SpinLock<Option<File>>,
}

// SAFETY: the actor cell is only touched (a) by the one worker the handle
// is pinned to, while it holds a registry grab, and (b) by the thread that
// reaped the slot, after the refcount hit zero, never both.
unsafe impl Sync for Service {}

struct WatchState {
    sleeping: usize,
    quit: bool,
}

struct Watcher {
    state: Mutex<WatchState>,
    cond: Condvar,
}

/// Per-worker liveness counter. The worker bumps `version` around every
/// dispatch; the monitor thread compares against its snapshot.
struct Monitor {
    version: AtomicU32,
    check: AtomicU32,
    source: AtomicU32,
    handle: AtomicU32,
}

impl Monitor {
    fn new() -> Monitor {
        Monitor {
            version: AtomicU32::new(0),
            check: AtomicU32::new(0),
            source: AtomicU32::new(0),
            handle: AtomicU32::new(0),
        }
    }

    fn trigger(&self, source: Handle, handle: Handle) {
        self.source.store(source, Ordering::Relaxed);
        self.handle.store(handle, Ordering::Relaxed);
        self.version.fetch_add(1, Ordering::Release);
    }

    fn check(&self, rt: &Runtime) {
        let version = self.version.load(Ordering::Acquire);
        if version == self.check.load(Ordering::Relaxed) {
            let handle = self.handle.load(Ordering::Relaxed);
            if handle != 0 {
                rt.log(
                    handle,
                    format!(
                        "message from [{}] to [{}] maybe in endless loop (version={})",
                        self.source.load(Ordering::Relaxed),
                        handle,
                        version
                    ),
                );
            }
        } else {
            self.check.store(version, Ordering::Relaxed);
        }
    }
}

/// The whole runtime: registry, run queues, stores, timer, sockets.
pub struct Runtime {
    index: Index<Service>,
    workers: Vec<Arc<WorkerQueue>>,
    monitors: Vec<Arc<Monitor>>,
    watcher: Watcher,
    total: AtomicI32,
    env: Env,
    names: Env,
    log_handle: AtomicU32,
    timer: Timer<TimerEvent>,
    sockets: Arc<SocketPool>,
    reactor: Mutex<Option<Reactor>>,
}

impl Runtime {
    pub fn new(config: Config) -> nix::Result<Arc<Runtime>> {
        let threads = config.threads.max(1);
        let (sockets, reactor) = SocketPool::pair()?;
        let env = Env::new();
        env.set_int("thread", threads as i64);
        if let Some(log) = &config.log {
            env.set_str("log", log);
        }
        env.set_str("main", &config.boot_param);
        for (k, v) in &config.values {
            env.set_str(k, v);
        }
        Ok(Arc::new(Runtime {
            index: Index::new(),
            workers: (0..threads).map(|_| WorkerQueue::new()).collect(),
            monitors: (0..threads).map(|_| Arc::new(Monitor::new())).collect(),
            watcher: Watcher {
                state: Mutex::new(WatchState {
                    sleeping: 0,
                    quit: false,
                }),
                cond: Condvar::new(),
            },
            total: AtomicI32::new(0),
            env,
            names: Env::new(),
            log_handle: AtomicU32::new(0),
            timer: Timer::new(),
            sockets,
            reactor: Mutex::new(Some(reactor)),
        }))
    }

    /// Bring up the log service and the bootstrap service, run all threads,
    /// and block until every service is gone.
    pub fn run(config: Config, boot: &dyn Module) -> nix::Result<()> {
        let rt = Runtime::new(config)?;
        let log_param = rt.env.get_str("log").unwrap_or_default();
        if let Some(h) = rt.launch(&LogModule, &log_param) {
            rt.log_handle.store(h, Ordering::Release);
        }
        let boot_param = rt.env.get_str("main").unwrap_or_default();
        rt.launch(boot, &boot_param);
        rt.start();
        Ok(())
    }

    /// Number of live services.
    pub fn alive(&self) -> usize {
        self.total.load(Ordering::Acquire).max(0) as usize
    }

    pub fn sockets(&self) -> &SocketPool {
        &self.sockets
    }

    pub fn now(&self) -> u32 {
        self.timer.now()
    }

    pub fn start_time(&self) -> u32 {
        self.timer.start_time()
    }

    pub fn env_get(&self, key: &str) -> Option<String> {
        self.env.get_str(key)
    }

    pub fn env_set(&self, key: &str, val: &str) {
        self.env.set_str(key, val)
    }

    /// Bind `name` to a handle in the name registry.
    pub fn name(&self, name: &str, handle: Handle) {
        self.names.set_int(name, handle as i64)
    }

    pub fn query(&self, name: &str) -> Handle {
        self.names.get_int(name).unwrap_or(0) as Handle
    }

    /// Create a service: register a slot, build the mailbox, run the
    /// module's `create`. On success the mailbox joins its worker's run
    /// queue; on failure the reservation is torn down and the mailbox is
    /// drained through the dead-letter path.
    pub fn launch(self: &Arc<Self>, module: &dyn Module, param: &str) -> Option<Handle> {
        let workers = &self.workers;
        let handle = self.index.register(|h| {
            let wq = workers[h as usize % workers.len()].clone();
            Arc::new(Service {
                handle: h,
                queue: Mailbox::new(h, wq),
                session: AtomicI32::new(0),
                actor: UnsafeCell::new(None),
                logfile: SpinLock::new(None),
            })
        });
        self.total.fetch_add(1, Ordering::AcqRel);
        let svc = self.index.grab(handle).expect("fresh slot disappeared");
        match module.create(self, handle, param) {
            Some(actor) => {
                // SAFETY: the mailbox is not queued yet, so no worker can
                // reach the cell; we hold the only path to it.
                unsafe { *svc.actor.get() = Some(actor) };
                self.log(handle, format!("CREATE {}", param));
                svc.queue.enqueue();
                self.wake_one();
                if self.release(handle) {
                    return None;
                }
                Some(handle)
            }
            None => {
                self.log(handle, format!("FAILED {}", param));
                self.release(handle);
                self.release(handle);
                // No worker has seen this mailbox; drain it here.
                svc.queue.finalize(|m| self.dead_letter(handle, m));
                None
            }
        }
    }

    /// Drop one reference to the service. Returns true on the call that
    /// actually reaped it, which also runs the actor's teardown and marks
    /// the mailbox for the dead-letter drain.
    pub fn release(&self, handle: Handle) -> bool {
        match self.index.release(handle) {
            Some(svc) => {
                // SAFETY: refcount hit zero: no grab exists, so nothing
                // else can reach the actor cell.
                let actor = unsafe { (*svc.actor.get()).take() };
                drop(actor);
                svc.queue.try_release();
                if let Some(mut f) = svc.logfile.lock().take() {
                    let _ = writeln!(f, "close time:{}", self.timer.now());
                }
                self.total.fetch_sub(1, Ordering::AcqRel);
                self.log(handle, "RELEASE");
                true
            }
            None => false,
        }
    }

    /// Hand a message to `handle`'s mailbox. On success returns the
    /// message's session; if the service is gone the message comes back.
    pub fn send(&self, handle: Handle, m: Message) -> Result<i32, Message> {
        let svc = match self.index.grab(handle) {
            Some(svc) => svc,
            None => return Err(m),
        };
        let session = m.session;
        if svc.queue.push(m) {
            self.wake_one();
        }
        self.release(handle);
        Ok(session)
    }

    /// Allocate the next session id for `handle`.
    pub fn session(&self, handle: Handle) -> Option<i32> {
        let svc = self.index.grab(handle)?;
        let session = svc.session.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        self.release(handle);
        Some(session)
    }

    /// Schedule a `Resp` message to `handle` after `ticks` × 10 ms. Zero
    /// ticks short-circuits: the reply is sent immediately.
    pub fn timeout(&self, handle: Handle, ticks: u32) -> Option<i32> {
        let session = self.session(handle)?;
        if ticks == 0 {
            let m = Message {
                source: handle,
                proto: Proto::Resp,
                session,
                data: Payload::Empty,
            };
            if self.send(handle, m).is_err() {
                return None;
            }
        } else {
            self.timer.timeout(ticks, TimerEvent { session, handle });
        }
        Some(session)
    }

    pub fn mailbox_len(&self, handle: Handle) -> usize {
        match self.index.grab(handle) {
            Some(svc) => {
                let len = svc.queue.len();
                self.release(handle);
                len
            }
            None => 0,
        }
    }

    /// Release every live service; the timer thread notices the count
    /// hitting zero and shuts the runtime down.
    pub fn abort(&self) {
        for handle in self.index.list(usize::MAX) {
            self.release(handle);
        }
    }

    /// Route a line to the log service; before it exists (or after it
    /// dies) the text goes to stderr instead.
    pub fn log(&self, source: Handle, text: impl Into<String>) {
        let text = text.into();
        let log = self.log_handle.load(Ordering::Acquire);
        if log == 0 {
            eprintln!("[{}] {}", source, text);
            return;
        }
        let m = Message {
            source,
            proto: Proto::Resp,
            session: 0,
            data: Payload::Bytes(text.clone().into_bytes().into_boxed_slice()),
        };
        if self.send(log, m).is_err() {
            eprintln!("[{}] {}", source, text);
        }
    }

    /// Open `<handle>.log` and mirror every dispatched message into it.
    pub fn logon(&self, handle: Handle) {
        let Some(svc) = self.index.grab(handle) else {
            return;
        };
        let path = format!("{}.log", handle);
        let mut outcome = None;
        {
            let mut slot = svc.logfile.lock();
            if slot.is_none() {
                match OpenOptions::new().append(true).create(true).open(&path) {
                    Ok(mut f) => {
                        let now = self.timer.now();
                        let wall = self.timer.start_time() as u64 + now as u64 / 100;
                        let _ = writeln!(f, "open time:{} unix:{}", now, wall);
                        *slot = Some(f);
                        outcome = Some(true);
                    }
                    Err(_) => outcome = Some(false),
                }
            }
        }
        match outcome {
            Some(true) => self.log(handle, format!("open log file {}", path)),
            Some(false) => self.log(handle, format!("open log file {} failed", path)),
            None => {}
        }
        self.release(handle);
    }

    pub fn logoff(&self, handle: Handle) {
        let Some(svc) = self.index.grab(handle) else {
            return;
        };
        if let Some(mut f) = svc.logfile.lock().take() {
            let _ = writeln!(f, "close time:{}", self.timer.now());
            self.log(handle, format!("close log file {}", handle));
        }
        self.release(handle);
    }

    /// Spawn workers, timer, socket, and monitor threads, then block until
    /// they all exit (which happens once no services remain).
    pub fn start(self: &Arc<Self>) {
        let mut handles = Vec::new();
        for i in 0..self.workers.len() {
            let rt = self.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("worker-{}", i))
                    .spawn(move || worker_loop(rt, i))
                    .expect("spawn worker thread"),
            );
        }
        let rt = self.clone();
        handles.push(
            thread::Builder::new()
                .name("timer".into())
                .spawn(move || timer_loop(rt))
                .expect("spawn timer thread"),
        );
        if let Some(reactor) = self.reactor.lock().unwrap().take() {
            let rt = self.clone();
            handles.push(
                thread::Builder::new()
                    .name("socket".into())
                    .spawn(move || socket_loop(rt, reactor))
                    .expect("spawn socket thread"),
            );
        }
        let rt = self.clone();
        handles.push(
            thread::Builder::new()
                .name("monitor".into())
                .spawn(move || monitor_loop(rt))
                .expect("spawn monitor thread"),
        );
        for h in handles {
            let _ = h.join();
        }
    }

    fn dead_letter(&self, dead: Handle, m: Message) {
        let reply = Message {
            source: dead,
            proto: Proto::Error,
            session: 0,
            data: Payload::Empty,
        };
        let _ = self.send(m.source, reply);
    }

    fn wake_one(&self) {
        let state = self.watcher.state.lock().unwrap();
        if state.sleeping > 0 {
            self.watcher.cond.notify_one();
        }
    }

    fn quit_requested(&self) -> bool {
        self.watcher.state.lock().unwrap().quit
    }

    /// Drain one message from one mailbox. Returns the mailbox to keep
    /// working on, or `None` when this worker's queue is empty.
    fn dispatch(
        self: &Arc<Self>,
        monitor: &Monitor,
        wq: &WorkerQueue,
        q: Option<Arc<Mailbox>>,
    ) -> Option<Arc<Mailbox>> {
        let q = match q {
            Some(q) => q,
            None => wq.pop()?,
        };
        let handle = q.handle();
        let svc = match self.index.grab(handle) {
            Some(svc) => svc,
            None => {
                // Service is gone; drain what remains and notify senders.
                q.finalize(|m| self.dead_letter(handle, m));
                return wq.pop();
            }
        };
        let m = match q.pop() {
            Some(m) => m,
            None => {
                self.release(handle);
                return wq.pop();
            }
        };
        let overload = q.take_overload();
        if overload > 0 {
            self.log(
                handle,
                format!("service may overload, message queue length = {}", overload),
            );
        }
        monitor.trigger(m.source, handle);
        if let Some(f) = svc.logfile.lock().as_mut() {
            log_output(f, &m, self.timer.now());
        }
        // SAFETY: the handle is pinned to this worker and we hold a grab,
        // so this is the only live path to the actor cell.
        let actor = unsafe { &mut *svc.actor.get() };
        if let Some(actor) = actor.as_mut() {
            actor.dispatch(self, handle, &m);
        }
        drop(m);
        monitor.trigger(0, 0);
        // Round-robin: if another mailbox is waiting, requeue this one and
        // take the other, so one busy service cannot starve its siblings.
        let q = match wq.pop() {
            Some(next) => {
                wq.push(q);
                next
            }
            None => q,
        };
        self.release(handle);
        Some(q)
    }
}

fn worker_loop(rt: Arc<Runtime>, worker: usize) {
    let wq = rt.workers[worker].clone();
    let monitor = rt.monitors[worker].clone();
    let mut q: Option<Arc<Mailbox>> = None;
    while !rt.quit_requested() {
        q = rt.dispatch(&monitor, &wq, q.take());
        if q.is_none() {
            let mut state = rt.watcher.state.lock().unwrap();
            if state.quit {
                break;
            }
            state.sleeping += 1;
            state = rt.watcher.cond.wait(state).unwrap();
            state.sleeping -= 1;
        }
    }
}

fn timer_loop(rt: Arc<Runtime>) {
    loop {
        rt.timer.update(&mut |evt: TimerEvent| {
            let m = Message {
                source: evt.handle,
                proto: Proto::Resp,
                session: evt.session,
                data: Payload::Empty,
            };
            let _ = rt.send(evt.handle, m);
        });
        if rt.alive() == 0 {
            break;
        }
        rt.wake_one();
        thread::sleep(Duration::from_micros(2500));
    }
    rt.sockets.exit();
    let mut state = rt.watcher.state.lock().unwrap();
    state.quit = true;
    rt.watcher.cond.notify_all();
}

fn socket_loop(rt: Arc<Runtime>, mut reactor: Reactor) {
    loop {
        let msg = reactor.poll();
        if matches!(msg.event, SocketEvent::Exit) {
            break;
        }
        let owner = msg.owner;
        let m = Message {
            source: 0,
            proto: Proto::Socket,
            session: 0,
            data: Payload::Socket(Box::new(msg)),
        };
        let _ = rt.send(owner, m);
    }
}

fn monitor_loop(rt: Arc<Runtime>) {
    loop {
        if rt.alive() == 0 {
            return;
        }
        for monitor in &rt.monitors {
            monitor.check(&rt);
        }
        for _ in 0..5 {
            if rt.alive() == 0 {
                return;
            }
            thread::sleep(Duration::from_secs(1));
        }
    }
}

fn log_output(f: &mut File, m: &Message, now: u32) {
    match &m.data {
        Payload::Socket(sm) => {
            if let SocketEvent::Data { id, data } = &sm.event {
                let _ = writeln!(f, "[socket] {} {}", id, data.len());
                let _ = f.write_all(hex_dump(data).as_bytes());
                let _ = writeln!(f);
                let _ = f.flush();
            }
        }
        _ => {
            let _ = writeln!(f, "[{}] {} {} {}", m.source, m.proto.tag(), m.session, now);
            let _ = f.write_all(hex_dump(m.data.bytes()).as_bytes());
            let _ = writeln!(f);
            let _ = f.flush();
        }
    }
}

/// Default log service: writes `[source] <text>` to a file or stderr;
/// socket payloads get a header and a hex dump.
pub struct LogModule;

enum LogOut {
    Stderr,
    File(File),
}

struct LogActor {
    out: LogOut,
}

impl LogOut {
    fn write(&mut self, emit: impl Fn(&mut dyn std::io::Write)) {
        match self {
            LogOut::Stderr => {
                let stderr = std::io::stderr();
                let mut w = stderr.lock();
                emit(&mut w);
                let _ = w.flush();
            }
            LogOut::File(f) => {
                emit(f);
                let _ = f.flush();
            }
        }
    }
}

impl Module for LogModule {
    fn create(&self, _rt: &Arc<Runtime>, _handle: Handle, param: &str) -> Option<Box<dyn Actor>> {
        let out = if param.is_empty() {
            LogOut::Stderr
        } else {
            match File::create(param) {
                Ok(f) => LogOut::File(f),
                Err(_) => return None,
            }
        };
        Some(Box::new(LogActor { out }))
    }
}

impl Actor for LogActor {
    fn dispatch(&mut self, _rt: &Arc<Runtime>, _handle: Handle, m: &Message) -> i32 {
        self.out.write(|w| match &m.data {
            Payload::Socket(sm) => {
                if let SocketEvent::Data { id, data } = &sm.event {
                    let _ = writeln!(w, "[{}] socket {} {} bytes", m.source, id, data.len());
                    let _ = w.write_all(hex_dump(data).as_bytes());
                }
            }
            data => {
                let _ = write!(w, "[{}] ", m.source);
                let _ = w.write_all(data.bytes());
                let _ = writeln!(w);
            }
        });
        0
    }
}
