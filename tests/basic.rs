//! Runtime-level tests: lifecycle, ordering, timers, overload, shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hive::{Actor, Config, Handle, Message, Module, Payload, Proto, Runtime};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(threads: usize) -> Config {
    Config {
        threads,
        ..Config::default()
    }
}

struct Quiet;

impl Actor for Quiet {
    fn dispatch(&mut self, _: &Arc<Runtime>, _: Handle, _: &Message) -> i32 {
        0
    }
}

// ---------------------------------------------------------------- fifo --

#[derive(Default)]
struct FifoState {
    received: Mutex<Vec<i32>>,
}

struct Consumer(Arc<FifoState>);

impl Actor for Consumer {
    fn dispatch(&mut self, rt: &Arc<Runtime>, handle: Handle, m: &Message) -> i32 {
        let mut seen = self.0.received.lock().unwrap();
        seen.push(m.session);
        if seen.len() == 100 {
            drop(seen);
            rt.release(handle);
            rt.abort();
        }
        0
    }
}

struct ConsumerModule(Arc<FifoState>);

impl Module for ConsumerModule {
    fn create(&self, _rt: &Arc<Runtime>, _handle: Handle, _param: &str) -> Option<Box<dyn Actor>> {
        Some(Box::new(Consumer(self.0.clone())))
    }
}

struct FifoBoot(Arc<FifoState>);

impl Module for FifoBoot {
    fn create(&self, rt: &Arc<Runtime>, handle: Handle, _param: &str) -> Option<Box<dyn Actor>> {
        let consumer = rt
            .launch(&ConsumerModule(self.0.clone()), "")
            .expect("launch consumer");
        for session in 1..=100 {
            let m = Message {
                source: handle,
                proto: Proto::Resp,
                session,
                data: Payload::Bytes(session.to_le_bytes().to_vec().into_boxed_slice()),
            };
            rt.send(consumer, m).expect("consumer alive");
        }
        rt.release(handle);
        Some(Box::new(Quiet))
    }
}

#[test]
fn messages_arrive_in_send_order() {
    init_logging();
    let state = Arc::new(FifoState::default());
    Runtime::run(config(2), &FifoBoot(state.clone())).unwrap();
    let seen = state.received.lock().unwrap();
    assert_eq!(seen.len(), 100);
    assert_eq!(*seen, (1..=100).collect::<Vec<i32>>());
}

// -------------------------------------------------------- timer fan-out --

struct TimerState {
    started: Mutex<Option<Instant>>,
    expected: Mutex<Vec<i32>>,
    fired: Mutex<Vec<(i32, Duration)>>,
}

struct TimerBoot(Arc<TimerState>);
struct TimerActor(Arc<TimerState>);

impl Module for TimerBoot {
    fn create(&self, rt: &Arc<Runtime>, handle: Handle, _param: &str) -> Option<Box<dyn Actor>> {
        *self.0.started.lock().unwrap() = Some(Instant::now());
        let mut expected = self.0.expected.lock().unwrap();
        for _ in 0..1000 {
            expected.push(rt.timeout(handle, 10).expect("schedule timeout"));
        }
        Some(Box::new(TimerActor(self.0.clone())))
    }
}

impl Actor for TimerActor {
    fn dispatch(&mut self, rt: &Arc<Runtime>, handle: Handle, m: &Message) -> i32 {
        assert_eq!(m.proto, Proto::Resp);
        assert_eq!(m.source, handle);
        let started = self.0.started.lock().unwrap().unwrap();
        let mut fired = self.0.fired.lock().unwrap();
        fired.push((m.session, started.elapsed()));
        if fired.len() == 1000 {
            drop(fired);
            rt.release(handle);
            rt.abort();
        }
        0
    }
}

#[test]
fn timer_fanout_sessions_and_delays() {
    init_logging();
    let state = Arc::new(TimerState {
        started: Mutex::new(None),
        expected: Mutex::new(Vec::new()),
        fired: Mutex::new(Vec::new()),
    });
    Runtime::run(config(2), &TimerBoot(state.clone())).unwrap();

    let expected = state.expected.lock().unwrap();
    let fired = state.fired.lock().unwrap();
    assert_eq!(fired.len(), 1000);

    let mut got: Vec<i32> = fired.iter().map(|(s, _)| *s).collect();
    let mut want = expected.clone();
    got.sort_unstable();
    want.sort_unstable();
    assert_eq!(got, want, "every returned session fires exactly once");

    // 10 ticks = 100 ms; the wheel never fires a full tick early, and the
    // 2.5 ms driving cadence keeps the tail short.
    let min = fired.iter().map(|(_, d)| *d).min().unwrap();
    let sum: Duration = fired.iter().map(|(_, d)| *d).sum();
    let mean = sum / 1000;
    assert!(min >= Duration::from_millis(90), "min delay {:?}", min);
    assert!(mean <= Duration::from_millis(250), "mean delay {:?}", mean);
}

// ------------------------------------------------------------ overload --

struct OverloadState {
    consumed: AtomicUsize,
}

struct Sink(Arc<OverloadState>);

impl Actor for Sink {
    fn dispatch(&mut self, rt: &Arc<Runtime>, handle: Handle, _m: &Message) -> i32 {
        if self.0.consumed.fetch_add(1, Ordering::Relaxed) + 1 == 10_000 {
            rt.release(handle);
            rt.abort();
        }
        0
    }
}

struct SinkModule(Arc<OverloadState>);

impl Module for SinkModule {
    fn create(&self, _rt: &Arc<Runtime>, _handle: Handle, _param: &str) -> Option<Box<dyn Actor>> {
        Some(Box::new(Sink(self.0.clone())))
    }
}

struct OverloadBoot(Arc<OverloadState>);

impl Module for OverloadBoot {
    fn create(&self, rt: &Arc<Runtime>, handle: Handle, _param: &str) -> Option<Box<dyn Actor>> {
        let sink = rt
            .launch(&SinkModule(self.0.clone()), "")
            .expect("launch sink");
        // All 10k land before the workers start draining.
        for _ in 0..10_000 {
            let m = Message {
                source: handle,
                proto: Proto::Resp,
                session: 0,
                data: Payload::Empty,
            };
            rt.send(sink, m).expect("sink alive");
        }
        rt.release(handle);
        Some(Box::new(Quiet))
    }
}

#[test]
fn overloaded_mailbox_is_reported_and_drained() {
    init_logging();
    let log_path = std::env::temp_dir().join(format!("hive-overload-{}.log", std::process::id()));
    let state = Arc::new(OverloadState {
        consumed: AtomicUsize::new(0),
    });
    let cfg = Config {
        threads: 2,
        log: Some(log_path.to_string_lossy().into_owned()),
        ..Config::default()
    };
    Runtime::run(cfg, &OverloadBoot(state.clone())).unwrap();
    assert_eq!(state.consumed.load(Ordering::Relaxed), 10_000);

    let log = std::fs::read_to_string(&log_path).unwrap_or_default();
    let _ = std::fs::remove_file(&log_path);
    let line = log
        .lines()
        .find(|l| l.contains("service may overload, message queue length = "))
        .expect("an overload warning was logged");
    let n: usize = line
        .rsplit(' ')
        .next()
        .and_then(|s| s.parse().ok())
        .expect("warning carries the queue length");
    assert!(n >= 1024, "reported length {} below threshold", n);
}

// ------------------------------------------------------------ shutdown --

struct IdleActor(Arc<AtomicUsize>);

impl Actor for IdleActor {
    fn dispatch(&mut self, _: &Arc<Runtime>, _: Handle, _: &Message) -> i32 {
        0
    }
}

impl Drop for IdleActor {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct IdleModule(Arc<AtomicUsize>);

impl Module for IdleModule {
    fn create(&self, _rt: &Arc<Runtime>, _handle: Handle, _param: &str) -> Option<Box<dyn Actor>> {
        Some(Box::new(IdleActor(self.0.clone())))
    }
}

struct ShutdownBoot(Arc<AtomicUsize>);

impl Module for ShutdownBoot {
    fn create(&self, rt: &Arc<Runtime>, _handle: Handle, _param: &str) -> Option<Box<dyn Actor>> {
        let idle = IdleModule(self.0.clone());
        for _ in 0..4 {
            rt.launch(&idle, "").expect("launch idle service");
        }
        rt.abort();
        Some(Box::new(Quiet))
    }
}

#[test]
fn abort_releases_every_service_once() {
    init_logging();
    let releases = Arc::new(AtomicUsize::new(0));
    let begin = Instant::now();
    Runtime::run(config(2), &ShutdownBoot(releases.clone())).unwrap();
    assert_eq!(releases.load(Ordering::SeqCst), 4, "each release ran exactly once");
    assert!(begin.elapsed() < Duration::from_secs(6));
}

// --------------------------------------------------------- dead letter --

struct NeverModule;

impl Module for NeverModule {
    fn create(&self, _rt: &Arc<Runtime>, _handle: Handle, _param: &str) -> Option<Box<dyn Actor>> {
        struct Never;
        impl Actor for Never {
            fn dispatch(&mut self, _: &Arc<Runtime>, _: Handle, _: &Message) -> i32 {
                panic!("the victim never dispatches");
            }
        }
        Some(Box::new(Never))
    }
}

struct DeadLetterState {
    notified: Mutex<Option<(Handle, i32, Proto)>>,
}

struct DeadLetterBoot(Arc<DeadLetterState>);
struct DeadLetterActor(Arc<DeadLetterState>);

impl Module for DeadLetterBoot {
    fn create(&self, rt: &Arc<Runtime>, handle: Handle, _param: &str) -> Option<Box<dyn Actor>> {
        let victim = rt.launch(&NeverModule, "").expect("launch victim");
        let m = Message {
            source: handle,
            proto: Proto::Resp,
            session: 42,
            data: Payload::Bytes(vec![1, 2, 3].into_boxed_slice()),
        };
        rt.send(victim, m).expect("victim alive");
        // Kill it with the message still queued: the drain must notify us.
        rt.release(victim);
        Some(Box::new(DeadLetterActor(self.0.clone())))
    }
}

impl Actor for DeadLetterActor {
    fn dispatch(&mut self, rt: &Arc<Runtime>, handle: Handle, m: &Message) -> i32 {
        *self.0.notified.lock().unwrap() = Some((m.source, m.session, m.proto));
        assert!(m.data.is_empty());
        rt.release(handle);
        rt.abort();
        0
    }
}

#[test]
fn dead_service_mail_bounces_to_sender() {
    init_logging();
    let state = Arc::new(DeadLetterState {
        notified: Mutex::new(None),
    });
    Runtime::run(config(2), &DeadLetterBoot(state.clone())).unwrap();
    let (source, session, proto) = state.notified.lock().unwrap().expect("dead letter arrived");
    assert_ne!(source, 0, "sourced from the dead service");
    assert_eq!(session, 0, "dead-letter replies carry no session");
    assert_eq!(proto, Proto::Error);
}

// -------------------------------------------------- names & environment --

#[test]
fn name_registry_and_env_store() {
    init_logging();
    let rt = Runtime::new(Config {
        threads: 1,
        boot_param: "bootsrv".into(),
        values: vec![("cluster".into(), "alpha".into())],
        ..Config::default()
    })
    .unwrap();
    assert_eq!(rt.env_get("main").as_deref(), Some("bootsrv"));
    assert_eq!(rt.env_get("cluster").as_deref(), Some("alpha"));
    rt.env_set("cluster", "beta");
    assert_eq!(rt.env_get("cluster").as_deref(), Some("beta"));

    rt.name("launcher", 17);
    assert_eq!(rt.query("launcher"), 17);
    assert_eq!(rt.query("unknown"), 0);
}

#[test]
fn sessions_and_mailbox_introspection() {
    init_logging();
    let rt = Runtime::new(config(1)).unwrap();
    let releases = Arc::new(AtomicUsize::new(0));
    let h = rt.launch(&IdleModule(releases), "").expect("launch");

    assert_eq!(rt.session(h), Some(1));
    assert_eq!(rt.session(h), Some(2));
    assert_eq!(rt.session(h), Some(3), "sessions count up per service");

    assert_eq!(rt.mailbox_len(h), 0);
    for session in 1..=3 {
        let m = Message {
            source: 0,
            proto: Proto::Resp,
            session,
            data: Payload::Empty,
        };
        rt.send(h, m).unwrap();
    }
    assert_eq!(rt.mailbox_len(h), 3);
    assert_eq!(rt.mailbox_len(9999), 0, "dead handles read as empty");

    // Per-service log file opens, mirrors, and closes.
    rt.logon(h);
    rt.logoff(h);
    let path = format!("{}.log", h);
    let contents = std::fs::read_to_string(&path).expect("log file exists");
    let _ = std::fs::remove_file(&path);
    assert!(contents.contains("open time:"));
    assert!(contents.contains("close time:"));

    rt.release(h);
}
