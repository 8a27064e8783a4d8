//! Reactor tests over loopback: TCP echo, UDP round-trip, half-close
//! drain with backpressure warnings.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use hive::codec::split_udp_payload;
use hive::{
    Actor, Config, Handle, Message, Module, Payload, Priority, Runtime, SocketEvent,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config() -> Config {
    Config {
        threads: 2,
        ..Config::default()
    }
}

fn wait_addr(slot: &Mutex<Option<SocketAddr>>) -> SocketAddr {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(addr) = *slot.lock().unwrap() {
            return addr;
        }
        assert!(Instant::now() < deadline, "listener never came up");
        thread::sleep(Duration::from_millis(10));
    }
}

// ---------------------------------------------------------------- echo --

#[derive(Default)]
struct EchoState {
    addr: Mutex<Option<SocketAddr>>,
}

struct EchoBoot(Arc<EchoState>);
struct EchoActor;

impl Module for EchoBoot {
    fn create(&self, rt: &Arc<Runtime>, handle: Handle, _param: &str) -> Option<Box<dyn Actor>> {
        let (id, addr) = rt
            .sockets()
            .listen("127.0.0.1", 0, handle)
            .expect("bind loopback listener");
        rt.sockets().start(id, handle);
        *self.0.addr.lock().unwrap() = Some(addr);
        Some(Box::new(EchoActor))
    }
}

impl Actor for EchoActor {
    fn dispatch(&mut self, rt: &Arc<Runtime>, handle: Handle, m: &Message) -> i32 {
        if let Payload::Socket(sm) = &m.data {
            match &sm.event {
                SocketEvent::Accept { peer, .. } => rt.sockets().start(*peer, handle),
                SocketEvent::Data { id, data } => {
                    rt.sockets().send(*id, data.to_vec(), Priority::High);
                }
                SocketEvent::Close { .. } => {
                    rt.release(handle);
                    rt.abort();
                }
                _ => {}
            }
        }
        0
    }
}

#[test]
fn tcp_echo_round_trip() {
    init_logging();
    let state = Arc::new(EchoState::default());
    let boot_state = state.clone();
    let runtime = thread::spawn(move || {
        Runtime::run(config(), &EchoBoot(boot_state)).unwrap();
    });

    let addr = wait_addr(&state.addr);
    let mut stream = TcpStream::connect(addr).expect("connect to echo service");
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream.write_all(b"hello").unwrap();

    let mut echoed = [0u8; 5];
    stream.read_exact(&mut echoed).expect("echo within timeout");
    assert_eq!(&echoed, b"hello");

    drop(stream); // peer close tears the runtime down
    runtime.join().unwrap();
}

// --------------------------------------------------------- udp loopback --

struct UdpState {
    bound: Mutex<Option<SocketAddr>>,
    result: Mutex<Option<(Vec<u8>, SocketAddr)>>,
}

struct UdpBoot(Arc<UdpState>);
struct UdpActor(Arc<UdpState>);

impl Module for UdpBoot {
    fn create(&self, rt: &Arc<Runtime>, handle: Handle, _param: &str) -> Option<Box<dyn Actor>> {
        let (id, addr) = rt
            .sockets()
            .udp(Some("127.0.0.1"), 0, handle)
            .expect("bind udp socket");
        *self.0.bound.lock().unwrap() = Some(addr);
        rt.sockets()
            .set_udp_peer(id, "127.0.0.1", addr.port())
            .expect("set default peer");
        rt.sockets().send(id, b"abc".to_vec(), Priority::High);
        Some(Box::new(UdpActor(self.0.clone())))
    }
}

impl Actor for UdpActor {
    fn dispatch(&mut self, rt: &Arc<Runtime>, handle: Handle, m: &Message) -> i32 {
        if let Payload::Socket(sm) = &m.data {
            if let SocketEvent::Udp { data, payload, .. } = &sm.event {
                let (bytes, peer) =
                    split_udp_payload(data, *payload).expect("address record appended");
                *self.0.result.lock().unwrap() = Some((bytes.to_vec(), peer));
                rt.release(handle);
                rt.abort();
            }
        }
        0
    }
}

#[test]
fn udp_self_round_trip_decodes_address() {
    init_logging();
    let state = Arc::new(UdpState {
        bound: Mutex::new(None),
        result: Mutex::new(None),
    });
    let boot_state = state.clone();
    let runtime = thread::spawn(move || {
        Runtime::run(config(), &UdpBoot(boot_state)).unwrap();
    });
    runtime.join().unwrap();

    let bound = state.bound.lock().unwrap().expect("socket bound");
    let (payload, peer) = state.result.lock().unwrap().clone().expect("datagram came back");
    assert_eq!(payload, b"abc");
    assert_eq!(peer.to_string(), format!("127.0.0.1:{}", bound.port()));
}

// ------------------------------------------------------ halfclose drain --

const CHUNK: usize = 64 * 1024;
const CHUNKS: usize = 64; // 4 MiB total

struct DrainState {
    addr: Mutex<Option<SocketAddr>>,
    warnings: AtomicUsize,
}

struct DrainBoot(Arc<DrainState>);
struct DrainActor(Arc<DrainState>);

impl Module for DrainBoot {
    fn create(&self, rt: &Arc<Runtime>, handle: Handle, _param: &str) -> Option<Box<dyn Actor>> {
        let (id, addr) = rt
            .sockets()
            .listen("127.0.0.1", 0, handle)
            .expect("bind loopback listener");
        rt.sockets().start(id, handle);
        *self.0.addr.lock().unwrap() = Some(addr);
        Some(Box::new(DrainActor(self.0.clone())))
    }
}

impl Actor for DrainActor {
    fn dispatch(&mut self, rt: &Arc<Runtime>, handle: Handle, m: &Message) -> i32 {
        if let Payload::Socket(sm) = &m.data {
            match &sm.event {
                SocketEvent::Accept { peer, .. } => rt.sockets().start(*peer, handle),
                SocketEvent::Open { id, endpoint } if endpoint == "start" => {
                    // Queue 4 MiB on the low-priority lane, then close: the
                    // socket must linger in half-close until it all drains.
                    for i in 0..CHUNKS {
                        rt.sockets().send(*id, vec![i as u8; CHUNK], Priority::Low);
                    }
                    rt.sockets().close(*id, handle);
                }
                SocketEvent::Warning { .. } => {
                    self.0.warnings.fetch_add(1, Ordering::Relaxed);
                }
                SocketEvent::Close { .. } => {
                    rt.release(handle);
                    rt.abort();
                }
                _ => {}
            }
        }
        0
    }
}

#[test]
fn halfclose_drains_all_bytes_before_closing() {
    init_logging();
    let state = Arc::new(DrainState {
        addr: Mutex::new(None),
        warnings: AtomicUsize::new(0),
    });
    let boot_state = state.clone();
    let runtime = thread::spawn(move || {
        Runtime::run(config(), &DrainBoot(boot_state)).unwrap();
    });

    let addr = wait_addr(&state.addr);
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    // Stall long enough for the write queue to pile past the warning mark.
    thread::sleep(Duration::from_millis(500));

    let mut total = 0usize;
    let mut buf = vec![0u8; CHUNK];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                // Low-priority chunks must still come out in order.
                for (i, b) in buf[..n].iter().enumerate() {
                    let expect = ((total + i) / CHUNK) as u8;
                    assert_eq!(*b, expect, "byte {} out of order", total + i);
                }
                total += n;
            }
            Err(e) => panic!("read failed after {} bytes: {}", total, e),
        }
    }
    assert_eq!(total, CHUNK * CHUNKS, "every queued byte arrived");
    // The backlog crosses the megabyte mark once and drains once.
    assert_eq!(
        state.warnings.load(Ordering::Relaxed),
        1,
        "exactly one warning per crossing"
    );
    runtime.join().unwrap();
}
