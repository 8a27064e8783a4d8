//! Socket reactor: one thread owns every socket.
//!
//! All socket state lives in a fixed table of `1 << 16` slots. The reactor
//! thread is the only mutator; other threads interact through [`SocketPool`],
//! which reserves ids with an atomic handshake, queues a request on a
//! channel, and pokes an eventfd registered with the poller so a blocked
//! `wait` call wakes up and drains the requests. (The eventfd-counter wake
//! is the same trick the worker pool uses: write an 8-byte count, the
//! sleeping side reads it back.)
//!
//! A slot walks the state machine
//! `INVALID → RESERVE → {OPENING → OPENED, PLISTEN → LISTEN, PACCEPT →
//! OPENED, BIND}`, and `OPENED → HALFCLOSE → INVALID` when a close is
//! requested with writes still pending. Each call to [`Reactor::poll`]
//! returns one externally visible transition.

use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU8, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, NativeEndian};
use log::{error, warn};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::eventfd::{eventfd, EfdFlags};
use nix::sys::socket::{
    accept, bind, connect, getpeername, getsockname, getsockopt, listen, recvfrom, sendto,
    setsockopt, socket, sockopt, AddressFamily, MsgFlags, SockFlag, SockProtocol, SockType,
    SockaddrIn, SockaddrIn6, SockaddrStorage,
};
use nix::unistd::{close, read, write};

use crate::codec::{decode_udp_address, encode_udp_address, UDP_ADDRESS_SIZE};
use crate::event::{Event, Poller, MAX_EVENT};

const MAX_SOCKET_P: usize = 16;
pub const MAX_SOCKET: usize = 1 << MAX_SOCKET_P;
const MIN_READ_BUFFER: usize = 64;
const MAX_UDP_PACKAGE: usize = 65535;
const LISTEN_BACKLOG: usize = 512;
const WB_WARNING: i64 = 1024 * 1024;
const WAKE_TOKEN: u64 = u64::MAX;

type UdpRecord = [u8; UDP_ADDRESS_SIZE];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Kind {
    Invalid = 0,
    Reserve = 1,
    Opening = 2,
    Opened = 3,
    Listen = 4,
    PListen = 5,
    PAccept = 6,
    Bound = 7,
    HalfClose = 8,
}

fn kind_from(v: u8) -> Kind {
    match v {
        1 => Kind::Reserve,
        2 => Kind::Opening,
        3 => Kind::Opened,
        4 => Kind::Listen,
        5 => Kind::PListen,
        6 => Kind::PAccept,
        7 => Kind::Bound,
        8 => Kind::HalfClose,
        _ => Kind::Invalid,
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Priority {
    High,
    Low,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Protocol {
    Tcp,
    Udp,
    Udp6,
}

/// One externally visible reactor transition.
#[derive(Debug)]
pub enum SocketEvent {
    Open { id: i32, endpoint: String },
    Accept { id: i32, peer: i32, endpoint: String },
    Data { id: i32, data: Box<[u8]> },
    /// `data` holds the datagram payload (`payload` bytes) with the peer
    /// address record appended after it; split with
    /// [`crate::codec::split_udp_payload`].
    Udp { id: i32, data: Box<[u8]>, payload: usize },
    Close { id: i32 },
    Error { id: i32, reason: String },
    /// Write-back crossed a megabyte; `pending_kb` is the backlog in KiB.
    Warning { id: i32, pending_kb: i32 },
    Exit,
}

#[derive(Debug)]
pub struct SocketMessage {
    /// Service handle registered as the socket's owner.
    pub owner: u32,
    pub event: SocketEvent,
}

#[derive(Debug)]
pub enum SocketError {
    AddressNotFound,
    SocketLimit,
    Os(Errno),
}

enum Request {
    Open { id: i32, owner: u32, host: String, port: u16 },
    Listen { id: i32, owner: u32, fd: RawFd },
    Bind { id: i32, owner: u32, fd: RawFd },
    Start { id: i32, owner: u32 },
    Close { id: i32, owner: u32 },
    Send { id: i32, data: Vec<u8>, priority: Priority },
    SendUdp { id: i32, data: Vec<u8>, addr: UdpRecord },
    Opt { id: i32, nodelay: bool },
    Udp { id: i32, owner: u32, fd: RawFd, protocol: Protocol },
    SetUdp { id: i32, addr: UdpRecord },
    Exit,
}

/// Shared half of a socket slot. API threads read these non-authoritative
/// snapshots; only the reactor writes them (except for the reservation CAS).
struct SlotMeta {
    id: AtomicI32,
    kind: AtomicU8,
    wb: AtomicI64,
}

/// Cross-thread socket API. Cheap to share; every operation marshals a
/// request to the reactor thread and returns immediately.
pub struct SocketPool {
    next_id: AtomicI32,
    meta: Vec<SlotMeta>,
    ctl: Mutex<Sender<Request>>,
    wake_fd: RawFd,
}

impl SocketPool {
    /// Create the pool together with its reactor. The reactor must be moved
    /// to a dedicated thread and driven with [`Reactor::poll`].
    pub fn pair() -> nix::Result<(Arc<SocketPool>, Reactor)> {
        let poller = Poller::new()?;
        let wake_fd = eventfd(0, EfdFlags::empty())?;
        poller.add(wake_fd, WAKE_TOKEN)?;
        let (tx, rx) = channel();
        let mut meta = Vec::with_capacity(MAX_SOCKET);
        for _ in 0..MAX_SOCKET {
            meta.push(SlotMeta {
                id: AtomicI32::new(0),
                kind: AtomicU8::new(Kind::Invalid as u8),
                wb: AtomicI64::new(0),
            });
        }
        let pool = Arc::new(SocketPool {
            next_id: AtomicI32::new(0),
            meta,
            ctl: Mutex::new(tx),
            wake_fd,
        });
        let mut slots = Vec::with_capacity(MAX_SOCKET);
        slots.resize_with(MAX_SOCKET, Slot::vacant);
        let reactor = Reactor {
            pool: pool.clone(),
            poller,
            rx,
            wake_fd,
            slots,
            events: [Event { token: 0, read: false, write: false }; MAX_EVENT],
            ev_n: 0,
            ev_idx: 0,
            check_ctrl: true,
            udp_scratch: vec![0u8; MAX_UDP_PACKAGE].into_boxed_slice(),
        };
        Ok((pool, reactor))
    }

    /// Reserve a slot id: bump the counter (masked non-negative) until a
    /// free slot takes the `INVALID → RESERVE` CAS.
    fn reserve(&self) -> Option<i32> {
        for _ in 0..MAX_SOCKET {
            let mut id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id < 0 {
                id = self.next_id.fetch_and(0x7fff_ffff, Ordering::Relaxed) & 0x7fff_ffff;
            }
            let meta = &self.meta[id as usize & (MAX_SOCKET - 1)];
            if meta.kind.load(Ordering::Acquire) == Kind::Invalid as u8
                && meta
                    .kind
                    .compare_exchange(
                        Kind::Invalid as u8,
                        Kind::Reserve as u8,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                meta.id.store(id, Ordering::Release);
                meta.wb.store(0, Ordering::Relaxed);
                return Some(id);
            }
        }
        None
    }

    fn post(&self, req: Request) {
        if self.ctl.lock().unwrap().send(req).is_ok() {
            let mut buf = [0u8; 8];
            NativeEndian::write_i64(&mut buf, 1);
            let _ = write(self.wake_fd, &buf);
        }
    }

    fn meta_of(&self, id: i32) -> &SlotMeta {
        &self.meta[id as usize & (MAX_SOCKET - 1)]
    }

    fn live(&self, id: i32) -> bool {
        let meta = self.meta_of(id);
        meta.id.load(Ordering::Acquire) == id
            && meta.kind.load(Ordering::Acquire) != Kind::Invalid as u8
    }

    /// Bind and listen on the caller's thread, then hand the fd to the
    /// reactor. The new slot waits in `PLISTEN` until started. Returns the
    /// id and the bound address (so an ephemeral port can be discovered).
    pub fn listen(&self, host: &str, port: u16, owner: u32) -> Result<(i32, SocketAddr), SocketError> {
        let (fd, _) = bind_socket(host, port, false)?;
        if let Err(e) = listen(fd, LISTEN_BACKLOG) {
            let _ = close(fd);
            return Err(SocketError::Os(e));
        }
        let addr = match local_addr(fd) {
            Some(addr) => addr,
            None => {
                let _ = close(fd);
                return Err(SocketError::AddressNotFound);
            }
        };
        let id = match self.reserve() {
            Some(id) => id,
            None => {
                let _ = close(fd);
                return Err(SocketError::SocketLimit);
            }
        };
        self.post(Request::Listen { id, owner, fd });
        Ok((id, addr))
    }

    /// Begin a non-blocking TCP connect; resolution and connect run on the
    /// reactor thread, which reports `Open` or `Error` for the returned id.
    pub fn open(&self, host: &str, port: u16, owner: u32) -> Result<i32, SocketError> {
        let id = self.reserve().ok_or(SocketError::SocketLimit)?;
        self.post(Request::Open {
            id,
            owner,
            host: host.to_string(),
            port,
        });
        Ok(id)
    }

    /// Adopt an existing descriptor (e.g. stdin) as a `BIND` slot.
    pub fn bind_fd(&self, fd: RawFd, owner: u32) -> Result<i32, SocketError> {
        let id = self.reserve().ok_or(SocketError::SocketLimit)?;
        self.post(Request::Bind { id, owner, fd });
        Ok(id)
    }

    /// Start a `PACCEPT`/`PLISTEN` slot (or re-own an `OPENED` one).
    pub fn start(&self, id: i32, owner: u32) {
        self.post(Request::Start { id, owner });
    }

    pub fn close(&self, id: i32, owner: u32) {
        self.post(Request::Close { id, owner });
    }

    pub fn nodelay(&self, id: i32) {
        self.post(Request::Opt { id, nodelay: true });
    }

    /// Queue `data` on the socket. Returns a snapshot of the pending
    /// write-back size, or -1 if the id is dead (the data is dropped).
    pub fn send(&self, id: i32, data: Vec<u8>, priority: Priority) -> i64 {
        if !self.live(id) {
            return -1;
        }
        self.post(Request::Send { id, data, priority });
        self.meta_of(id).wb.load(Ordering::Relaxed)
    }

    /// Open a UDP socket, optionally bound to `host:port`. Returns the id
    /// and the bound address.
    pub fn udp(
        &self,
        host: Option<&str>,
        port: u16,
        owner: u32,
    ) -> Result<(i32, SocketAddr), SocketError> {
        let (fd, family) = if host.is_some() || port != 0 {
            bind_socket(host.unwrap_or(""), port, true)?
        } else {
            let fd = socket(
                AddressFamily::Inet,
                SockType::Datagram,
                SockFlag::empty(),
                SockProtocol::Udp,
            )
            .map_err(SocketError::Os)?;
            (fd, AddressFamily::Inet)
        };
        set_nonblocking(fd);
        let addr = match local_addr(fd) {
            Some(addr) => addr,
            None => {
                let _ = close(fd);
                return Err(SocketError::AddressNotFound);
            }
        };
        let id = match self.reserve() {
            Some(id) => id,
            None => {
                let _ = close(fd);
                return Err(SocketError::SocketLimit);
            }
        };
        let protocol = if family == AddressFamily::Inet6 {
            Protocol::Udp6
        } else {
            Protocol::Udp
        };
        self.post(Request::Udp { id, owner, fd, protocol });
        Ok((id, addr))
    }

    /// Set the default peer for [`SocketPool::send`] on a UDP slot.
    pub fn set_udp_peer(&self, id: i32, host: &str, port: u16) -> Result<(), SocketError> {
        let addr = resolve(host, port).ok_or(SocketError::AddressNotFound)?;
        let mut rec = [0u8; UDP_ADDRESS_SIZE];
        encode_udp_address(&addr, &mut rec);
        self.post(Request::SetUdp { id, addr: rec });
        Ok(())
    }

    /// Send one datagram to an explicit peer.
    pub fn udp_send(&self, id: i32, to: &SocketAddr, data: Vec<u8>) -> i64 {
        if !self.live(id) {
            return -1;
        }
        let mut rec = [0u8; UDP_ADDRESS_SIZE];
        encode_udp_address(to, &mut rec);
        self.post(Request::SendUdp { id, data, addr: rec });
        self.meta_of(id).wb.load(Ordering::Relaxed)
    }

    /// Ask the reactor to report `Exit` and stop.
    pub fn exit(&self) {
        self.post(Request::Exit);
    }
}

impl Drop for SocketPool {
    fn drop(&mut self) {
        let _ = close(self.wake_fd);
    }
}

struct WriteBuf {
    data: Vec<u8>,
    pos: usize,
    /// `Some` marks a datagram with its destination record; `None` is
    /// stream data.
    udp: Option<UdpRecord>,
}

impl WriteBuf {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

struct Slot {
    fd: RawFd,
    owner: u32,
    protocol: Protocol,
    read_hint: usize,
    peer: UdpRecord,
    high: VecDeque<WriteBuf>,
    low: VecDeque<WriteBuf>,
    /// Set when the write-back crosses the warning mark; re-armed once it
    /// drains back under, so each crossing warns exactly once.
    warned: bool,
}

impl Slot {
    fn vacant() -> Slot {
        Slot {
            fd: -1,
            owner: 0,
            protocol: Protocol::Tcp,
            read_hint: MIN_READ_BUFFER,
            peer: [0u8; UDP_ADDRESS_SIZE],
            high: VecDeque::new(),
            low: VecDeque::new(),
            warned: false,
        }
    }
}

enum Forward {
    Skip,
    Deliver(SocketMessage),
    Closed(SocketMessage),
}

enum Drain {
    Done,
    Blocked,
    Failed(Errno),
}

pub struct Reactor {
    pool: Arc<SocketPool>,
    poller: Poller,
    rx: Receiver<Request>,
    wake_fd: RawFd,
    slots: Vec<Slot>,
    events: [Event; MAX_EVENT],
    ev_n: usize,
    ev_idx: usize,
    check_ctrl: bool,
    udp_scratch: Box<[u8]>,
}

impl Reactor {
    /// Block until the next externally visible transition.
    pub fn poll(&mut self) -> SocketMessage {
        loop {
            if self.check_ctrl {
                match self.rx.try_recv() {
                    Ok(req) => {
                        if let Some(msg) = self.handle_req(req) {
                            return msg;
                        }
                        continue;
                    }
                    Err(TryRecvError::Empty) => self.check_ctrl = false,
                    Err(TryRecvError::Disconnected) => {
                        return SocketMessage { owner: 0, event: SocketEvent::Exit };
                    }
                }
            }
            if self.ev_idx == self.ev_n {
                match self.poller.wait(&mut self.events) {
                    Ok(n) => {
                        self.ev_n = n;
                        self.ev_idx = 0;
                        self.check_ctrl = true;
                        continue;
                    }
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        error!("reactor: event wait failed: {}", e);
                        return SocketMessage { owner: 0, event: SocketEvent::Exit };
                    }
                }
            }
            let ev = self.events[self.ev_idx];
            self.ev_idx += 1;
            if ev.token == WAKE_TOKEN {
                let mut buf = [0u8; 8];
                let _ = read(self.wake_fd, &mut buf);
                self.check_ctrl = true;
                continue;
            }
            let id = ev.token as i32;
            let at = slot_at(id);
            let meta = &self.pool.meta[at];
            if meta.id.load(Ordering::Acquire) != id {
                continue;
            }
            match kind_from(meta.kind.load(Ordering::Acquire)) {
                Kind::Invalid | Kind::Reserve => continue,
                Kind::Opening => {
                    if let Some(msg) = self.try_open(id) {
                        return msg;
                    }
                }
                Kind::Listen => {
                    if ev.read {
                        if let Some(msg) = self.try_accept(id) {
                            return msg;
                        }
                    }
                }
                _ => {
                    if ev.read {
                        let fwd = if self.slots[at].protocol == Protocol::Tcp {
                            self.forward_tcp(id)
                        } else {
                            self.forward_udp(id)
                        };
                        match fwd {
                            Forward::Deliver(msg) => {
                                if matches!(msg.event, SocketEvent::Udp { .. }) {
                                    // A readable UDP slot may hold more
                                    // datagrams; revisit the same event.
                                    self.ev_idx -= 1;
                                } else if ev.write {
                                    self.events[self.ev_idx - 1].read = false;
                                    self.ev_idx -= 1;
                                }
                                return msg;
                            }
                            Forward::Closed(msg) => return msg,
                            Forward::Skip => {
                                if ev.write {
                                    self.events[self.ev_idx - 1].read = false;
                                    self.ev_idx -= 1;
                                }
                                continue;
                            }
                        }
                    }
                    if ev.write {
                        if let Some(msg) = self.send_buffer(id) {
                            return msg;
                        }
                    }
                }
            }
        }
    }

    fn meta(&self, id: i32) -> &SlotMeta {
        &self.pool.meta[slot_at(id)]
    }

    fn kind(&self, id: i32) -> Kind {
        kind_from(self.meta(id).kind.load(Ordering::Acquire))
    }

    fn set_kind(&self, id: i32, kind: Kind) {
        self.meta(id).kind.store(kind as u8, Ordering::Release);
    }

    fn slot_live(&self, id: i32) -> bool {
        let meta = self.meta(id);
        meta.id.load(Ordering::Acquire) == id
            && meta.kind.load(Ordering::Acquire) != Kind::Invalid as u8
    }

    /// Move a reserved slot into service. With `register`, the fd is added
    /// to the poller immediately; listeners and pending accepts wait for an
    /// explicit start.
    fn slot_new(&mut self, id: i32, fd: RawFd, protocol: Protocol, owner: u32, register: bool) -> bool {
        let at = slot_at(id);
        debug_assert_eq!(self.kind(id), Kind::Reserve);
        if register {
            if let Err(e) = self.poller.add(fd, id as u32 as u64) {
                error!("reactor: poller add for socket {} failed: {}", id, e);
                self.set_kind(id, Kind::Invalid);
                return false;
            }
        }
        let slot = &mut self.slots[at];
        slot.fd = fd;
        slot.owner = owner;
        slot.protocol = protocol;
        slot.read_hint = MIN_READ_BUFFER;
        slot.peer = [0u8; UDP_ADDRESS_SIZE];
        slot.high.clear();
        slot.low.clear();
        slot.warned = false;
        self.meta(id).wb.store(0, Ordering::Relaxed);
        true
    }

    fn force_close(&mut self, id: i32) {
        let kind = self.kind(id);
        if kind == Kind::Invalid {
            return;
        }
        debug_assert_ne!(kind, Kind::Reserve);
        let at = slot_at(id);
        self.slots[at].high.clear();
        self.slots[at].low.clear();
        self.slots[at].warned = false;
        self.meta(id).wb.store(0, Ordering::Relaxed);
        let fd = self.slots[at].fd;
        if kind != Kind::PAccept && kind != Kind::PListen {
            self.poller.del(fd);
        }
        if kind != Kind::Bound {
            let _ = close(fd);
        }
        self.set_kind(id, Kind::Invalid);
    }

    fn handle_req(&mut self, req: Request) -> Option<SocketMessage> {
        match req {
            Request::Exit => Some(SocketMessage { owner: 0, event: SocketEvent::Exit }),
            Request::Listen { id, owner, fd } => self.req_listen(id, owner, fd),
            Request::Open { id, owner, host, port } => self.req_open(id, owner, &host, port),
            Request::Bind { id, owner, fd } => self.req_bind(id, owner, fd),
            Request::Start { id, owner } => self.req_start(id, owner),
            Request::Close { id, owner } => self.req_close(id, owner),
            Request::Send { id, data, priority } => self.req_send(id, data, priority, None),
            Request::SendUdp { id, data, addr } => {
                self.req_send(id, data, Priority::High, Some(addr))
            }
            Request::Opt { id, nodelay } => {
                if self.slot_live(id) {
                    let _ = setsockopt(self.slots[slot_at(id)].fd, sockopt::TcpNoDelay, &nodelay);
                }
                None
            }
            Request::SetUdp { id, addr } => self.req_setudp(id, addr),
            Request::Udp { id, owner, fd, protocol } => {
                if !self.slot_new(id, fd, protocol, owner, true) {
                    let _ = close(fd);
                    return None;
                }
                self.set_kind(id, Kind::Opened);
                None
            }
        }
    }

    fn req_listen(&mut self, id: i32, owner: u32, fd: RawFd) -> Option<SocketMessage> {
        if !self.slot_new(id, fd, Protocol::Tcp, owner, false) {
            let _ = close(fd);
            return Some(SocketMessage {
                owner,
                event: SocketEvent::Error { id, reason: "socket limit".to_string() },
            });
        }
        self.set_kind(id, Kind::PListen);
        None
    }

    fn req_open(&mut self, id: i32, owner: u32, host: &str, port: u16) -> Option<SocketMessage> {
        let addrs: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
            Ok(it) => it.collect(),
            Err(_) => Vec::new(),
        };
        if addrs.is_empty() {
            self.set_kind(id, Kind::Invalid);
            return Some(SocketMessage {
                owner,
                event: SocketEvent::Error { id, reason: "address not found".to_string() },
            });
        }
        let mut last_err = Errno::ECONNREFUSED;
        let mut chosen = None;
        for addr in addrs {
            let family = match addr {
                SocketAddr::V4(_) => AddressFamily::Inet,
                SocketAddr::V6(_) => AddressFamily::Inet6,
            };
            let fd = match socket(family, SockType::Stream, SockFlag::empty(), SockProtocol::Tcp) {
                Ok(fd) => fd,
                Err(e) => {
                    last_err = e;
                    continue;
                }
            };
            let _ = setsockopt(fd, sockopt::KeepAlive, &true);
            set_nonblocking(fd);
            match sock_connect(fd, &addr) {
                Ok(()) => {
                    chosen = Some((fd, addr, true));
                    break;
                }
                Err(Errno::EINPROGRESS) => {
                    chosen = Some((fd, addr, false));
                    break;
                }
                Err(e) => {
                    last_err = e;
                    let _ = close(fd);
                }
            }
        }
        let (fd, addr, connected) = match chosen {
            Some(c) => c,
            None => {
                self.set_kind(id, Kind::Invalid);
                return Some(SocketMessage {
                    owner,
                    event: SocketEvent::Error { id, reason: last_err.desc().to_string() },
                });
            }
        };
        if !self.slot_new(id, fd, Protocol::Tcp, owner, true) {
            let _ = close(fd);
            return Some(SocketMessage {
                owner,
                event: SocketEvent::Error { id, reason: "socket limit".to_string() },
            });
        }
        if connected {
            self.set_kind(id, Kind::Opened);
            Some(SocketMessage {
                owner,
                event: SocketEvent::Open { id, endpoint: addr.to_string() },
            })
        } else {
            self.set_kind(id, Kind::Opening);
            let _ = self.poller.set_write(fd, id as u32 as u64, true);
            None
        }
    }

    fn req_bind(&mut self, id: i32, owner: u32, fd: RawFd) -> Option<SocketMessage> {
        if !self.slot_new(id, fd, Protocol::Tcp, owner, true) {
            return Some(SocketMessage {
                owner,
                event: SocketEvent::Error { id, reason: "socket limit".to_string() },
            });
        }
        set_nonblocking(fd);
        self.set_kind(id, Kind::Bound);
        Some(SocketMessage {
            owner,
            event: SocketEvent::Open { id, endpoint: "binding".to_string() },
        })
    }

    fn req_start(&mut self, id: i32, owner: u32) -> Option<SocketMessage> {
        if !self.slot_live(id) {
            return Some(SocketMessage {
                owner,
                event: SocketEvent::Error { id, reason: "socket invalid id".to_string() },
            });
        }
        let kind = self.kind(id);
        let at = slot_at(id);
        match kind {
            Kind::PAccept | Kind::PListen => {
                let fd = self.slots[at].fd;
                if let Err(e) = self.poller.add(fd, id as u32 as u64) {
                    self.set_kind(id, Kind::Invalid);
                    return Some(SocketMessage {
                        owner,
                        event: SocketEvent::Error { id, reason: e.desc().to_string() },
                    });
                }
                self.slots[at].owner = owner;
                let endpoint = if kind == Kind::PAccept {
                    self.set_kind(id, Kind::Opened);
                    "start"
                } else {
                    self.set_kind(id, Kind::Listen);
                    "listen"
                };
                Some(SocketMessage {
                    owner,
                    event: SocketEvent::Open { id, endpoint: endpoint.to_string() },
                })
            }
            Kind::Opened => {
                self.slots[at].owner = owner;
                Some(SocketMessage {
                    owner,
                    event: SocketEvent::Open { id, endpoint: "transfer".to_string() },
                })
            }
            _ => None,
        }
    }

    fn req_close(&mut self, id: i32, owner: u32) -> Option<SocketMessage> {
        if !self.slot_live(id) {
            return Some(SocketMessage { owner, event: SocketEvent::Close { id } });
        }
        let at = slot_at(id);
        if !self.slots[at].high.is_empty() || !self.slots[at].low.is_empty() {
            if let Some(msg) = self.send_buffer(id) {
                return Some(msg);
            }
        }
        if self.slots[at].high.is_empty() && self.slots[at].low.is_empty() {
            self.force_close(id);
            return Some(SocketMessage { owner, event: SocketEvent::Close { id } });
        }
        // Writes still pending: drain first, close when they finish.
        self.set_kind(id, Kind::HalfClose);
        None
    }

    fn req_setudp(&mut self, id: i32, addr: UdpRecord) -> Option<SocketMessage> {
        if !self.slot_live(id) {
            return None;
        }
        let at = slot_at(id);
        let tag_matches = match self.slots[at].protocol {
            Protocol::Udp => addr[0] == 1,
            Protocol::Udp6 => addr[0] == 2,
            Protocol::Tcp => false,
        };
        if !tag_matches {
            let owner = self.slots[at].owner;
            return Some(SocketMessage {
                owner,
                event: SocketEvent::Error { id, reason: "socket protocol mismatch".to_string() },
            });
        }
        self.slots[at].peer = addr;
        None
    }

    fn req_send(
        &mut self,
        id: i32,
        data: Vec<u8>,
        priority: Priority,
        udp_addr: Option<UdpRecord>,
    ) -> Option<SocketMessage> {
        let kind = self.kind(id);
        if !self.slot_live(id) || kind == Kind::HalfClose || kind == Kind::PAccept {
            return None;
        }
        if kind == Kind::PListen || kind == Kind::Listen {
            error!("reactor: write to listening socket {}", id);
            return None;
        }
        let at = slot_at(id);
        let owner = self.slots[at].owner;
        let fd = self.slots[at].fd;
        let queues_empty = self.slots[at].high.is_empty() && self.slots[at].low.is_empty();
        if queues_empty && kind == Kind::Opened {
            if self.slots[at].protocol == Protocol::Tcp {
                let mut sent = 0;
                loop {
                    match write(fd, &data[sent..]) {
                        Ok(n) => {
                            sent += n;
                            break;
                        }
                        Err(Errno::EINTR) => continue,
                        Err(Errno::EAGAIN) => break,
                        Err(e) => {
                            error!("reactor: write to socket {} (fd={}): {}", id, fd, e);
                            self.force_close(id);
                            return Some(SocketMessage { owner, event: SocketEvent::Close { id } });
                        }
                    }
                }
                if sent == data.len() {
                    return None;
                }
                self.append(id, WriteBuf { data, pos: sent, udp: None }, priority);
            } else {
                let dest = udp_addr.unwrap_or(self.slots[at].peer);
                let done = match decode_udp_address(&dest) {
                    Some((addr, _)) => matches!(sock_sendto(fd, &data, &addr), Ok(n) if n == data.len()),
                    None => false,
                };
                if done {
                    return None;
                }
                self.append(id, WriteBuf { data, pos: 0, udp: Some(dest) }, priority);
            }
            let _ = self.poller.set_write(fd, id as u32 as u64, true);
        } else if self.slots[at].protocol == Protocol::Tcp {
            self.append(id, WriteBuf { data, pos: 0, udp: None }, priority);
        } else {
            let dest = udp_addr.unwrap_or(self.slots[at].peer);
            self.append(id, WriteBuf { data, pos: 0, udp: Some(dest) }, priority);
        }
        let wb = self.meta(id).wb.load(Ordering::Relaxed);
        if wb > WB_WARNING && !self.slots[at].warned {
            // One warning per crossing; re-armed when the backlog drains.
            self.slots[at].warned = true;
            return Some(SocketMessage {
                owner,
                event: SocketEvent::Warning { id, pending_kb: (wb / 1024) as i32 },
            });
        }
        None
    }

    fn append(&mut self, id: i32, buf: WriteBuf, priority: Priority) {
        let remaining = buf.remaining() as i64;
        let at = slot_at(id);
        match priority {
            Priority::High => self.slots[at].high.push_back(buf),
            Priority::Low => self.slots[at].low.push_back(buf),
        }
        self.meta(id).wb.fetch_add(remaining, Ordering::Relaxed);
    }

    /// Drain the write queues: all of high first, then low one message at a
    /// time. A partial low message is promoted onto the (empty) high queue
    /// so the next pass finishes it before low gets another turn. When both
    /// run dry, write interest is dropped, and a half-closed socket dies.
    fn send_buffer(&mut self, id: i32) -> Option<SocketMessage> {
        let at = slot_at(id);
        let owner = self.slots[at].owner;
        let fd = self.slots[at].fd;
        debug_assert!(self.slots[at].low.front().map_or(true, |b| b.pos == 0));
        match drain_list(fd, &mut self.slots[at].high, &self.pool.meta[at].wb) {
            Drain::Failed(e) => {
                error!("reactor: write to socket {} (fd={}): {}", id, fd, e);
                self.force_close(id);
                return Some(SocketMessage { owner, event: SocketEvent::Close { id } });
            }
            Drain::Blocked | Drain::Done => {}
        }
        if !self.slots[at].high.is_empty() {
            self.rearm_warning(id);
            return None;
        }
        if !self.slots[at].low.is_empty() {
            match drain_list(fd, &mut self.slots[at].low, &self.pool.meta[at].wb) {
                Drain::Failed(e) => {
                    error!("reactor: write to socket {} (fd={}): {}", id, fd, e);
                    self.force_close(id);
                    return Some(SocketMessage { owner, event: SocketEvent::Close { id } });
                }
                Drain::Blocked | Drain::Done => {}
            }
            if self.slots[at].low.front().is_some_and(|b| b.pos > 0) {
                let part = self.slots[at].low.pop_front().unwrap();
                debug_assert!(self.slots[at].high.is_empty());
                self.slots[at].high.push_back(part);
            }
            self.rearm_warning(id);
            return None;
        }
        self.rearm_warning(id);
        let _ = self.poller.set_write(fd, id as u32 as u64, false);
        if self.kind(id) == Kind::HalfClose {
            self.force_close(id);
            return Some(SocketMessage { owner, event: SocketEvent::Close { id } });
        }
        None
    }

    /// Once the backlog has drained back under the warning mark, the next
    /// crossing warns again.
    fn rearm_warning(&mut self, id: i32) {
        let at = slot_at(id);
        if self.slots[at].warned && self.pool.meta[at].wb.load(Ordering::Relaxed) <= WB_WARNING {
            self.slots[at].warned = false;
        }
    }

    fn forward_tcp(&mut self, id: i32) -> Forward {
        let at = slot_at(id);
        let owner = self.slots[at].owner;
        let fd = self.slots[at].fd;
        let hint = self.slots[at].read_hint;
        let mut buf = vec![0u8; hint];
        let n = match read(fd, &mut buf) {
            Err(Errno::EINTR) => return Forward::Skip,
            Err(Errno::EAGAIN) => {
                warn!("reactor: spurious readable on socket {}", id);
                return Forward::Skip;
            }
            Err(e) => {
                self.force_close(id);
                return Forward::Closed(SocketMessage {
                    owner,
                    event: SocketEvent::Error { id, reason: e.desc().to_string() },
                });
            }
            Ok(0) => {
                self.force_close(id);
                return Forward::Closed(SocketMessage { owner, event: SocketEvent::Close { id } });
            }
            Ok(n) => n,
        };
        if self.kind(id) == Kind::HalfClose {
            // Locally closed; discard whatever the peer still sends.
            return Forward::Skip;
        }
        if n == hint {
            self.slots[at].read_hint *= 2;
        } else if hint > MIN_READ_BUFFER && n * 2 < hint {
            self.slots[at].read_hint /= 2;
        }
        buf.truncate(n);
        Forward::Deliver(SocketMessage {
            owner,
            event: SocketEvent::Data { id, data: buf.into_boxed_slice() },
        })
    }

    fn forward_udp(&mut self, id: i32) -> Forward {
        let at = slot_at(id);
        let owner = self.slots[at].owner;
        let fd = self.slots[at].fd;
        let (n, from) = match recvfrom::<SockaddrStorage>(fd, &mut self.udp_scratch) {
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => return Forward::Skip,
            Err(e) => {
                self.force_close(id);
                return Forward::Closed(SocketMessage {
                    owner,
                    event: SocketEvent::Error { id, reason: e.desc().to_string() },
                });
            }
            Ok((n, from)) => (n, from),
        };
        let addr = match from.as_ref().and_then(storage_to_addr) {
            Some(addr) => addr,
            None => return Forward::Skip,
        };
        let family_ok = match self.slots[at].protocol {
            Protocol::Udp => addr.is_ipv4(),
            Protocol::Udp6 => addr.is_ipv6(),
            Protocol::Tcp => false,
        };
        if !family_ok {
            return Forward::Skip;
        }
        let mut rec = [0u8; UDP_ADDRESS_SIZE];
        let rec_len = encode_udp_address(&addr, &mut rec);
        let mut data = Vec::with_capacity(n + rec_len);
        data.extend_from_slice(&self.udp_scratch[..n]);
        data.extend_from_slice(&rec[..rec_len]);
        Forward::Deliver(SocketMessage {
            owner,
            event: SocketEvent::Udp { id, data: data.into_boxed_slice(), payload: n },
        })
    }

    fn try_open(&mut self, id: i32) -> Option<SocketMessage> {
        let at = slot_at(id);
        let owner = self.slots[at].owner;
        let fd = self.slots[at].fd;
        match getsockopt(fd, sockopt::SocketError) {
            Err(e) => {
                self.force_close(id);
                Some(SocketMessage {
                    owner,
                    event: SocketEvent::Error { id, reason: e.desc().to_string() },
                })
            }
            Ok(errno) if errno != 0 => {
                self.force_close(id);
                let reason = Errno::from_i32(errno).desc().to_string();
                Some(SocketMessage { owner, event: SocketEvent::Error { id, reason } })
            }
            Ok(_) => {
                self.set_kind(id, Kind::Opened);
                if self.slots[at].high.is_empty() && self.slots[at].low.is_empty() {
                    let _ = self.poller.set_write(fd, id as u32 as u64, false);
                }
                let endpoint = getpeername::<SockaddrStorage>(fd)
                    .ok()
                    .as_ref()
                    .and_then(storage_to_addr)
                    .map(|a| a.to_string())
                    .unwrap_or_default();
                Some(SocketMessage { owner, event: SocketEvent::Open { id, endpoint } })
            }
        }
    }

    fn try_accept(&mut self, id: i32) -> Option<SocketMessage> {
        let at = slot_at(id);
        let owner = self.slots[at].owner;
        let client = match accept(self.slots[at].fd) {
            Err(e @ (Errno::EMFILE | Errno::ENFILE)) => {
                // Out of descriptors: report, keep the listener alive.
                return Some(SocketMessage {
                    owner,
                    event: SocketEvent::Error { id, reason: e.desc().to_string() },
                });
            }
            Err(_) => return None,
            Ok(fd) => fd,
        };
        let peer = match self.pool.reserve() {
            Some(peer) => peer,
            None => {
                let _ = close(client);
                return None;
            }
        };
        let _ = setsockopt(client, sockopt::KeepAlive, &true);
        set_nonblocking(client);
        if !self.slot_new(peer, client, Protocol::Tcp, owner, false) {
            let _ = close(client);
            return None;
        }
        self.set_kind(peer, Kind::PAccept);
        let endpoint = getpeername::<SockaddrStorage>(client)
            .ok()
            .as_ref()
            .and_then(storage_to_addr)
            .map(|a| a.to_string())
            .unwrap_or_default();
        Some(SocketMessage { owner, event: SocketEvent::Accept { id, peer, endpoint } })
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        for at in 0..MAX_SOCKET {
            let meta = &self.pool.meta[at];
            let kind = kind_from(meta.kind.load(Ordering::Acquire));
            if kind != Kind::Invalid && kind != Kind::Reserve {
                let id = meta.id.load(Ordering::Acquire);
                self.force_close(id);
            }
        }
    }
}

fn slot_at(id: i32) -> usize {
    id as usize & (MAX_SOCKET - 1)
}

fn drain_list(fd: RawFd, list: &mut VecDeque<WriteBuf>, wb: &AtomicI64) -> Drain {
    while let Some(buf) = list.front_mut() {
        match &buf.udp {
            None => loop {
                match write(fd, &buf.data[buf.pos..]) {
                    Err(Errno::EINTR) => continue,
                    Err(Errno::EAGAIN) => return Drain::Blocked,
                    Err(e) => return Drain::Failed(e),
                    Ok(n) => {
                        wb.fetch_sub(n as i64, Ordering::Relaxed);
                        buf.pos += n;
                        if buf.pos != buf.data.len() {
                            return Drain::Blocked;
                        }
                        break;
                    }
                }
            },
            Some(rec) => {
                let addr = match decode_udp_address(rec) {
                    Some((addr, _)) => addr,
                    None => {
                        // Unroutable record; drop the datagram.
                        wb.fetch_sub(buf.remaining() as i64, Ordering::Relaxed);
                        list.pop_front();
                        continue;
                    }
                };
                loop {
                    match sock_sendto(fd, &buf.data, &addr) {
                        Err(Errno::EINTR) => continue,
                        Err(Errno::EAGAIN) => return Drain::Blocked,
                        Err(e) => return Drain::Failed(e),
                        Ok(_) => {
                            wb.fetch_sub(buf.data.len() as i64, Ordering::Relaxed);
                            break;
                        }
                    }
                }
            }
        }
        list.pop_front();
    }
    Drain::Done
}

fn set_nonblocking(fd: RawFd) {
    if let Ok(flags) = fcntl(fd, FcntlArg::F_GETFL) {
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        let _ = fcntl(fd, FcntlArg::F_SETFL(flags));
    }
}

fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    (host, port).to_socket_addrs().ok()?.next()
}

/// Create, configure, and bind a socket for `host:port`. Returns the fd and
/// the address family actually used.
fn bind_socket(host: &str, port: u16, udp: bool) -> Result<(RawFd, AddressFamily), SocketError> {
    let addr = resolve(host, port).ok_or(SocketError::AddressNotFound)?;
    let (family, ty, proto) = match (&addr, udp) {
        (SocketAddr::V4(_), false) => (AddressFamily::Inet, SockType::Stream, SockProtocol::Tcp),
        (SocketAddr::V4(_), true) => (AddressFamily::Inet, SockType::Datagram, SockProtocol::Udp),
        (SocketAddr::V6(_), false) => (AddressFamily::Inet6, SockType::Stream, SockProtocol::Tcp),
        (SocketAddr::V6(_), true) => (AddressFamily::Inet6, SockType::Datagram, SockProtocol::Udp),
    };
    let fd = socket(family, ty, SockFlag::empty(), proto).map_err(SocketError::Os)?;
    if let Err(e) = setsockopt(fd, sockopt::ReuseAddr, &true) {
        let _ = close(fd);
        return Err(SocketError::Os(e));
    }
    if let Err(e) = sock_bind(fd, &addr) {
        let _ = close(fd);
        return Err(SocketError::Os(e));
    }
    Ok((fd, family))
}

fn sock_bind(fd: RawFd, addr: &SocketAddr) -> nix::Result<()> {
    match addr {
        SocketAddr::V4(a) => bind(fd, &SockaddrIn::from(*a)),
        SocketAddr::V6(a) => bind(fd, &SockaddrIn6::from(*a)),
    }
}

fn sock_connect(fd: RawFd, addr: &SocketAddr) -> nix::Result<()> {
    match addr {
        SocketAddr::V4(a) => connect(fd, &SockaddrIn::from(*a)),
        SocketAddr::V6(a) => connect(fd, &SockaddrIn6::from(*a)),
    }
}

fn sock_sendto(fd: RawFd, data: &[u8], addr: &SocketAddr) -> nix::Result<usize> {
    match addr {
        SocketAddr::V4(a) => sendto(fd, data, &SockaddrIn::from(*a), MsgFlags::empty()),
        SocketAddr::V6(a) => sendto(fd, data, &SockaddrIn6::from(*a), MsgFlags::empty()),
    }
}

fn local_addr(fd: RawFd) -> Option<SocketAddr> {
    getsockname::<SockaddrStorage>(fd)
        .ok()
        .as_ref()
        .and_then(storage_to_addr)
}

fn storage_to_addr(ss: &SockaddrStorage) -> Option<SocketAddr> {
    if let Some(sin) = ss.as_sockaddr_in() {
        Some(SocketAddr::V4((*sin).into()))
    } else {
        ss.as_sockaddr_in6().map(|sin6| SocketAddr::V6((*sin6).into()))
    }
}
