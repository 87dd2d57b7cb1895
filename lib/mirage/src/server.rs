//! Proxy-server side of the tunnel: one `Server` per accepted connection. The
//! downlink service demultiplexes inbound frames onto per-session outbound
//! transports; one worker per session relays return traffic back into the
//! tunnel. Session ids are allocated here and announced to the client through
//! the control channel.

use crate::control::{self, Handler};
use crate::error::{CloseSlot, Error, Result, SessionError};
use crate::sconn::{Config, Conn};
use crate::session::{Activity, IdAlloc, Proto, Session, SessionId, CONTROL_SESSION};
use crate::tcpip;
use hashbrown::HashMap;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::Duration;
use vapor::logging::{self, Logger};
use vapor::packet::Packet;

/// Per-session outbound channel toward the real destination: full IP packets
/// out to the network, return traffic for the flow back in.
pub trait Transport: Send + Sync {
    fn send(&self, pkt: &Packet) -> Result<()>;

    /// Blocks until return traffic for the flow arrives. Fails with `Closed`
    /// after `shutdown`.
    fn recv(&self, pkt: &mut Packet) -> Result<()>;

    /// Unblocks pending receivers and releases resources. Idempotent.
    fn shutdown(&self);
}

/// Opens transports; the kernel-facing implementation lives behind this seam.
pub trait Dialer: Send + Sync {
    fn open(&self, desc: &Session) -> Result<Arc<dyn Transport>>;
}

struct Entry {
    id: SessionId,
    desc: Session,
    transport: Arc<dyn Transport>,
    activity: Activity,
    closed: CloseSlot,
}

impl Entry {
    fn close(&self, cause: Error) {
        if self.closed.set(cause) {
            self.transport.shutdown();
        }
    }
}

pub struct Server {
    conn: Arc<Conn>,
    dialer: Box<dyn Dialer>,
    sessions: RwLock<HashMap<SessionId, Arc<Entry>>>,
    alloc: Mutex<IdAlloc>,
    // Until the client ends configuration, only control traffic flows.
    configured: AtomicBool,
    weak: Mutex<Weak<Server>>,
    max_recv_err: u32,
    keepalive_period: Duration,
    closed: CloseSlot,
    log: Logger,
}

impl Server {
    /// Starts serving a freshly accepted connection: spawns the downlink
    /// service and the keepalive scanner.
    pub fn serve(
        conn: Arc<Conn>,
        dialer: Box<dyn Dialer>,
        cfg: &Config,
        log: &Logger,
    ) -> Arc<Server> {
        let server = Arc::new(Server {
            conn,
            dialer,
            sessions: RwLock::new(HashMap::new()),
            alloc: Mutex::new(IdAlloc::new()),
            configured: AtomicBool::new(false),
            weak: Mutex::new(Weak::new()),
            max_recv_err: cfg.max_recv_err,
            keepalive_period: cfg.keepalive_period,
            closed: CloseSlot::new(),
            log: log.new(logging::o!("role" => "server")),
        });

        *server.weak.lock().expect("Self reference poisoned") = Arc::downgrade(&server);

        {
            let server = server.clone();
            thread::spawn(move || server.downlink_service());
        }
        {
            let server = server.clone();
            thread::spawn(move || server.keepalive_service());
        }

        server
    }

    #[inline]
    pub fn conn(&self) -> &Arc<Conn> {
        &self.conn
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    /// Number of live sessions.
    pub fn live(&self) -> usize {
        self.sessions
            .read()
            .expect("Sessions lock poisoned")
            .values()
            .filter(|entry| !entry.closed.is_closed())
            .count()
    }

    /// Opens a proxied flow: allocates an id, dials the destination and starts
    /// the return-traffic worker. Refuses descriptors that are already live.
    pub fn add(&self, desc: Session) -> Result<SessionId> {
        if self.closed.is_closed() {
            return Err(Error::Closed);
        }

        let entry = {
            let mut sessions = self.sessions.write().expect("Sessions lock poisoned");

            if sessions
                .values()
                .any(|entry| !entry.closed.is_closed() && entry.desc == desc)
            {
                return Err(SessionError::DuplicateDescriptor.into());
            }

            let id = self
                .alloc
                .lock()
                .expect("Allocator poisoned")
                .alloc(|id| sessions.contains_key(&id))?;

            let entry = Arc::new(Entry {
                id,
                desc,
                transport: self.dialer.open(&desc)?,
                activity: Activity::new(),
                closed: CloseSlot::new(),
            });
            sessions.insert(id, entry.clone());
            entry
        };

        logging::info!(self.log, "session added";
                       "id" => entry.id,
                       "session" => %entry.desc);

        let server = self
            .weak
            .lock()
            .expect("Self reference poisoned")
            .upgrade()
            .expect("Server vanished while adding a session");
        let worker_entry = entry.clone();
        thread::spawn(move || server.uplink_service(worker_entry));

        Ok(entry.id)
    }

    /// Tears a session down. Idempotent: deleting an unknown id is a no-op.
    pub fn del(&self, id: SessionId) -> Result<()> {
        let removed = self
            .sessions
            .write()
            .expect("Sessions lock poisoned")
            .remove(&id);

        if let Some(entry) = removed {
            entry.close(Error::Closed);
            logging::info!(self.log, "session deleted"; "id" => id);
        }
        Ok(())
    }

    /// Forwards one uplink frame to its session's outbound transport.
    fn dispatch(&self, id: SessionId, pkt: &Packet) -> Result<()> {
        let entry = {
            let sessions = self.sessions.read().expect("Sessions lock poisoned");
            sessions.get(&id).cloned()
        };

        let entry = match entry {
            Some(entry) if !entry.closed.is_closed() => entry,
            _ => return Err(SessionError::UnknownId(id).into()),
        };

        entry.activity.bump();
        entry.transport.send(pkt)
    }

    /// Relays return traffic for one session back through the tunnel.
    fn uplink_service(&self, entry: Arc<Entry>) {
        let mut pkt = Packet::new(tcpip::HEADERS_SIZE, self.conn.mtu());

        loop {
            pkt.reset(tcpip::HEADERS_SIZE);
            if let Err(err) = entry.transport.recv(&mut pkt) {
                entry.close(err);
                return;
            }

            entry.activity.bump();
            if let Err(err) = self.conn.send(&mut pkt, entry.id) {
                entry.close(err);
                return;
            }
        }
    }

    /// The sole reader of the connection. Routes control frames to the RPC
    /// dispatcher and data frames to their sessions, absorbing up to
    /// `max_recv_err` consecutive per-packet errors.
    fn downlink_service(&self) {
        let mut pkt = Packet::new(0, self.conn.mtu());
        let mut tiny = 0u32;

        loop {
            pkt.reset(0);
            let result = match self.conn.recv(&mut pkt) {
                Ok(CONTROL_SESSION) => control::serve_frame(self, &self.conn, pkt.data()),
                Ok(id) => {
                    if self.configured.load(Ordering::Acquire) {
                        self.dispatch(id, &pkt)
                    } else {
                        logging::warn!(self.log, "data frame before end of configuration";
                                       "session" => id);
                        Ok(())
                    }
                }
                Err(err) => Err(err),
            };

            match result {
                Ok(()) => tiny = 0,
                Err(err) if err.tolerated() => {
                    tiny += 1;
                    logging::warn!(self.log, "tolerated packet error";
                                   "cause" => %err,
                                   "consecutive" => tiny);

                    if tiny >= self.max_recv_err {
                        self.close(err);
                        return;
                    }
                }
                Err(err) => {
                    self.close(err);
                    return;
                }
            }
        }
    }

    /// Scans sessions on the keepalive period, reaping the expired and the
    /// already-dead.
    fn keepalive_service(&self) {
        loop {
            thread::sleep(self.keepalive_period);
            if self.closed.is_closed() {
                return;
            }

            let mut reap = Vec::new();
            {
                let sessions = self.sessions.read().expect("Sessions lock poisoned");
                for entry in sessions.values() {
                    if entry.closed.is_closed() {
                        reap.push(entry.id);
                    } else if entry.activity.tick() {
                        entry.close(SessionError::KeepaliveExceeded.into());
                        logging::info!(self.log, "session expired"; "id" => entry.id);
                        reap.push(entry.id);
                    }
                }
            }

            if !reap.is_empty() {
                let mut sessions = self.sessions.write().expect("Sessions lock poisoned");
                for id in reap {
                    sessions.remove(&id);
                }
            }
        }
    }

    /// Closes the server and cascades: every session, then the connection.
    pub fn close(&self, cause: Error) -> Error {
        if self.closed.set(cause.clone()) {
            logging::info!(self.log, "server closing"; "cause" => %cause);

            let sessions: Vec<_> = {
                let mut map = self.sessions.write().expect("Sessions lock poisoned");
                map.drain().map(|(_, entry)| entry).collect()
            };
            for entry in sessions {
                entry.close(Error::Closed);
            }

            self.conn.close_with(cause);
        }
        self.closed.get().expect("Latched cause missing")
    }
}

impl Handler for Server {
    fn ipv6(&self) -> bool {
        false
    }

    fn end_config(&self) {
        self.configured.store(true, Ordering::Release);
        logging::debug!(self.log, "configuration ended");
    }

    fn add_tcp(&self, dst: SocketAddrV4) -> Result<SessionId> {
        self.add(Session {
            src: self.conn.remote(),
            proto: Proto::Tcp,
            dst,
        })
    }

    fn del_tcp(&self, id: SessionId) -> Result<()> {
        self.del(id)
    }

    fn add_udp(&self, dst: SocketAddrV4) -> Result<SessionId> {
        self.add(Session {
            src: self.conn.remote(),
            proto: Proto::Udp,
            dst,
        })
    }

    fn del_udp(&self, id: SessionId) -> Result<()> {
        self.del(id)
    }

    fn pack_loss(&self) -> f32 {
        0.0
    }

    fn ping(&self) {}
}

/// Loopback transport for tests and local runs: everything sent comes back as
/// return traffic, as if the destination echoed it.
pub struct EchoTransport {
    queue_tx: Mutex<std::sync::mpsc::Sender<Vec<u8>>>,
    queue_rx: Mutex<std::sync::mpsc::Receiver<Vec<u8>>>,
    closed: AtomicBool,
}

impl EchoTransport {
    pub fn new() -> EchoTransport {
        let (queue_tx, queue_rx) = std::sync::mpsc::channel();
        EchoTransport {
            queue_tx: Mutex::new(queue_tx),
            queue_rx: Mutex::new(queue_rx),
            closed: AtomicBool::new(false),
        }
    }
}

impl Transport for EchoTransport {
    fn send(&self, pkt: &Packet) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        self.queue_tx
            .lock()
            .expect("Echo queue poisoned")
            .send(pkt.data().to_vec())
            .map_err(|_| Error::Io(std::io::ErrorKind::BrokenPipe))
    }

    fn recv(&self, pkt: &mut Packet) -> Result<()> {
        let queue = self.queue_rx.lock().expect("Echo queue poisoned");

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }

            let data = queue
                .recv()
                .map_err(|_| Error::Io(std::io::ErrorKind::BrokenPipe))?;

            if data.is_empty() || data.len() > pkt.len() {
                continue;
            }

            pkt.truncate(data.len());
            pkt.data_mut().copy_from_slice(&data);
            return Ok(());
        }
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            drop(
                self.queue_tx
                    .lock()
                    .expect("Echo queue poisoned")
                    .send(Vec::new()),
            );
        }
    }
}

/// Dialer handing out echo transports.
pub struct EchoDialer;

impl Dialer for EchoDialer {
    fn open(&self, _desc: &Session) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(EchoTransport::new()))
    }
}

#[cfg(target_os = "linux")]
pub use self::os::RawDialer;

#[cfg(target_os = "linux")]
mod os {
    use super::{Dialer, Transport};
    use crate::error::{Error, Result};
    use crate::session::{Proto, Session};
    use crate::tcpip::Ipv4View;
    use std::io;
    use std::net::SocketAddrV4;
    use std::os::unix::io::RawFd;
    use std::sync::atomic::{AtomicBool, Ordering};
    use vapor::packet::Packet;

    /// Kernel raw socket carrying one proxied flow from the proxy host to the
    /// real destination.
    struct RawTransport {
        fd: RawFd,
        pipe_rd: RawFd,
        pipe_wr: RawFd,
        local: SocketAddrV4,
        dst: SocketAddrV4,
        closed: AtomicBool,
    }

    impl RawTransport {
        fn open(desc: &Session) -> Result<RawTransport> {
            let proto = match desc.proto {
                Proto::Tcp => libc::IPPROTO_TCP,
                Proto::Udp => libc::IPPROTO_UDP,
            };

            unsafe {
                let fd = libc::socket(libc::AF_INET, libc::SOCK_RAW | libc::SOCK_CLOEXEC, proto);
                if fd < 0 {
                    return Err(Error::from(io::Error::last_os_error()));
                }

                let on: libc::c_int = 1;
                if libc::setsockopt(
                    fd,
                    libc::IPPROTO_IP,
                    libc::IP_HDRINCL,
                    &on as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                ) < 0
                {
                    libc::close(fd);
                    return Err(Error::from(io::Error::last_os_error()));
                }

                let mut pipe = [0 as RawFd; 2];
                if libc::pipe2(pipe.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) < 0 {
                    libc::close(fd);
                    return Err(Error::from(io::Error::last_os_error()));
                }

                Ok(RawTransport {
                    fd,
                    pipe_rd: pipe[0],
                    pipe_wr: pipe[1],
                    local: desc.src,
                    dst: desc.dst,
                    closed: AtomicBool::new(false),
                })
            }
        }
    }

    impl Transport for RawTransport {
        fn send(&self, pkt: &Packet) -> Result<()> {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }

            let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            sa.sin_family = libc::AF_INET as libc::sa_family_t;
            sa.sin_port = self.dst.port().to_be();
            sa.sin_addr.s_addr = u32::from_le_bytes(self.dst.ip().octets());

            let count = unsafe {
                libc::sendto(
                    self.fd,
                    pkt.data().as_ptr() as *const libc::c_void,
                    pkt.len(),
                    0,
                    &sa as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            };
            if count < 0 {
                return Err(Error::from(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn recv(&self, pkt: &mut Packet) -> Result<()> {
            let mut buf = vec![0u8; pkt.len()];

            loop {
                if self.closed.load(Ordering::Acquire) {
                    return Err(Error::Closed);
                }

                let mut fds = [
                    libc::pollfd { fd: self.fd, events: libc::POLLIN, revents: 0 },
                    libc::pollfd { fd: self.pipe_rd, events: libc::POLLIN, revents: 0 },
                ];
                let ready = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
                if ready < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err.into());
                }
                if fds[1].revents != 0 {
                    return Err(Error::Closed);
                }

                let count = unsafe {
                    libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
                };
                if count < 0 {
                    return Err(Error::from(io::Error::last_os_error()));
                }
                let data = &buf[..count as usize];

                // Only return traffic for this flow: dst-host -> our src addr.
                let ip = match Ipv4View::new(data) {
                    Some(ip) => ip,
                    None => continue,
                };
                if ip.src() != *self.dst.ip() || ip.dst() != *self.local.ip() {
                    continue;
                }

                // Source and destination ports sit at the same offsets in TCP
                // and UDP headers.
                let segment = &data[ip.header_len()..ip.total_len()];
                if segment.len() < 8 {
                    continue;
                }
                let src_port = u16::from_be_bytes([segment[0], segment[1]]);
                let dst_port = u16::from_be_bytes([segment[2], segment[3]]);
                if src_port != self.dst.port() || dst_port != self.local.port() {
                    continue;
                }

                pkt.truncate(data.len());
                pkt.data_mut().copy_from_slice(data);
                return Ok(());
            }
        }

        fn shutdown(&self) {
            if !self.closed.swap(true, Ordering::AcqRel) {
                unsafe {
                    let byte = 1u8;
                    libc::write(self.pipe_wr, &byte as *const _ as *const libc::c_void, 1);
                }
            }
        }
    }

    impl Drop for RawTransport {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
                libc::close(self.pipe_rd);
                libc::close(self.pipe_wr);
            }
        }
    }

    /// Opens kernel raw transports for proxied flows.
    pub struct RawDialer;

    impl Dialer for RawDialer {
        fn open(&self, desc: &Session) -> Result<std::sync::Arc<dyn Transport>> {
            Ok(std::sync::Arc::new(RawTransport::open(desc)?))
        }
    }
}
