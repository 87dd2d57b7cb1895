//! The raw-IP channel under the tunnel: full IP packets in and out, scoped to
//! a single TCP 4-tuple. Inbound traffic is filtered and checksum-verified
//! here, so everything above this layer only ever sees well-formed segments
//! that belong to the connection.

use crate::error::{Error, Result};
use crate::tcpip::{self, Ipv4View, TcpView};
use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use vapor::packet::Packet;

/// A bidirectional raw-IP channel constrained to one TCP 4-tuple. The only
/// component that touches the kernel; everything else is deterministic on top.
pub trait Raw: Send + Sync {
    fn local(&self) -> SocketAddrV4;
    fn remote(&self) -> SocketAddrV4;
    fn mtu(&self) -> usize;

    /// Blocks until the next packet matching the 4-tuple arrives and copies it
    /// into the packet window. Fails with `Closed` after `shutdown`.
    fn recv(&self, pkt: &mut Packet) -> Result<()>;

    /// Like `recv`, bounded. Returns Ok(false) when the timeout elapses first.
    fn recv_timeout(&self, pkt: &mut Packet, timeout: Duration) -> Result<bool>;

    /// Writes one full IP packet to the wire.
    fn send(&self, pkt: &Packet) -> Result<()>;

    /// Unblocks pending readers and poisons the channel. Idempotent.
    fn shutdown(&self);
}

/// True when the packet is an intact TCP segment from `remote` to `local`.
fn matches(data: &[u8], local: SocketAddrV4, remote: SocketAddrV4) -> bool {
    let ip = match Ipv4View::new(data) {
        Some(ip) => ip,
        None => return false,
    };

    if ip.protocol() != tcpip::PROTO_TCP
        || ip.src() != *remote.ip()
        || ip.dst() != *local.ip()
        || !ip.checksum_ok()
    {
        return false;
    }

    let tcp = match TcpView::new(&data[ip.header_len()..ip.total_len()]) {
        Some(tcp) => tcp,
        None => return false,
    };

    tcp.src_port() == remote.port()
        && tcp.dst_port() == local.port()
        && tcp.checksum_ok(ip.src(), ip.dst())
}

/// In-memory raw channel: two cross-wired ends over process-local queues.
/// Carries the same full IP packets the kernel path does and applies the same
/// inbound filter, which keeps tests and loopback runs honest.
pub struct MemRaw {
    local: SocketAddrV4,
    remote: SocketAddrV4,
    mtu: usize,
    peer: Mutex<mpsc::Sender<Vec<u8>>>,
    wake: Mutex<mpsc::Sender<Vec<u8>>>,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: AtomicBool,
}

impl MemRaw {
    /// Builds a connected pair; `a` sees `(a_addr, b_addr)` as its 4-tuple and
    /// `b` the reverse.
    pub fn pair(a_addr: SocketAddrV4, b_addr: SocketAddrV4, mtu: usize) -> (MemRaw, MemRaw) {
        let (a_tx, a_rx) = mpsc::channel();
        let (b_tx, b_rx) = mpsc::channel();

        let a = MemRaw {
            local: a_addr,
            remote: b_addr,
            mtu,
            peer: Mutex::new(b_tx.clone()),
            wake: Mutex::new(a_tx.clone()),
            inbound: Mutex::new(a_rx),
            closed: AtomicBool::new(false),
        };
        let b = MemRaw {
            local: b_addr,
            remote: a_addr,
            mtu,
            peer: Mutex::new(a_tx),
            wake: Mutex::new(b_tx),
            inbound: Mutex::new(b_rx),
            closed: AtomicBool::new(false),
        };

        (a, b)
    }

    fn deliver(&self, data: Vec<u8>, pkt: &mut Packet) -> bool {
        // The wake sentinel is an empty frame sent by shutdown.
        if data.is_empty() || data.len() > pkt.len() {
            return false;
        }

        if !matches(&data, self.local, self.remote) {
            return false;
        }

        pkt.truncate(data.len());
        pkt.data_mut().copy_from_slice(&data);
        true
    }
}

impl Raw for MemRaw {
    #[inline]
    fn local(&self) -> SocketAddrV4 {
        self.local
    }

    #[inline]
    fn remote(&self) -> SocketAddrV4 {
        self.remote
    }

    #[inline]
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn recv(&self, pkt: &mut Packet) -> Result<()> {
        let inbound = self.inbound.lock().expect("Inbound queue poisoned");

        loop {
            // Drain queued packets before honoring shutdown, so a close racing
            // the last delivery never swallows it.
            match inbound.try_recv() {
                Ok(data) => {
                    if self.deliver(data, pkt) {
                        return Ok(());
                    }
                    continue;
                }
                Err(mpsc::TryRecvError::Empty) => {}
                Err(mpsc::TryRecvError::Disconnected) => {
                    return Err(Error::Io(io::ErrorKind::BrokenPipe));
                }
            }

            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }

            match inbound.recv() {
                Ok(data) => {
                    if self.deliver(data, pkt) {
                        return Ok(());
                    }
                }
                Err(_) => return Err(Error::Io(io::ErrorKind::BrokenPipe)),
            }
        }
    }

    fn recv_timeout(&self, pkt: &mut Packet, timeout: Duration) -> Result<bool> {
        let inbound = self.inbound.lock().expect("Inbound queue poisoned");
        let deadline = Instant::now() + timeout;

        loop {
            match inbound.try_recv() {
                Ok(data) => {
                    if self.deliver(data, pkt) {
                        return Ok(true);
                    }
                    continue;
                }
                Err(mpsc::TryRecvError::Empty) => {}
                Err(mpsc::TryRecvError::Disconnected) => {
                    return Err(Error::Io(io::ErrorKind::BrokenPipe));
                }
            }

            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }

            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => return Ok(false),
            };

            match inbound.recv_timeout(remaining) {
                Ok(data) => {
                    if self.deliver(data, pkt) {
                        return Ok(true);
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => return Ok(false),
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(Error::Io(io::ErrorKind::BrokenPipe));
                }
            }
        }
    }

    fn send(&self, pkt: &Packet) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if pkt.len() > self.mtu {
            return Err(Error::Io(io::ErrorKind::InvalidInput));
        }

        self.peer
            .lock()
            .expect("Peer queue poisoned")
            .send(pkt.data().to_vec())
            .map_err(|_| Error::Io(io::ErrorKind::BrokenPipe))
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        // Wake any blocked reader with an empty sentinel frame.
        drop(self.wake.lock().expect("Wake queue poisoned").send(Vec::new()));
    }
}

#[cfg(target_os = "linux")]
pub use self::os::{RawListener, RawSock};

#[cfg(target_os = "linux")]
mod os {
    use super::{matches, Raw};
    use crate::error::{Error, Result};
    use crate::tcpip::{self, Ipv4View, TcpView};
    use std::io;
    use std::net::SocketAddrV4;
    use std::os::unix::io::RawFd;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use vapor::packet::Packet;

    const DEFAULT_MTU: usize = 1500;

    fn last_error() -> Error {
        Error::from(io::Error::last_os_error())
    }

    fn sockaddr(addr: SocketAddrV4) -> libc::sockaddr_in {
        let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        sa.sin_family = libc::AF_INET as libc::sa_family_t;
        sa.sin_port = addr.port().to_be();
        sa.sin_addr.s_addr = u32::from_le_bytes(addr.ip().octets());
        sa
    }

    /// A raw TCP socket plus a self-pipe so `shutdown` can unblock readers
    /// parked in `poll(2)`.
    struct RawIo {
        fd: RawFd,
        pipe_rd: RawFd,
        pipe_wr: RawFd,
        closed: AtomicBool,
    }

    impl RawIo {
        fn open(local: SocketAddrV4) -> Result<RawIo> {
            unsafe {
                let fd = libc::socket(
                    libc::AF_INET,
                    libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                    libc::IPPROTO_TCP,
                );
                if fd < 0 {
                    return Err(last_error());
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
                    return Err(last_error());
                }

                let sa = sockaddr(local);
                if libc::bind(
                    fd,
                    &sa as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                ) < 0
                {
                    libc::close(fd);
                    return Err(last_error());
                }

                let mut pipe = [0 as RawFd; 2];
                if libc::pipe2(pipe.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) < 0 {
                    libc::close(fd);
                    return Err(last_error());
                }

                Ok(RawIo {
                    fd,
                    pipe_rd: pipe[0],
                    pipe_wr: pipe[1],
                    closed: AtomicBool::new(false),
                })
            }
        }

        /// Waits for the socket to become readable. Ok(false) on timeout,
        /// `Closed` once shut down.
        fn wait_readable(&self, timeout: Option<Duration>) -> Result<bool> {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }

            let mut fds = [
                libc::pollfd {
                    fd: self.fd,
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.pipe_rd,
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            let millis = timeout.map_or(-1, |t| t.as_millis().min(i32::max_value() as u128) as i32);

            let ready = unsafe { libc::poll(fds.as_mut_ptr(), 2, millis) };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(false);
                }
                return Err(err.into());
            }
            if fds[1].revents != 0 || self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }

            Ok(fds[0].revents != 0)
        }

        fn read(&self, buf: &mut [u8]) -> Result<usize> {
            let count = unsafe {
                libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            if count < 0 {
                return Err(last_error());
            }
            Ok(count as usize)
        }

        fn write(&self, data: &[u8], dst: SocketAddrV4) -> Result<()> {
            let sa = sockaddr(dst);
            let count = unsafe {
                libc::sendto(
                    self.fd,
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                    0,
                    &sa as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            };
            if count < 0 {
                return Err(last_error());
            }
            Ok(())
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

    impl Drop for RawIo {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
                libc::close(self.pipe_rd);
                libc::close(self.pipe_wr);
            }
        }
    }

    /// Kernel raw socket scoped to one 4-tuple.
    pub struct RawSock {
        io: RawIo,
        local: SocketAddrV4,
        remote: SocketAddrV4,
        mtu: usize,
    }

    impl RawSock {
        pub fn connect(local: SocketAddrV4, remote: SocketAddrV4) -> Result<RawSock> {
            Ok(RawSock {
                io: RawIo::open(local)?,
                local,
                remote,
                mtu: DEFAULT_MTU,
            })
        }

        fn recv_filtered(&self, pkt: &mut Packet, timeout: Option<Duration>) -> Result<bool> {
            let mut buf = vec![0u8; self.mtu];

            loop {
                if !self.io.wait_readable(timeout)? {
                    return Ok(false);
                }

                let count = self.io.read(&mut buf)?;
                if count == 0 {
                    return Err(Error::Io(io::ErrorKind::UnexpectedEof));
                }

                if matches(&buf[..count], self.local, self.remote) && count <= pkt.len() {
                    pkt.truncate(count);
                    pkt.data_mut().copy_from_slice(&buf[..count]);
                    return Ok(true);
                }
            }
        }
    }

    impl Raw for RawSock {
        #[inline]
        fn local(&self) -> SocketAddrV4 {
            self.local
        }

        #[inline]
        fn remote(&self) -> SocketAddrV4 {
            self.remote
        }

        #[inline]
        fn mtu(&self) -> usize {
            self.mtu
        }

        fn recv(&self, pkt: &mut Packet) -> Result<()> {
            self.recv_filtered(pkt, None).map(|_| ())
        }

        fn recv_timeout(&self, pkt: &mut Packet, timeout: Duration) -> Result<bool> {
            self.recv_filtered(pkt, Some(timeout))
        }

        fn send(&self, pkt: &Packet) -> Result<()> {
            if self.io.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            self.io.write(pkt.data(), self.remote)
        }

        fn shutdown(&self) {
            self.io.shutdown();
        }
    }

    /// Accepts tunnel clients by watching a port for initial SYNs. Each accept
    /// yields a fresh `RawSock` scoped to the caller's 4-tuple; the consumed
    /// SYN is recovered by the client's retransmission.
    pub struct RawListener {
        io: RawIo,
        local: SocketAddrV4,
    }

    impl RawListener {
        pub fn bind(local: SocketAddrV4) -> Result<RawListener> {
            Ok(RawListener {
                io: RawIo::open(local)?,
                local,
            })
        }

        pub fn accept(&self) -> Result<RawSock> {
            let mut buf = vec![0u8; DEFAULT_MTU];

            loop {
                self.io.wait_readable(None)?;
                let count = self.io.read(&mut buf)?;

                let ip = match Ipv4View::new(&buf[..count]) {
                    Some(ip) => ip,
                    None => continue,
                };
                if ip.dst() != *self.local.ip() {
                    continue;
                }

                let tcp = match TcpView::new(&buf[ip.header_len()..ip.total_len()]) {
                    Some(tcp) => tcp,
                    None => continue,
                };
                if tcp.dst_port() != self.local.port()
                    || tcp.flags() & tcpip::FLAG_SYN == 0
                    || tcp.flags() & tcpip::FLAG_ACK != 0
                {
                    continue;
                }

                let peer = SocketAddrV4::new(ip.src(), tcp.src_port());
                return RawSock::connect(self.local, peer);
            }
        }

        pub fn shutdown(&self) {
            self.io.shutdown();
        }
    }
}
