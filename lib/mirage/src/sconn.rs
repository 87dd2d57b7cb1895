//! The secure connection: a framed transport over one raw 4-tuple. `connect`
//! and `accept` drive the userspace endpoint through the scripted handshake,
//! freeze it, and hand its sequence space to the header stamper; from then on
//! every frame is one stamped (and usually sealed) TCP segment.

use crate::crypt::{TcpCrypt, TAG_SIZE};
use crate::error::{CloseSlot, Error, FrameError, Result};
use crate::fake::FakeTcp;
use crate::handshake::{self, KeyExchange};
use crate::raw::Raw;
use crate::session::SessionId;
use crate::tcpip::{self, Ipv4View};
use crate::ustack::Stream;
use byteorder::{BigEndian, ByteOrder};
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use vapor::logging::{self, Logger};
use vapor::packet::Packet;

const SID_SIZE: usize = 2;

#[derive(Clone)]
pub struct Config {
    /// Handshake script: even indices are sent by the client, odd by the
    /// server, each verified verbatim by the other side.
    pub prev_packets: Vec<Vec<u8>>,
    pub key_exchange: KeyExchange,
    pub handshake_timeout: Duration,
    pub mtu: usize,
    /// Consecutive tolerated receive errors before the connection is poisoned.
    pub max_recv_err: u32,
    pub keepalive_period: Duration,
    /// Per-call budget for control RPCs.
    pub control_timeout: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            prev_packets: Vec::new(),
            key_exchange: KeyExchange::None,
            handshake_timeout: Duration::from_secs(30),
            mtu: 1536,
            max_recv_err: 8,
            keepalive_period: Duration::from_secs(60),
            control_timeout: Duration::from_secs(10),
        }
    }
}

/// Framed transport over the masqueraded wire. `send` may be called from many
/// threads; `recv` belongs to the single downlink service.
pub struct Conn {
    raw: Arc<dyn Raw>,
    fake: Mutex<FakeTcp>,
    crypter: Option<TcpCrypt>,
    local: SocketAddrV4,
    remote: SocketAddrV4,
    mtu: usize,
    closed: CloseSlot,
    log: Logger,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("mtu", &self.mtu)
            .finish()
    }
}

impl Conn {
    /// Actively opens a connection: userspace TCP handshake, scripted
    /// exchange, key agreement, handover.
    pub fn connect(raw: Arc<dyn Raw>, cfg: &Config, log: &Logger) -> Result<Conn> {
        Conn::open(raw, cfg, log, true)
    }

    /// Passively opens a connection.
    pub fn accept(raw: Arc<dyn Raw>, cfg: &Config, log: &Logger) -> Result<Conn> {
        Conn::open(raw, cfg, log, false)
    }

    fn open(raw: Arc<dyn Raw>, cfg: &Config, log: &Logger, active: bool) -> Result<Conn> {
        let local = raw.local();
        let remote = raw.remote();
        let log = log.new(logging::o!(
            "local" => local.to_string(),
            "remote" => remote.to_string(),
        ));

        let deadline = Instant::now() + cfg.handshake_timeout;
        let result = Conn::shake(&*raw, cfg, &log, active, deadline);

        let (key, seq, ack) = match result {
            Ok(parts) => parts,
            Err(err) => {
                logging::debug!(log, "handshake failed"; "cause" => %err);
                raw.shutdown();
                return Err(err);
            }
        };

        logging::debug!(log, "connection open";
                        "encrypted" => key.is_some(),
                        "seq" => seq,
                        "ack" => ack);

        Ok(Conn {
            fake: Mutex::new(FakeTcp::new(local, remote, seq, ack)),
            crypter: key.map(|key| TcpCrypt::new(&key)),
            local,
            remote,
            mtu: cfg.mtu,
            closed: CloseSlot::new(),
            log,
            raw,
        })
    }

    fn shake(
        raw: &dyn Raw,
        cfg: &Config,
        log: &Logger,
        active: bool,
        deadline: Instant,
    ) -> Result<(Option<crate::crypt::Key>, u32, u32)> {
        let mut stream = if active {
            Stream::connect(raw, deadline, log)?
        } else {
            Stream::accept(raw, deadline, log)?
        };

        let key = if active {
            handshake::run_client(&mut stream, &cfg.prev_packets, &cfg.key_exchange)?
        } else {
            handshake::run_server(&mut stream, &cfg.prev_packets, &cfg.key_exchange)?
        };

        // The grammar is quiescent here; drain the last acknowledgements so
        // the frozen pair really is the final word of the endpoint.
        stream.settle()?;
        let (seq, ack) = stream.freeze();
        Ok((key, seq, ack))
    }

    #[inline]
    pub fn local(&self) -> SocketAddrV4 {
        self.local
    }

    #[inline]
    pub fn remote(&self) -> SocketAddrV4 {
        self.remote
    }

    #[inline]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Bytes this transport appends to every payload.
    #[inline]
    pub fn overhead(&self) -> usize {
        match self.crypter {
            Some(_) => SID_SIZE + TAG_SIZE,
            None => SID_SIZE,
        }
    }

    /// Largest payload that fits one frame.
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.mtu - tcpip::HEADERS_SIZE - self.overhead()
    }

    /// Sends one frame: appends the session id, seals, stamps and writes.
    /// Atomic per call; concurrent senders are serialized internally, so the
    /// stamped sequence numbers are emitted in submission order.
    pub fn send(&self, pkt: &mut Packet, id: SessionId) -> Result<()> {
        if let Some(cause) = self.closed.get() {
            return Err(cause);
        }
        if pkt.len() > self.max_payload() {
            return Err(FrameError::Oversize.into());
        }

        BigEndian::write_u16(pkt.extend(SID_SIZE), id);
        if self.crypter.is_some() {
            pkt.extend(TAG_SIZE);
        }

        let mut fake = self.fake.lock().expect("Writer lock poisoned");
        fake.attach_send(pkt);

        if let Some(crypter) = &self.crypter {
            if let Err(err) = crypter.seal(pkt) {
                return Err(self.close_with(err));
            }
        }

        if let Err(err) = self.raw.send(pkt) {
            return Err(self.close_with(err));
        }

        logging::trace!(self.log, "frame sent"; "session" => id, "len" => pkt.len());
        Ok(())
    }

    /// Receives one frame and returns its session id. Tolerated (per-packet)
    /// errors are returned without poisoning the connection; the caller
    /// budgets them. Fatal errors latch.
    pub fn recv(&self, pkt: &mut Packet) -> Result<SessionId> {
        if let Some(cause) = self.closed.get() {
            return Err(cause);
        }

        if let Err(err) = self.raw.recv(pkt) {
            return Err(self.close_with(err));
        }

        let ip_len = Ipv4View::new(pkt.data())
            .ok_or(Error::Frame(FrameError::Short))?
            .header_len();

        // Cheap contract checks before paying for a decryption; stray
        // handshake retransmissions die here.
        {
            let fake = self.fake.lock().expect("Writer lock poisoned");
            fake.verify(&pkt.data()[ip_len..])?;
        }

        if let Some(crypter) = &self.crypter {
            crypter.open(pkt)?;
        }

        pkt.strip(ip_len);
        {
            let mut fake = self.fake.lock().expect("Writer lock poisoned");
            fake.attach_recv(pkt);
        }

        if self.crypter.is_some() {
            pkt.truncate(pkt.len() - TAG_SIZE);
        }
        if pkt.len() < SID_SIZE {
            return Err(FrameError::Short.into());
        }

        let id = BigEndian::read_u16(&pkt.data()[pkt.len() - SID_SIZE..]);
        pkt.truncate(pkt.len() - SID_SIZE);

        logging::trace!(self.log, "frame received"; "session" => id, "len" => pkt.len());
        Ok(id)
    }

    /// Closes with an explicit cause. The first cause wins; every later close
    /// or operation sees it.
    pub fn close_with(&self, cause: Error) -> Error {
        if self.closed.set(cause) {
            logging::debug!(self.log, "connection closed";
                            "cause" => %self.closed.get().expect("Latched cause missing"));
            self.raw.shutdown();
        }
        self.closed.get().expect("Latched cause missing")
    }

    /// Idempotent close; returns the latched cause.
    pub fn close(&self) -> Error {
        self.close_with(Error::Closed)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }
}
