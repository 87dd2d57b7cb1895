//! A minimal userspace TCP endpoint, alive only for the duration of the
//! handshake. It opens the wire with a real three-way handshake, carries the
//! scripted exchange as an ordinary reliable byte stream, and then freezes:
//! `freeze()` yields the current `(snd_nxt, rcv_nxt)` pair and guarantees the
//! endpoint never emits another segment, so the header stamper can continue
//! the sequence space seamlessly.
//!
//! Only what the handshake needs is implemented: in-order delivery with
//! cumulative ACKs, go-back-N retransmission on a fixed timer, no windows
//! beyond the peer's patience, no FIN handling (the stream is frozen, never
//! closed).

use crate::error::{Error, HandshakeError, Result};
use crate::raw::Raw;
use crate::tcpip::{self, seq_lt, Ipv4View, TcpView};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};
use vapor::crypto;
use vapor::logging::{self, Logger};
use vapor::packet::Packet;

const RTO: Duration = Duration::from_millis(500);
const POLL_QUANTUM: Duration = Duration::from_millis(20);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum State {
    Listen,
    SynSent,
    SynRcvd,
    Established,
}

pub struct Endpoint {
    local: SocketAddrV4,
    remote: SocketAddrV4,
    state: State,
    mss: usize,

    iss: u32,
    // First unacknowledged and next-to-send sequence numbers.
    snd_una: u32,
    snd_nxt: u32,
    // Next expected inbound sequence number.
    rcv_nxt: u32,

    // Unacknowledged and unsent outbound bytes; the front sits at snd_una.
    send_buf: VecDeque<u8>,
    recv_buf: VecDeque<u8>,

    need_ack: bool,
    need_syn: bool,
    last_tx: Option<Instant>,
    frozen: bool,

    log: Logger,
}

impl Endpoint {
    /// Active opener: will emit a SYN on the first poll.
    pub fn client(local: SocketAddrV4, remote: SocketAddrV4, mtu: usize, log: &Logger) -> Endpoint {
        let mut ep = Endpoint::new(local, remote, mtu, log);
        ep.state = State::SynSent;
        ep.need_syn = true;
        ep
    }

    /// Passive opener: waits for the peer's SYN.
    pub fn server(local: SocketAddrV4, remote: SocketAddrV4, mtu: usize, log: &Logger) -> Endpoint {
        let mut ep = Endpoint::new(local, remote, mtu, log);
        ep.state = State::Listen;
        ep
    }

    fn new(local: SocketAddrV4, remote: SocketAddrV4, mtu: usize, log: &Logger) -> Endpoint {
        let mut iss_bytes = [0u8; 4];
        crypto::random_bytes(&mut iss_bytes);
        let iss = u32::from_le_bytes(iss_bytes);

        Endpoint {
            local,
            remote,
            state: State::Listen,
            mss: mtu - tcpip::HEADERS_SIZE,
            iss,
            snd_una: iss,
            snd_nxt: iss,
            rcv_nxt: 0,
            send_buf: VecDeque::new(),
            recv_buf: VecDeque::new(),
            need_ack: false,
            need_syn: false,
            last_tx: None,
            frozen: false,
            log: log.new(logging::o!()),
        }
    }

    #[inline]
    pub fn established(&self) -> bool {
        self.state == State::Established
    }

    /// All written bytes have been acknowledged by the peer.
    #[inline]
    pub fn all_acked(&self) -> bool {
        self.send_buf.is_empty()
    }

    /// Nothing left to transmit, not even a pending acknowledgement.
    #[inline]
    pub fn idle(&self) -> bool {
        self.all_acked() && !self.need_syn && !self.need_ack
    }

    /// Queues outbound bytes.
    pub fn write(&mut self, data: &[u8]) {
        self.send_buf.extend(data);
    }

    /// Drains up to `buf.len()` received bytes, returning the count.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let count = buf.len().min(self.recv_buf.len());
        for slot in buf[..count].iter_mut() {
            *slot = self.recv_buf.pop_front().expect("Receive buffer underrun");
        }
        count
    }

    #[inline]
    pub fn buffered(&self) -> usize {
        self.recv_buf.len()
    }

    /// Stops all emission for good and hands over the sequence space.
    pub fn freeze(&mut self) -> (u32, u32) {
        self.frozen = true;
        logging::debug!(self.log, "endpoint frozen";
                        "snd_nxt" => self.snd_nxt,
                        "rcv_nxt" => self.rcv_nxt);
        (self.snd_nxt, self.rcv_nxt)
    }

    /// Feeds one inbound packet (full IP window) into the state machine.
    /// Segments that do not fit the current state are dropped; a peer reset is
    /// the only hard failure.
    pub fn handle(&mut self, pkt: &Packet) -> Result<()> {
        let data = pkt.data();
        let ip = match Ipv4View::new(data) {
            Some(ip) => ip,
            None => return Ok(()),
        };
        let tcp = match TcpView::new(&data[ip.header_len()..ip.total_len()]) {
            Some(tcp) => tcp,
            None => return Ok(()),
        };
        let flags = tcp.flags();

        if flags & tcpip::FLAG_RST != 0 {
            return Err(Error::Io(io::ErrorKind::ConnectionReset));
        }

        match self.state {
            State::Listen => {
                if flags & tcpip::FLAG_SYN != 0 && flags & tcpip::FLAG_ACK == 0 {
                    self.rcv_nxt = tcp.seq().wrapping_add(1);
                    self.state = State::SynRcvd;
                    self.need_syn = true;
                    logging::trace!(self.log, "syn received"; "irs" => tcp.seq());
                }
                return Ok(());
            }
            State::SynSent => {
                if flags & tcpip::FLAG_SYN != 0
                    && flags & tcpip::FLAG_ACK != 0
                    && tcp.ack() == self.iss.wrapping_add(1)
                {
                    self.rcv_nxt = tcp.seq().wrapping_add(1);
                    self.snd_una = tcp.ack();
                    self.state = State::Established;
                    self.need_ack = true;
                    logging::trace!(self.log, "connection established"; "role" => "client");
                }
                return Ok(());
            }
            State::SynRcvd => {
                if flags & tcpip::FLAG_SYN != 0 {
                    // Retransmitted SYN: our SYN-ACK was lost.
                    self.need_syn = true;
                    return Ok(());
                }
                if flags & tcpip::FLAG_ACK != 0 && tcp.ack() == self.iss.wrapping_add(1) {
                    self.snd_una = tcp.ack();
                    self.state = State::Established;
                    logging::trace!(self.log, "connection established"; "role" => "server");
                    // Fall through: the completing ACK may already carry data.
                } else {
                    return Ok(());
                }
            }
            State::Established => {
                if flags & tcpip::FLAG_SYN != 0 {
                    // Peer never saw our final ACK; repeat it.
                    self.need_ack = true;
                    return Ok(());
                }
            }
        }

        if flags & tcpip::FLAG_ACK != 0 {
            self.process_ack(tcp.ack());
        }
        self.process_payload(tcp.seq(), tcp.payload());

        Ok(())
    }

    fn process_ack(&mut self, ack: u32) {
        if seq_lt(self.snd_una, ack) && !seq_lt(self.snd_nxt, ack) {
            let acked = ack.wrapping_sub(self.snd_una) as usize;
            self.send_buf.drain(..acked);
            self.snd_una = ack;
        }
    }

    fn process_payload(&mut self, seq: u32, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }

        if seq == self.rcv_nxt {
            self.recv_buf.extend(payload);
            self.rcv_nxt = self.rcv_nxt.wrapping_add(payload.len() as u32);
            self.need_ack = true;
        } else if seq_lt(seq, self.rcv_nxt) {
            // Retransmission of data we already have; re-ack so the peer
            // stops resending.
            self.need_ack = true;
        }
        // Out-of-order data is dropped; the peer's timer recovers it.
    }

    /// Emits at most one segment. Returns None once the endpoint is quiet (or
    /// frozen, after which it is always None).
    pub fn poll_send(&mut self, now: Instant) -> Option<Packet> {
        if self.frozen {
            return None;
        }

        match self.state {
            State::Listen => None,
            State::SynSent => {
                if self.need_syn || self.rto_expired(now) {
                    self.need_syn = false;
                    self.last_tx = Some(now);
                    self.snd_nxt = self.iss.wrapping_add(1);
                    Some(self.segment(self.iss, 0, tcpip::FLAG_SYN, &[]))
                } else {
                    None
                }
            }
            State::SynRcvd => {
                if self.need_syn || self.rto_expired(now) {
                    self.need_syn = false;
                    self.last_tx = Some(now);
                    self.snd_nxt = self.iss.wrapping_add(1);
                    Some(self.segment(self.iss, self.rcv_nxt, tcpip::FLAG_SYN | tcpip::FLAG_ACK, &[]))
                } else {
                    None
                }
            }
            State::Established => {
                let in_flight = self.snd_nxt.wrapping_sub(self.snd_una) as usize;

                if in_flight > 0 && self.rto_expired(now) {
                    // Go-back-N: rewind and resend everything unacknowledged.
                    self.snd_nxt = self.snd_una;
                }

                let in_flight = self.snd_nxt.wrapping_sub(self.snd_una) as usize;
                if in_flight < self.send_buf.len() {
                    let count = self.mss.min(self.send_buf.len() - in_flight);
                    let seq = self.snd_nxt;

                    self.send_buf.make_contiguous();
                    let chunk: Vec<u8> = self
                        .send_buf
                        .as_slices()
                        .0[in_flight..in_flight + count]
                        .to_vec();

                    self.snd_nxt = self.snd_nxt.wrapping_add(count as u32);
                    self.need_ack = false;
                    self.last_tx = Some(now);
                    Some(self.segment(seq, self.rcv_nxt, tcpip::FLAG_ACK | tcpip::FLAG_PSH, &chunk))
                } else if self.need_ack {
                    self.need_ack = false;
                    Some(self.segment(self.snd_nxt, self.rcv_nxt, tcpip::FLAG_ACK, &[]))
                } else {
                    None
                }
            }
        }
    }

    fn rto_expired(&self, now: Instant) -> bool {
        self.last_tx.map_or(true, |tx| now.duration_since(tx) >= RTO)
    }

    fn segment(&self, seq: u32, ack: u32, flags: u8, payload: &[u8]) -> Packet {
        let mut pkt = Packet::new(tcpip::HEADERS_SIZE, self.mss);
        pkt.fill(payload);

        pkt.unstrip(tcpip::TCP_HEADER_SIZE);
        let len = pkt.len();
        tcpip::write_tcp(&mut pkt.data_mut()[..len], self.local, self.remote, seq, ack, flags);

        pkt.unstrip(tcpip::IPV4_HEADER_SIZE);
        tcpip::write_ipv4(pkt.data_mut(), self.local, self.remote);
        pkt
    }
}

/// Drives an endpoint over a raw channel as a blocking byte stream with a
/// hard deadline. The handshake is written against this; after the final
/// exchange the stream settles and freezes into the handover pair.
pub struct Stream<'a> {
    ep: Endpoint,
    raw: &'a dyn Raw,
    deadline: Instant,
    scratch: Packet,
}

impl<'a> Stream<'a> {
    /// Actively opens the stream. The three-way handshake gets a short budget
    /// of its own inside the overall deadline.
    pub fn connect(raw: &'a dyn Raw, deadline: Instant, log: &Logger) -> Result<Stream<'a>> {
        let ep = Endpoint::client(raw.local(), raw.remote(), raw.mtu(), log);
        Stream::open(ep, raw, deadline, deadline.min(Instant::now() + CONNECT_TIMEOUT))
    }

    /// Passively opens the stream.
    pub fn accept(raw: &'a dyn Raw, deadline: Instant, log: &Logger) -> Result<Stream<'a>> {
        let ep = Endpoint::server(raw.local(), raw.remote(), raw.mtu(), log);
        Stream::open(ep, raw, deadline, deadline)
    }

    fn open(
        ep: Endpoint,
        raw: &'a dyn Raw,
        deadline: Instant,
        open_deadline: Instant,
    ) -> Result<Stream<'a>> {
        let mut stream = Stream {
            ep,
            raw,
            deadline,
            scratch: Packet::new(0, raw.mtu()),
        };
        stream.pump_until(open_deadline, Endpoint::established)?;
        Ok(stream)
    }

    /// Writes the bytes and waits until the peer acknowledged all of them.
    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.ep.write(data);
        let deadline = self.deadline;
        self.pump_until(deadline, Endpoint::all_acked)
    }

    /// Fills the buffer from the stream.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let want = buf.len();
        let deadline = self.deadline;
        self.pump_until(deadline, |ep| ep.buffered() >= want)?;

        let got = self.ep.read(buf);
        debug_assert_eq!(got, want);
        Ok(())
    }

    /// Pumps until the endpoint is fully quiet: everything acknowledged and no
    /// acknowledgement of ours still owed. Run before freezing.
    pub fn settle(&mut self) -> Result<()> {
        let deadline = self.deadline;
        self.pump_until(deadline, Endpoint::idle)
    }

    /// Consumes the stream and hands over `(snd_nxt, rcv_nxt)`.
    pub fn freeze(mut self) -> (u32, u32) {
        self.ep.freeze()
    }

    fn pump_until<F: Fn(&Endpoint) -> bool>(&mut self, deadline: Instant, done: F) -> Result<()> {
        loop {
            while let Some(seg) = self.ep.poll_send(Instant::now()) {
                self.raw.send(&seg)?;
            }

            if done(&self.ep) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HandshakeError::Timeout.into());
            }

            self.scratch.reset(0);
            if self.raw.recv_timeout(&mut self.scratch, POLL_QUANTUM)? {
                self.ep.handle(&self.scratch)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use vapor::logging;

    const MTU: usize = 1536;

    fn addr(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    /// Shuttles segments between two endpoints until both go quiet.
    fn shuttle(a: &mut Endpoint, b: &mut Endpoint) {
        let now = Instant::now();
        loop {
            let mut moved = false;

            while let Some(seg) = a.poll_send(now) {
                b.handle(&seg).unwrap();
                moved = true;
            }
            while let Some(seg) = b.poll_send(now) {
                a.handle(&seg).unwrap();
                moved = true;
            }

            if !moved {
                return;
            }
        }
    }

    fn pair() -> (Endpoint, Endpoint) {
        let log = logging::discard();
        let client = Endpoint::client(addr(1, 1000), addr(2, 2000), MTU, &log);
        let server = Endpoint::server(addr(2, 2000), addr(1, 1000), MTU, &log);
        (client, server)
    }

    #[test]
    fn test_three_way_handshake() {
        let (mut client, mut server) = pair();

        shuttle(&mut client, &mut server);

        assert!(client.established());
        assert!(server.established());
    }

    #[test]
    fn test_data_roundtrip() {
        let (mut client, mut server) = pair();
        shuttle(&mut client, &mut server);

        client.write(b"hello stack");
        shuttle(&mut client, &mut server);

        let mut buf = [0u8; 11];
        assert_eq!(server.read(&mut buf), 11);
        assert_eq!(&buf, b"hello stack");
        assert!(client.all_acked());

        server.write(b"pong");
        shuttle(&mut client, &mut server);

        let mut buf = [0u8; 4];
        assert_eq!(client.read(&mut buf), 4);
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn test_lost_segment_is_retransmitted() {
        let (mut client, mut server) = pair();
        shuttle(&mut client, &mut server);

        client.write(b"precious");

        // First transmission evaporates on the wire.
        let lost = client.poll_send(Instant::now()).unwrap();
        drop(lost);
        assert!(client.poll_send(Instant::now()).is_none());

        // After the timer fires, the same bytes come out again.
        let later = Instant::now() + RTO + Duration::from_millis(1);
        let retx = client.poll_send(later).unwrap();
        server.handle(&retx).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf), 8);
        assert_eq!(&buf, b"precious");
    }

    #[test]
    fn test_duplicate_data_is_dropped_but_reacked() {
        let (mut client, mut server) = pair();
        shuttle(&mut client, &mut server);

        client.write(b"once");
        let seg = client.poll_send(Instant::now()).unwrap();
        server.handle(&seg).unwrap();
        server.handle(&seg).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(server.read(&mut buf), 4);
        assert!(server.poll_send(Instant::now()).is_some());
    }

    #[test]
    fn test_freeze_stops_emission_and_reports_handover() {
        let (mut client, mut server) = pair();
        shuttle(&mut client, &mut server);

        client.write(b"last words");
        shuttle(&mut client, &mut server);
        shuttle(&mut client, &mut server);

        let (snd_nxt, _rcv_nxt) = client.freeze();
        assert_eq!(snd_nxt, client.iss.wrapping_add(1 + 10));

        client.write(b"never sent");
        assert!(client.poll_send(Instant::now()).is_none());
    }

    #[test]
    fn test_handover_pairs_mirror_each_other() {
        let (mut client, mut server) = pair();
        shuttle(&mut client, &mut server);

        client.write(b"ab");
        server.write(b"wxyz");
        shuttle(&mut client, &mut server);
        shuttle(&mut client, &mut server);

        let (c_snd, c_rcv) = client.freeze();
        let (s_snd, s_rcv) = server.freeze();

        assert_eq!(c_snd, s_rcv);
        assert_eq!(s_snd, c_rcv);
    }

    #[test]
    fn test_reset_kills_the_endpoint() {
        let (mut client, mut server) = pair();
        shuttle(&mut client, &mut server);

        // A reset as the client end would emit it.
        let rst = client.segment(client.snd_nxt, client.rcv_nxt, tcpip::FLAG_RST | tcpip::FLAG_ACK, &[]);

        assert_eq!(
            server.handle(&rst),
            Err(Error::Io(io::ErrorKind::ConnectionReset))
        );
    }

    #[test]
    fn test_stream_over_mem_raw() {
        use crate::raw::MemRaw;
        use std::sync::Arc;

        let (a, b) = MemRaw::pair(addr(1, 1000), addr(2, 2000), MTU);
        let (a, b) = (Arc::new(a), Arc::new(b));
        let log = logging::discard();

        let server = {
            let b = b.clone();
            std::thread::spawn(move || {
                let log = logging::discard();
                let deadline = Instant::now() + Duration::from_secs(5);
                let mut stream = Stream::accept(b.as_ref(), deadline, &log)?;

                let mut buf = [0u8; 5];
                stream.read_exact(&mut buf)?;
                stream.write_all(b"world")?;
                stream.settle()?;
                Ok::<_, Error>((buf, stream.freeze()))
            })
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut stream = Stream::connect(a.as_ref(), deadline, &log).unwrap();
        stream.write_all(b"hello").unwrap();

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"world");
        stream.settle().unwrap();
        let (c_snd, c_rcv) = stream.freeze();

        let (got, (s_snd, s_rcv)) = server.join().unwrap().unwrap();
        assert_eq!(&got, b"hello");
        assert_eq!(c_snd, s_rcv);
        assert_eq!(s_snd, c_rcv);
    }
}
