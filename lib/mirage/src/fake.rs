//! Post-handshake header stamping. Once the userspace TCP endpoint freezes,
//! this layer continues its sequence space: outgoing frames get IPv4 + TCP
//! headers with monotonically advancing SEQ, incoming segments are verified
//! against the 4-tuple and stripped down to their payload.
//!
//! The real TCP state machine is the peer's mirror of this stamper; anything
//! that tries to drive state here (SYN, FIN, RST) is rejected.

use crate::error::{FrameError, Result};
use crate::tcpip::{self, TcpView};
use std::net::SocketAddrV4;
use vapor::packet::Packet;

pub struct FakeTcp {
    local: SocketAddrV4,
    remote: SocketAddrV4,
    seq: u32,
    ack: u32,
}

impl FakeTcp {
    /// `(seq0, ack0)` is the userspace endpoint's frozen `(snd_nxt, rcv_nxt)`
    /// pair, so the stamped stream continues without a visible discontinuity.
    #[inline]
    pub fn new(local: SocketAddrV4, remote: SocketAddrV4, seq0: u32, ack0: u32) -> FakeTcp {
        FakeTcp {
            local,
            remote,
            seq: seq0,
            ack: ack0,
        }
    }

    /// Next sequence number to be stamped.
    #[inline]
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Highest acknowledgement observed so far.
    #[inline]
    pub fn ack(&self) -> u32 {
        self.ack
    }

    /// Prepends IPv4 + TCP headers to the payload window, stamping the current
    /// SEQ/ACK with the ACK flag, and advances SEQ by the payload length. The
    /// checksums cover the window as-is; a record layer that rewrites the
    /// payload afterwards re-folds them.
    pub fn attach_send(&mut self, pkt: &mut Packet) {
        let payload_len = pkt.len();

        pkt.unstrip(tcpip::TCP_HEADER_SIZE);
        let segment_len = pkt.len();
        tcpip::write_tcp(
            &mut pkt.data_mut()[..segment_len],
            self.local,
            self.remote,
            self.seq,
            self.ack,
            tcpip::FLAG_ACK,
        );

        pkt.unstrip(tcpip::IPV4_HEADER_SIZE);
        tcpip::write_ipv4(pkt.data_mut(), self.local, self.remote);

        self.seq = self.seq.wrapping_add(payload_len as u32);
    }

    /// Checks an inbound TCP segment against the stamping contract without
    /// touching state. Runs before the record layer pays for a decryption.
    pub fn verify(&self, segment: &[u8]) -> Result<()> {
        let tcp = TcpView::new(segment).ok_or(FrameError::Short)?;

        if tcp.src_port() != self.remote.port() || tcp.dst_port() != self.local.port() {
            return Err(FrameError::Tuple.into());
        }

        let flags = tcp.flags();
        if flags & (tcpip::FLAG_SYN | tcpip::FLAG_FIN | tcpip::FLAG_RST) != 0
            || flags & tcpip::FLAG_ACK == 0
        {
            return Err(FrameError::Flags.into());
        }

        if tcp.payload().is_empty() {
            return Err(FrameError::Empty.into());
        }

        Ok(())
    }

    /// Accepts a verified inbound segment: advances the acknowledgement point
    /// past its payload (window-relative, so reordered duplicates never move
    /// it backwards) and strips the TCP header.
    pub fn attach_recv(&mut self, pkt: &mut Packet) {
        let tcp = TcpView::new(pkt.data()).expect("attach_recv on unverified segment");
        let header_len = tcp.header_len();
        let end = tcp.seq().wrapping_add(tcp.payload().len() as u32);

        self.ack = tcpip::seq_max(self.ack, end);
        pkt.strip(header_len);
    }
}
