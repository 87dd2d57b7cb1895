//! The record layer. Frames are sealed in place inside their stamped segment:
//! the TCP pseudo-header and header (checksum zeroed) are bound as additional
//! data and the nonce is derived from the segment's SEQ/ACK pair, so a replayed
//! record only opens at the exact point of the fake stream it was cut from.

use crate::error::{Error, Result};
use crate::tcpip::{self, Ipv4View, TcpView};
use vapor::crypto;
use vapor::packet::Packet;

pub const KEY_BYTES: usize = 16;

/// Wire key material agreed during the handshake.
pub type Key = [u8; KEY_BYTES];

/// Tag bytes appended to every sealed frame.
pub const TAG_SIZE: usize = crypto::MAC_SIZE;

const MAX_TCP_HEADER: usize = 60;
const MAX_AAD: usize = tcpip::PSEUDO_HEADER_SIZE + MAX_TCP_HEADER;

pub struct TcpCrypt {
    key: [u8; crypto::KEY_SIZE],
}

impl TcpCrypt {
    /// Expands the 16-byte wire key into the cipher key. Peers agree on the
    /// wire key, so they arrive at the same cipher key.
    #[inline]
    pub fn new(key: &Key) -> TcpCrypt {
        TcpCrypt {
            key: crypto::expand_key(key),
        }
    }

    /// Seals a stamped segment in place. The window must be a full IP packet
    /// whose final `TAG_SIZE` bytes are reserved for the tag; everything
    /// between the TCP header and the tag is encrypted. Re-folds the TCP
    /// checksum afterwards, since the payload bytes changed under it.
    pub fn seal(&self, pkt: &mut Packet) -> Result<()> {
        let (ip_len, tcp_len, nonce, aad, aad_len, src, dst) = Self::dissect(pkt)?;

        let data = pkt.data_mut();
        let payload = &mut data[ip_len + tcp_len..];
        if payload.len() < TAG_SIZE {
            return Err(Error::Crypto);
        }

        let plain_len = payload.len() - TAG_SIZE;
        if !crypto::seal_in_place(payload, plain_len, &aad[..aad_len], nonce, &self.key) {
            return Err(Error::Crypto);
        }

        tcpip::refresh_tcp_checksum(&mut data[ip_len..], src, dst);
        Ok(())
    }

    /// Opens a sealed segment in place. On success the plaintext sits where
    /// the ciphertext was and the trailing tag bytes are left in the window
    /// for the caller to truncate. Failure is a per-packet `Crypto` error.
    pub fn open(&self, pkt: &mut Packet) -> Result<()> {
        let (ip_len, tcp_len, nonce, aad, aad_len, _, _) = Self::dissect(pkt)?;

        let data = pkt.data_mut();
        let payload = &mut data[ip_len + tcp_len..];
        if payload.len() < TAG_SIZE {
            return Err(Error::Crypto);
        }

        if !crypto::open_in_place(payload, &aad[..aad_len], nonce, &self.key) {
            return Err(Error::Crypto);
        }

        Ok(())
    }

    /// Splits a full IP packet into header geometry, the record nonce and the
    /// additional data image.
    fn dissect(pkt: &Packet) -> Result<(usize, usize, u64, [u8; MAX_AAD], usize, std::net::Ipv4Addr, std::net::Ipv4Addr)> {
        let data = pkt.data();

        let ip = Ipv4View::new(data).ok_or(Error::Crypto)?;
        let ip_len = ip.header_len();
        let (src, dst) = (ip.src(), ip.dst());

        let segment = &data[ip_len..];
        let tcp = TcpView::new(segment).ok_or(Error::Crypto)?;
        let tcp_len = tcp.header_len();

        // SEQ occupies the low half so it lands first in the little-endian
        // nonce tail, ACK the high half.
        let nonce = (u64::from(tcp.ack()) << 32) | u64::from(tcp.seq());

        let mut aad = [0u8; MAX_AAD];
        let pseudo = tcpip::pseudo_header(src, dst, segment.len() as u16);
        aad[..tcpip::PSEUDO_HEADER_SIZE].copy_from_slice(&pseudo);

        let aad_len = tcpip::PSEUDO_HEADER_SIZE + tcp_len;
        aad[tcpip::PSEUDO_HEADER_SIZE..aad_len].copy_from_slice(&segment[..tcp_len]);
        // Zero the checksum field inside the AAD image; it is re-folded after
        // sealing and would otherwise never match.
        aad[tcpip::PSEUDO_HEADER_SIZE + 16] = 0;
        aad[tcpip::PSEUDO_HEADER_SIZE + 17] = 0;

        Ok((ip_len, tcp_len, nonce, aad, aad_len, src, dst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeTcp;
    use crate::tcpip::HEADERS_SIZE;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn addr(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    fn key() -> Key {
        [9u8; KEY_BYTES]
    }

    fn sealed_segment(payload: &[u8]) -> Packet {
        let mut fake = FakeTcp::new(addr(1, 1000), addr(2, 2000), 100, 200);
        let crypt = TcpCrypt::new(&key());

        let mut pkt = Packet::new(HEADERS_SIZE, 512);
        pkt.fill(payload);
        pkt.extend(TAG_SIZE);
        fake.attach_send(&mut pkt);
        crypt.seal(&mut pkt).unwrap();
        pkt
    }

    #[test]
    fn test_seal_expands_by_tag_and_keeps_checksums() {
        let pkt = sealed_segment(b"secret");

        let ip = Ipv4View::new(pkt.data()).unwrap();
        assert!(ip.checksum_ok());
        assert_eq!(ip.total_len(), HEADERS_SIZE + 6 + TAG_SIZE);

        let tcp = TcpView::new(&pkt.data()[ip.header_len()..]).unwrap();
        assert!(tcp.checksum_ok(ip.src(), ip.dst()));
        assert_ne!(&tcp.payload()[..6], b"secret");
    }

    #[test]
    fn test_open_restores_plaintext() {
        let mut pkt = sealed_segment(b"secret");
        let crypt = TcpCrypt::new(&key());

        crypt.open(&mut pkt).unwrap();

        let ip_len = Ipv4View::new(pkt.data()).unwrap().header_len();
        let tcp = TcpView::new(&pkt.data()[ip_len..]).unwrap();
        assert_eq!(&tcp.payload()[..6], b"secret");
    }

    #[test]
    fn test_open_rejects_ciphertext_tamper() {
        let mut pkt = sealed_segment(b"secret");
        let crypt = TcpCrypt::new(&key());

        let len = pkt.len();
        pkt.data_mut()[HEADERS_SIZE] ^= 1;
        // Keep the checksum valid so only the record layer can notice.
        let (src, dst) = {
            let ip = Ipv4View::new(pkt.data()).unwrap();
            (ip.src(), ip.dst())
        };
        tcpip::refresh_tcp_checksum(&mut pkt.data_mut()[tcpip::IPV4_HEADER_SIZE..len], src, dst);

        assert_eq!(crypt.open(&mut pkt), Err(Error::Crypto));
    }

    #[test]
    fn test_open_rejects_header_tamper() {
        let mut pkt = sealed_segment(b"secret");
        let crypt = TcpCrypt::new(&key());

        // Rewriting the SEQ changes both nonce and AAD; the record must die.
        let len = pkt.len();
        let segment = &mut pkt.data_mut()[tcpip::IPV4_HEADER_SIZE..len];
        segment[4] ^= 1;
        tcpip::refresh_tcp_checksum(segment, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2));

        assert_eq!(crypt.open(&mut pkt), Err(Error::Crypto));
    }

    #[test]
    fn test_open_rejects_wrong_key() {
        let mut pkt = sealed_segment(b"secret");
        let other = TcpCrypt::new(&[8u8; KEY_BYTES]);

        assert_eq!(other.open(&mut pkt), Err(Error::Crypto));
    }

    #[test]
    fn test_keys_expand_consistently() {
        let a = TcpCrypt::new(&key());
        let b = TcpCrypt::new(&key());

        let mut pkt = sealed_segment(b"cross");
        drop(a);
        b.open(&mut pkt).unwrap();
    }
}
