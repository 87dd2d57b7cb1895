//! Session identity: the 16-bit id space shared with the peer, the flow
//! descriptor behind each id, and the activity counter that drives keepalive
//! expiry.

use crate::error::{SessionError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};
use vapor::shared::{Deserialize, Serialize, SizedRead, SizedWrite, WireError, WireResult};

pub type SessionId = u16;

/// Reserved for the control channel; never allocated to a flow.
pub const CONTROL_SESSION: SessionId = 0;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Proto {
    Tcp = 6,
    Udp = 17,
}

impl Proto {
    #[inline]
    pub fn number(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn from_number(number: u8) -> Option<Proto> {
        match number {
            6 => Some(Proto::Tcp),
            17 => Some(Proto::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Proto::Tcp => write!(f, "tcp"),
            Proto::Udp => write!(f, "udp"),
        }
    }
}

/// One proxied end-to-end flow. Equality is structural; two live sessions may
/// never share a descriptor.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Session {
    pub src: SocketAddrV4,
    pub proto: Proto,
    pub dst: SocketAddrV4,
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}->{}", self.proto, self.src, self.dst)
    }
}

fn write_addr<W: SizedWrite>(stream: &mut W, addr: SocketAddrV4) -> WireResult<()> {
    stream.write_all(&addr.ip().octets())?;
    stream.write_u16::<BigEndian>(addr.port()).map_err(Into::into)
}

fn read_addr<R: SizedRead>(stream: &mut R) -> WireResult<SocketAddrV4> {
    let mut octets = [0u8; 4];
    stream.read_exact(&mut octets)?;
    let port = stream.read_u16::<BigEndian>()?;
    Ok(SocketAddrV4::new(Ipv4Addr::from(octets), port))
}

impl Serialize for Session {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> WireResult<()> {
        if stream.free_capacity() < 13 {
            return Err(WireError::Truncated);
        }
        write_addr(stream, self.src)?;
        stream.write_u8(self.proto.number())?;
        write_addr(stream, self.dst)
    }
}

impl Deserialize for Session {
    fn deserialize<R: SizedRead>(stream: &mut R) -> WireResult<Self> {
        if stream.remaining_data() < 13 {
            return Err(WireError::Truncated);
        }
        let src = read_addr(stream)?;
        let proto = Proto::from_number(stream.read_u8()?).ok_or(WireError::Malformed)?;
        let dst = read_addr(stream)?;
        Ok(Session { src, proto, dst })
    }
}

/// Monotonic id allocator. Skips the control id and anything still live;
/// wraps, so an id is only reused after its previous owner was torn down.
pub(crate) struct IdAlloc {
    next: SessionId,
}

impl IdAlloc {
    #[inline]
    pub fn new() -> IdAlloc {
        IdAlloc { next: 1 }
    }

    pub fn alloc<F: Fn(SessionId) -> bool>(&mut self, live: F) -> Result<SessionId> {
        for _ in 0..u16::max_value() {
            let id = self.next;
            self.next = match self.next.checked_add(1) {
                Some(next) => next,
                None => 1,
            };

            if id != CONTROL_SESSION && !live(id) {
                return Ok(id);
            }
        }

        Err(SessionError::Exhausted.into())
    }
}

/// At tick time the counter either still holds the sentinel (no traffic since
/// the previous tick, session expired) or was bumped past it and gets reset.
pub(crate) const KEEPALIVE_SENTINEL: u32 = 0x23df_83a0;

pub(crate) struct Activity(AtomicU32);

impl Activity {
    #[inline]
    pub fn new() -> Activity {
        Activity(AtomicU32::new(0))
    }

    /// Records traffic on the session.
    #[inline]
    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// One keepalive tick. Returns true when the session expired.
    #[inline]
    pub fn tick(&self) -> bool {
        if self.0.load(Ordering::Relaxed) == KEEPALIVE_SENTINEL {
            true
        } else {
            self.0.store(KEEPALIVE_SENTINEL, Ordering::Relaxed);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn descriptor(port: u16) -> Session {
        Session {
            src: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), port),
            proto: Proto::Tcp,
            dst: SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 80),
        }
    }

    #[test]
    fn test_descriptor_wire_roundtrip() {
        let mut buf = [0u8; 13];
        descriptor(5555)
            .serialize(&mut Cursor::new(&mut buf[..]))
            .unwrap();

        let restored = Session::deserialize(&mut Cursor::new(&buf[..])).unwrap();
        assert_eq!(restored, descriptor(5555));
    }

    #[test]
    fn test_descriptor_rejects_unknown_proto() {
        let mut buf = [0u8; 13];
        descriptor(5555)
            .serialize(&mut Cursor::new(&mut buf[..]))
            .unwrap();
        buf[6] = 99;

        assert_eq!(
            Session::deserialize(&mut Cursor::new(&buf[..])).unwrap_err(),
            WireError::Malformed
        );
    }

    #[test]
    fn test_alloc_skips_control_and_live_ids() {
        let mut alloc = IdAlloc::new();

        assert_eq!(alloc.alloc(|_| false).unwrap(), 1);
        assert_eq!(alloc.alloc(|id| id == 2).unwrap(), 3);
    }

    #[test]
    fn test_alloc_wraps_without_yielding_zero() {
        let mut alloc = IdAlloc { next: u16::max_value() };

        assert_eq!(alloc.alloc(|_| false).unwrap(), u16::max_value());
        assert_eq!(alloc.alloc(|_| false).unwrap(), 1);
    }

    #[test]
    fn test_alloc_exhaustion() {
        let mut alloc = IdAlloc::new();
        assert_eq!(
            alloc.alloc(|_| true).unwrap_err(),
            crate::error::Error::Session(SessionError::Exhausted)
        );
    }

    #[test]
    fn test_activity_expiry_needs_two_quiet_ticks() {
        let activity = Activity::new();

        // First tick arms the sentinel, second one expires the session.
        assert!(!activity.tick());
        assert!(activity.tick());
    }

    #[test]
    fn test_activity_traffic_defers_expiry() {
        let activity = Activity::new();

        assert!(!activity.tick());
        activity.bump();
        assert!(!activity.tick());
        assert!(activity.tick());
    }
}
