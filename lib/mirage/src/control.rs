//! Control plane: a thin request/response RPC riding the reserved session id.
//! One message per tunnel frame, length-delimited fields, lockstep calls with
//! a per-call timeout. The schema is fixed here; both peers must speak it.

use crate::error::{Error, Result, SessionError};
use crate::sconn::Conn;
use crate::session::{SessionId, CONTROL_SESSION};
use crate::tcpip;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};
use vapor::logging::{self, Logger};
use vapor::packet::Packet;
use vapor::shared::{Deserialize, Serialize, SizedRead, SizedWrite, WireError, WireResult};

const METHOD_IPV6: u8 = 1;
const METHOD_END_CONFIG: u8 = 2;
const METHOD_ADD_TCP: u8 = 3;
const METHOD_DEL_TCP: u8 = 4;
const METHOD_ADD_UDP: u8 = 5;
const METHOD_DEL_UDP: u8 = 6;
const METHOD_PACK_LOSS: u8 = 7;
const METHOD_PING: u8 = 8;

const STATUS_OK: u8 = 0;
const STATUS_ERR: u8 = 1;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Request {
    Ipv6,
    EndConfig,
    AddTcp(SocketAddrV4),
    DelTcp(SessionId),
    AddUdp(SocketAddrV4),
    DelUdp(SessionId),
    PackLoss,
    Ping,
}

impl Request {
    fn method(&self) -> u8 {
        match self {
            Request::Ipv6 => METHOD_IPV6,
            Request::EndConfig => METHOD_END_CONFIG,
            Request::AddTcp(_) => METHOD_ADD_TCP,
            Request::DelTcp(_) => METHOD_DEL_TCP,
            Request::AddUdp(_) => METHOD_ADD_UDP,
            Request::DelUdp(_) => METHOD_DEL_UDP,
            Request::PackLoss => METHOD_PACK_LOSS,
            Request::Ping => METHOD_PING,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ipv6(bool),
    EndConfig,
    AddSession(::std::result::Result<SessionId, String>),
    DelSession(::std::result::Result<(), String>),
    PackLoss(f32),
    Ping,
}

/// One request frame: method, call id, arguments.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Call {
    pub id: u32,
    pub request: Request,
}

/// One response frame: echoes the method and call id.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: u32,
    pub response: Response,
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

fn write_str<W: SizedWrite>(stream: &mut W, text: &str) -> WireResult<()> {
    let bytes = text.as_bytes();
    if bytes.len() > u16::max_value() as usize || stream.free_capacity() < 2 + bytes.len() {
        return Err(WireError::Truncated);
    }
    stream.write_u16::<BigEndian>(bytes.len() as u16)?;
    stream.write_all(bytes).map_err(Into::into)
}

fn read_str<R: SizedRead>(stream: &mut R) -> WireResult<String> {
    let len = stream.read_u16::<BigEndian>()? as usize;
    if stream.remaining_data() < len {
        return Err(WireError::Truncated);
    }
    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| WireError::Malformed)
}

impl Serialize for Call {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> WireResult<()> {
        if stream.free_capacity() < 11 {
            return Err(WireError::Truncated);
        }

        stream.write_u8(self.request.method())?;
        stream.write_u32::<BigEndian>(self.id)?;

        match &self.request {
            Request::AddTcp(addr) | Request::AddUdp(addr) => write_addr(stream, *addr),
            Request::DelTcp(id) | Request::DelUdp(id) => {
                stream.write_u16::<BigEndian>(*id).map_err(Into::into)
            }
            _ => Ok(()),
        }
    }
}

impl Deserialize for Call {
    fn deserialize<R: SizedRead>(stream: &mut R) -> WireResult<Self> {
        if stream.remaining_data() < 5 {
            return Err(WireError::Truncated);
        }

        let method = stream.read_u8()?;
        let id = stream.read_u32::<BigEndian>()?;

        let request = match method {
            METHOD_IPV6 => Request::Ipv6,
            METHOD_END_CONFIG => Request::EndConfig,
            METHOD_ADD_TCP => Request::AddTcp(read_addr(stream)?),
            METHOD_DEL_TCP => Request::DelTcp(stream.read_u16::<BigEndian>()?),
            METHOD_ADD_UDP => Request::AddUdp(read_addr(stream)?),
            METHOD_DEL_UDP => Request::DelUdp(stream.read_u16::<BigEndian>()?),
            METHOD_PACK_LOSS => Request::PackLoss,
            METHOD_PING => Request::Ping,
            _ => return Err(WireError::Malformed),
        };

        Ok(Call { id, request })
    }
}

impl Reply {
    fn method(&self) -> u8 {
        match &self.response {
            Response::Ipv6(_) => METHOD_IPV6,
            Response::EndConfig => METHOD_END_CONFIG,
            // Add/Del replies are matched to their call by id, the method byte
            // only selects the payload shape.
            Response::AddSession(_) => METHOD_ADD_TCP,
            Response::DelSession(_) => METHOD_DEL_TCP,
            Response::PackLoss(_) => METHOD_PACK_LOSS,
            Response::Ping => METHOD_PING,
        }
    }
}

impl Serialize for Reply {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> WireResult<()> {
        if stream.free_capacity() < 12 {
            return Err(WireError::Truncated);
        }

        stream.write_u8(self.method())?;
        stream.write_u32::<BigEndian>(self.id)?;

        match &self.response {
            Response::Ipv6(value) => {
                stream.write_u8(STATUS_OK)?;
                stream.write_u8(*value as u8).map_err(Into::into)
            }
            Response::EndConfig | Response::Ping => {
                stream.write_u8(STATUS_OK).map_err(Into::into)
            }
            Response::AddSession(Ok(id)) => {
                stream.write_u8(STATUS_OK)?;
                stream.write_u16::<BigEndian>(*id).map_err(Into::into)
            }
            Response::AddSession(Err(message)) => {
                stream.write_u8(STATUS_ERR)?;
                write_str(stream, message)
            }
            Response::DelSession(Ok(())) => stream.write_u8(STATUS_OK).map_err(Into::into),
            Response::DelSession(Err(message)) => {
                stream.write_u8(STATUS_ERR)?;
                write_str(stream, message)
            }
            Response::PackLoss(value) => {
                stream.write_u8(STATUS_OK)?;
                stream
                    .write_u32::<BigEndian>(value.to_bits())
                    .map_err(Into::into)
            }
        }
    }
}

impl Deserialize for Reply {
    fn deserialize<R: SizedRead>(stream: &mut R) -> WireResult<Self> {
        if stream.remaining_data() < 6 {
            return Err(WireError::Truncated);
        }

        let method = stream.read_u8()?;
        let id = stream.read_u32::<BigEndian>()?;
        let status = stream.read_u8()?;

        let response = match (method, status) {
            (METHOD_IPV6, STATUS_OK) => Response::Ipv6(stream.read_u8()? != 0),
            (METHOD_END_CONFIG, STATUS_OK) => Response::EndConfig,
            (METHOD_ADD_TCP, STATUS_OK) | (METHOD_ADD_UDP, STATUS_OK) => {
                Response::AddSession(Ok(stream.read_u16::<BigEndian>()?))
            }
            (METHOD_ADD_TCP, STATUS_ERR) | (METHOD_ADD_UDP, STATUS_ERR) => {
                Response::AddSession(Err(read_str(stream)?))
            }
            (METHOD_DEL_TCP, STATUS_OK) | (METHOD_DEL_UDP, STATUS_OK) => {
                Response::DelSession(Ok(()))
            }
            (METHOD_DEL_TCP, STATUS_ERR) | (METHOD_DEL_UDP, STATUS_ERR) => {
                Response::DelSession(Err(read_str(stream)?))
            }
            (METHOD_PACK_LOSS, STATUS_OK) => {
                Response::PackLoss(f32::from_bits(stream.read_u32::<BigEndian>()?))
            }
            (METHOD_PING, STATUS_OK) => Response::Ping,
            _ => return Err(WireError::Malformed),
        };

        Ok(Reply { id, response })
    }
}

/// Encodes a message into a ready-to-send frame payload.
fn into_frame<T: Serialize>(message: &T, mtu: usize) -> Result<Packet> {
    let mut pkt = Packet::new(tcpip::HEADERS_SIZE, mtu);
    pkt.reset(tcpip::HEADERS_SIZE);

    let mut cursor = Cursor::new(pkt.data_mut());
    message.serialize(&mut cursor)?;
    let len = cursor.position() as usize;

    pkt.truncate(len);
    Ok(pkt)
}

/// Client end of the control channel. Calls are serialized (one outstanding at
/// a time) and each waits for its echoed call id within the timeout.
pub struct Controller {
    conn: Arc<Conn>,
    inbox: Mutex<mpsc::Receiver<Vec<u8>>>,
    next_id: Mutex<u32>,
    timeout: Duration,
    log: Logger,
}

impl Controller {
    /// `inbox` receives the payload of every inbound session-0 frame; the
    /// downlink service owns the routing.
    pub fn new(
        conn: Arc<Conn>,
        inbox: mpsc::Receiver<Vec<u8>>,
        timeout: Duration,
        log: &Logger,
    ) -> Controller {
        Controller {
            conn,
            inbox: Mutex::new(inbox),
            next_id: Mutex::new(0),
            timeout,
            log: log.new(logging::o!("channel" => "control")),
        }
    }

    pub fn ipv6(&self) -> Result<bool> {
        match self.call(Request::Ipv6)? {
            Response::Ipv6(value) => Ok(value),
            response => Err(Self::mismatch(response)),
        }
    }

    pub fn end_config(&self) -> Result<()> {
        match self.call(Request::EndConfig)? {
            Response::EndConfig => Ok(()),
            response => Err(Self::mismatch(response)),
        }
    }

    pub fn add_tcp(&self, dst: SocketAddrV4) -> Result<SessionId> {
        self.add(Request::AddTcp(dst))
    }

    pub fn del_tcp(&self, id: SessionId) -> Result<()> {
        self.del(Request::DelTcp(id))
    }

    pub fn add_udp(&self, dst: SocketAddrV4) -> Result<SessionId> {
        self.add(Request::AddUdp(dst))
    }

    pub fn del_udp(&self, id: SessionId) -> Result<()> {
        self.del(Request::DelUdp(id))
    }

    pub fn pack_loss(&self) -> Result<f32> {
        match self.call(Request::PackLoss)? {
            Response::PackLoss(value) => Ok(value),
            response => Err(Self::mismatch(response)),
        }
    }

    pub fn ping(&self) -> Result<()> {
        match self.call(Request::Ping)? {
            Response::Ping => Ok(()),
            response => Err(Self::mismatch(response)),
        }
    }

    fn add(&self, request: Request) -> Result<SessionId> {
        match self.call(request)? {
            Response::AddSession(Ok(id)) => Ok(id),
            Response::AddSession(Err(message)) => Err(SessionError::Remote(message).into()),
            response => Err(Self::mismatch(response)),
        }
    }

    fn del(&self, request: Request) -> Result<()> {
        match self.call(request)? {
            Response::DelSession(Ok(())) => Ok(()),
            Response::DelSession(Err(message)) => Err(SessionError::Remote(message).into()),
            response => Err(Self::mismatch(response)),
        }
    }

    fn call(&self, request: Request) -> Result<Response> {
        // The id lock doubles as the lockstep guard: one call in flight.
        let mut next_id = self.next_id.lock().expect("Call lock poisoned");
        *next_id = next_id.wrapping_add(1);
        let id = *next_id;

        logging::trace!(self.log, "call"; "id" => id, "request" => ?request);

        let mut pkt = into_frame(&Call { id, request }, self.conn.mtu())?;
        self.conn.send(&mut pkt, CONTROL_SESSION)?;

        let inbox = self.inbox.lock().expect("Inbox poisoned");
        let deadline = Instant::now() + self.timeout;

        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(Error::Io(std::io::ErrorKind::TimedOut))?;

            let frame = match inbox.recv_timeout(remaining) {
                Ok(frame) => frame,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    return Err(Error::Io(std::io::ErrorKind::TimedOut));
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(Error::Closed),
            };

            let reply = match Reply::deserialize(&mut Cursor::new(&frame[..])) {
                Ok(reply) => reply,
                Err(err) => {
                    logging::warn!(self.log, "undecodable control frame"; "cause" => ?err);
                    continue;
                }
            };

            if reply.id != id {
                // Stale answer from an abandoned call.
                continue;
            }

            logging::trace!(self.log, "reply"; "id" => id, "response" => ?reply.response);
            return Ok(reply.response);
        }
    }

    fn mismatch(_response: Response) -> Error {
        Error::Io(std::io::ErrorKind::InvalidData)
    }
}

/// Server-side method surface behind the control channel.
pub trait Handler: Send + Sync {
    fn ipv6(&self) -> bool;
    fn end_config(&self);
    fn add_tcp(&self, dst: SocketAddrV4) -> Result<SessionId>;
    fn del_tcp(&self, id: SessionId) -> Result<()>;
    fn add_udp(&self, dst: SocketAddrV4) -> Result<SessionId>;
    fn del_udp(&self, id: SessionId) -> Result<()>;
    fn pack_loss(&self) -> f32;
    fn ping(&self);
}

/// Decodes one inbound session-0 frame, dispatches it and sends the reply.
/// Decode failures are tolerated errors; send failures are the connection's.
pub fn serve_frame(handler: &dyn Handler, conn: &Conn, frame: &[u8]) -> Result<()> {
    let call = Call::deserialize(&mut Cursor::new(frame))?;

    let response = match call.request {
        Request::Ipv6 => Response::Ipv6(handler.ipv6()),
        Request::EndConfig => {
            handler.end_config();
            Response::EndConfig
        }
        Request::AddTcp(dst) => {
            Response::AddSession(handler.add_tcp(dst).map_err(|err| err.to_string()))
        }
        Request::DelTcp(id) => {
            Response::DelSession(handler.del_tcp(id).map_err(|err| err.to_string()))
        }
        Request::AddUdp(dst) => {
            Response::AddSession(handler.add_udp(dst).map_err(|err| err.to_string()))
        }
        Request::DelUdp(id) => {
            Response::DelSession(handler.del_udp(id).map_err(|err| err.to_string()))
        }
        Request::PackLoss => Response::PackLoss(handler.pack_loss()),
        Request::Ping => {
            handler.ping();
            Response::Ping
        }
    };

    let mut pkt = into_frame(&Reply { id: call.id, response }, conn.mtu())?;
    conn.send(&mut pkt, CONTROL_SESSION)
}
