//! The scripted opening exchange. PrevPackets let the operator make the first
//! bytes on the wire look like any application protocol they choose; the key
//! exchange that follows agrees on the record-layer key. Everything here runs
//! over the userspace endpoint's byte stream, before the handover.

use crate::crypt::{Key, KEY_BYTES};
use crate::error::{HandshakeError, Result};
use crate::ustack::Stream;
use byteorder::{BigEndian, ByteOrder};
use std::sync::Arc;

/// Maps opaque sign material to a key. Returns None when the material does not
/// validate.
pub type KeyParser = Arc<dyn Fn(&[u8]) -> Option<Key> + Send + Sync>;

/// Validates a token and derives its key, or explains the refusal. Both peers
/// run the same derivation, so a valid token yields the same key on each side.
pub type KeyValidator = Arc<dyn Fn(&[u8]) -> ::std::result::Result<Key, String> + Send + Sync>;

#[derive(Clone)]
pub enum KeyExchange {
    /// Both sides exchange zero keys and the record layer stays disabled.
    /// Exists for test harnesses only.
    None,
    /// Client sends opaque sign material; the server validates it silently.
    Sign { sign: Vec<u8>, parser: KeyParser },
    /// Client sends a token; the server answers with an empty string on
    /// success or a refusal message.
    Token { token: Vec<u8>, validator: KeyValidator },
}

pub(crate) fn run_client(
    stream: &mut Stream,
    prev_packets: &[Vec<u8>],
    key_exchange: &KeyExchange,
) -> Result<Option<Key>> {
    // Even indices are ours to send, odd ones the server's to be checked.
    for (index, blob) in prev_packets.iter().enumerate() {
        if index % 2 == 0 {
            stream.write_all(blob)?;
        } else {
            expect_blob(stream, index, blob)?;
        }
    }

    match key_exchange {
        KeyExchange::None => {
            stream.write_all(&[0u8; KEY_BYTES])?;
            read_zero_key(stream)?;
            Ok(None)
        }
        KeyExchange::Sign { sign, parser } => {
            let key = parser(sign).ok_or(HandshakeError::BadSign)?;
            write_blob(stream, sign)?;
            Ok(Some(key))
        }
        KeyExchange::Token { token, validator } => {
            let key = validator(token).map_err(|_| HandshakeError::BadSign)?;
            write_blob(stream, token)?;

            let response = read_blob(stream)?;
            if !response.is_empty() {
                let message = String::from_utf8_lossy(&response).into_owned();
                return Err(HandshakeError::Rejected(message).into());
            }
            Ok(Some(key))
        }
    }
}

pub(crate) fn run_server(
    stream: &mut Stream,
    prev_packets: &[Vec<u8>],
    key_exchange: &KeyExchange,
) -> Result<Option<Key>> {
    for (index, blob) in prev_packets.iter().enumerate() {
        if index % 2 == 0 {
            expect_blob(stream, index, blob)?;
        } else {
            stream.write_all(blob)?;
        }
    }

    match key_exchange {
        KeyExchange::None => {
            read_zero_key(stream)?;
            stream.write_all(&[0u8; KEY_BYTES])?;
            Ok(None)
        }
        KeyExchange::Sign { parser, .. } => {
            let sign = read_blob(stream)?;
            let key = parser(&sign).ok_or(HandshakeError::BadSign)?;
            Ok(Some(key))
        }
        KeyExchange::Token { validator, .. } => {
            let token = read_blob(stream)?;
            match validator(&token) {
                Ok(key) => {
                    write_blob(stream, b"")?;
                    Ok(Some(key))
                }
                Err(message) => {
                    write_blob(stream, message.as_bytes())?;
                    Err(HandshakeError::Rejected(message).into())
                }
            }
        }
    }
}

/// Reads the peer's scripted bytes at `index` and fails the handshake on any
/// deviation.
fn expect_blob(stream: &mut Stream, index: usize, expected: &[u8]) -> Result<()> {
    let mut buf = vec![0u8; expected.len()];
    stream.read_exact(&mut buf)?;

    if buf != expected {
        return Err(HandshakeError::PrevPacketInvalid(index).into());
    }
    Ok(())
}

fn read_zero_key(stream: &mut Stream) -> Result<()> {
    let mut key = [0u8; KEY_BYTES];
    stream.read_exact(&mut key)?;

    if key != [0u8; KEY_BYTES] {
        return Err(HandshakeError::BadSign.into());
    }
    Ok(())
}

fn write_blob(stream: &mut Stream, data: &[u8]) -> Result<()> {
    assert!(data.len() <= u16::max_value() as usize, "Key material too large");

    let mut prefix = [0u8; 2];
    BigEndian::write_u16(&mut prefix, data.len() as u16);
    stream.write_all(&prefix)?;
    if !data.is_empty() {
        stream.write_all(data)?;
    }
    Ok(())
}

fn read_blob(stream: &mut Stream) -> Result<Vec<u8>> {
    let mut prefix = [0u8; 2];
    stream.read_exact(&mut prefix)?;

    let mut data = vec![0u8; BigEndian::read_u16(&prefix) as usize];
    if !data.is_empty() {
        stream.read_exact(&mut data)?;
    }
    Ok(data)
}
