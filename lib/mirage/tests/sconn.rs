//! Connection-level end-to-end scenarios over the in-memory raw channel:
//! scripted handshakes, key agreement, wire shape of the masqueraded stream,
//! and the poisoning behavior of the receive-error budget.

use mirage::crypt::Key;
use mirage::error::{Error, HandshakeError};
use mirage::handshake::{KeyExchange, KeyParser};
use mirage::raw::{MemRaw, Raw};
use mirage::sconn::{Config, Conn};
use mirage::server::{EchoDialer, Server};
use mirage::tcpip;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use vapor::logging;
use vapor::packet::Packet;

const MTU: usize = 1536;

fn caddr() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 36000)
}

fn saddr() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 19986)
}

fn script(blobs: &[&[u8]]) -> Vec<Vec<u8>> {
    blobs.iter().map(|blob| blob.to_vec()).collect()
}

fn connect_pair(client_cfg: Config, server_cfg: Config) -> (Conn, Conn) {
    let (a, b) = MemRaw::pair(caddr(), saddr(), MTU);
    let (a, b) = (Arc::new(a) as Arc<dyn Raw>, Arc::new(b) as Arc<dyn Raw>);

    let server = thread::spawn(move || Conn::accept(b, &server_cfg, &logging::discard()));
    let client = Conn::connect(a, &client_cfg, &logging::discard()).unwrap();
    (client, server.join().unwrap().unwrap())
}

fn payload_packet(payload: &[u8]) -> Packet {
    let mut pkt = Packet::new(tcpip::HEADERS_SIZE, MTU);
    pkt.fill(payload);
    pkt
}

fn recv_packet() -> Packet {
    let mut pkt = Packet::new(0, MTU);
    pkt.reset(0);
    pkt
}

#[test]
fn scenario_prev_packets_then_frame() {
    let cfg = || Config {
        prev_packets: script(&[b"hello", b"world"]),
        ..Config::default()
    };
    let (client, server) = connect_pair(cfg(), cfg());

    let mut pkt = payload_packet(b"PING");
    client.send(&mut pkt, 7).unwrap();

    let mut recv = recv_packet();
    let id = server.recv(&mut recv).unwrap();

    assert_eq!(id, 7);
    assert_eq!(recv.data(), b"PING");
}

#[test]
fn scenario_prev_packet_mismatch_closes_both_ends() {
    let client_cfg = Config {
        prev_packets: script(&[b"hello", b"world"]),
        handshake_timeout: Duration::from_secs(5),
        ..Config::default()
    };
    let server_cfg = Config {
        prev_packets: script(&[b"hello", b"wolrd"]),
        handshake_timeout: Duration::from_secs(5),
        ..Config::default()
    };

    let (a, b) = MemRaw::pair(caddr(), saddr(), MTU);
    let (a, b) = (Arc::new(a), Arc::new(b));
    let b_handle = b.clone();

    let server = {
        let b = b.clone();
        thread::spawn(move || Conn::accept(b as Arc<dyn Raw>, &server_cfg, &logging::discard()))
    };

    let started = Instant::now();
    let client_err = Conn::connect(a as Arc<dyn Raw>, &client_cfg, &logging::discard()).unwrap_err();
    assert_eq!(
        client_err,
        Error::Handshake(HandshakeError::PrevPacketInvalid(1))
    );
    assert!(started.elapsed() < Duration::from_secs(30));

    // The client end is gone; the server's wait for key material can only end
    // in failure. Shut its channel so the test need not sit out the timeout.
    b_handle.shutdown();
    assert!(server.join().unwrap().is_err());
}

fn fixed_key_parser() -> (Key, KeyParser) {
    let key: Key = [0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
    (key, Arc::new(move |_sign: &[u8]| Some(key)))
}

/// Wires two raw pairs through a middlebox that records the uplink direction,
/// giving tests a passive on-path observer.
fn tapped_pair() -> (Arc<MemRaw>, Arc<MemRaw>, Arc<Mutex<Vec<Vec<u8>>>>) {
    let (a, m_client) = MemRaw::pair(caddr(), saddr(), MTU);
    let (m_server, b) = MemRaw::pair(caddr(), saddr(), MTU);

    let (m_client, m_server) = (Arc::new(m_client), Arc::new(m_server));
    let log = Arc::new(Mutex::new(Vec::new()));

    {
        let (m_client, m_server, log) = (m_client.clone(), m_server.clone(), log.clone());
        thread::spawn(move || {
            let mut pkt = recv_packet();
            loop {
                pkt.reset(0);
                if m_client.recv(&mut pkt).is_err() {
                    return;
                }
                log.lock().unwrap().push(pkt.data().to_vec());
                if m_server.send(&pkt).is_err() {
                    return;
                }
            }
        });
    }
    {
        let (m_client, m_server) = (m_client.clone(), m_server.clone());
        thread::spawn(move || {
            let mut pkt = recv_packet();
            loop {
                pkt.reset(0);
                if m_server.recv(&mut pkt).is_err() {
                    return;
                }
                if m_client.send(&pkt).is_err() {
                    return;
                }
            }
        });
    }

    (Arc::new(a), Arc::new(b), log)
}

struct Segment {
    seq: u32,
    flags: u8,
    payload_len: usize,
}

fn dissect(packet: &[u8]) -> Segment {
    let ip = tcpip::Ipv4View::new(packet).expect("IP header");
    let tcp = tcpip::TcpView::new(&packet[ip.header_len()..ip.total_len()]).expect("TCP header");
    Segment {
        seq: tcp.seq(),
        flags: tcp.flags(),
        payload_len: tcp.payload().len(),
    }
}

#[test]
fn scenario_sign_exchange_and_wire_shape() {
    let (_key, parser) = fixed_key_parser();
    let kex = |sign: &[u8]| KeyExchange::Sign {
        sign: sign.to_vec(),
        parser: parser.clone(),
    };

    let client_cfg = Config {
        key_exchange: kex(b"0123456789abcdef"),
        ..Config::default()
    };
    let server_cfg = Config {
        key_exchange: kex(b""),
        ..Config::default()
    };

    let (a, b, log) = tapped_pair();
    let server = thread::spawn(move || Conn::accept(b as Arc<dyn Raw>, &server_cfg, &logging::discard()));
    let client = Conn::connect(a as Arc<dyn Raw>, &client_cfg, &logging::discard()).unwrap();
    let server = server.join().unwrap().unwrap();

    // Frame overhead under an agreed key: 2 byte session id + 16 byte tag.
    assert_eq!(client.overhead(), 18);

    for payload in &[&b"A"[..], &b"BB"[..], &b"CCC"[..]] {
        let mut pkt = payload_packet(payload);
        client.send(&mut pkt, 1).unwrap();

        let mut recv = recv_packet();
        assert_eq!(server.recv(&mut recv).unwrap(), 1);
        assert_eq!(&recv.data(), payload);
    }

    let trace = log.lock().unwrap();
    let segments: Vec<Segment> = trace.iter().map(|raw| dissect(raw)).collect();

    // The first frame carries ciphertext of 1 + 2 + 16 = 19 bytes...
    let first_frame = segments
        .iter()
        .position(|seg| seg.payload_len == 19)
        .expect("first tunnel frame on the wire");

    // ...and continues the handshake's sequence space without a gap: its SEQ
    // equals the userspace endpoint's final SND.NXT.
    let snd_nxt = segments[..first_frame]
        .iter()
        .map(|seg| {
            let syn = u32::from(seg.flags & tcpip::FLAG_SYN != 0);
            seg.seq.wrapping_add(seg.payload_len as u32).wrapping_add(syn)
        })
        .max()
        .expect("handshake segments precede the first frame");
    assert_eq!(segments[first_frame].seq, snd_nxt);

    // From there the wire is a plausible one-way TCP stream: ACK always set,
    // no SYN/FIN/RST, strictly increasing SEQ.
    let frames = &segments[first_frame..];
    assert_eq!(frames.len(), 3);
    for window in frames.windows(2) {
        assert!(tcpip::seq_lt(window[0].seq, window[1].seq));
    }
    for seg in frames {
        assert_eq!(seg.flags & tcpip::FLAG_ACK, tcpip::FLAG_ACK);
        assert_eq!(
            seg.flags & (tcpip::FLAG_SYN | tcpip::FLAG_FIN | tcpip::FLAG_RST),
            0
        );
        assert!(seg.payload_len > 0);
    }
}

#[test]
fn scenario_corruption_budget_poisons_the_conn() {
    let (_key, parser) = fixed_key_parser();
    let kex = KeyExchange::Sign {
        sign: b"0123456789abcdef".to_vec(),
        parser,
    };

    let client_cfg = Config {
        key_exchange: kex.clone(),
        ..Config::default()
    };
    let server_cfg = Config {
        key_exchange: kex,
        max_recv_err: 8,
        keepalive_period: Duration::from_secs(60),
        ..Config::default()
    };

    let (a, b) = MemRaw::pair(caddr(), saddr(), MTU);
    let (a, b) = (Arc::new(a), Arc::new(b));
    let a_wire = a.clone();

    let server = {
        let b = b.clone();
        thread::spawn(move || Conn::accept(b as Arc<dyn Raw>, &server_cfg, &logging::discard()))
    };
    let client = Conn::connect(a as Arc<dyn Raw>, &client_cfg, &logging::discard()).unwrap();
    let server = Arc::new(server.join().unwrap().unwrap());

    let proxy = Server::serve(
        server.clone(),
        Box::new(EchoDialer),
        &Config {
            max_recv_err: 8,
            ..Config::default()
        },
        &logging::discard(),
    );

    // Eight consecutive well-formed segments whose ciphertext never opens.
    for i in 0..8u32 {
        let mut pkt = payload_packet(&[0xau8; 32]);
        pkt.unstrip(tcpip::TCP_HEADER_SIZE);
        let len = pkt.len();
        tcpip::write_tcp(
            &mut pkt.data_mut()[..len],
            caddr(),
            saddr(),
            0x10_0000 + i * 32,
            1,
            tcpip::FLAG_ACK,
        );
        pkt.unstrip(tcpip::IPV4_HEADER_SIZE);
        tcpip::write_ipv4(pkt.data_mut(), caddr(), saddr());
        a_wire.send(&pkt).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while !proxy.is_closed() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }

    assert!(proxy.is_closed());
    assert_eq!(server.close(), Error::Crypto);
    drop(client);
}

#[test]
fn close_returns_the_same_cause_every_time() {
    let (client, server) = connect_pair(Config::default(), Config::default());

    let first = client.close();
    for _ in 0..4 {
        assert_eq!(client.close(), first);
        assert_eq!(client.close_with(Error::Crypto), first);
    }

    let mut pkt = payload_packet(b"late");
    assert_eq!(client.send(&mut pkt, 3), Err(first.clone()));

    let mut recv = recv_packet();
    assert_eq!(client.recv(&mut recv), Err(first));
    drop(server);
}

#[test]
fn frames_preserve_per_sender_order() {
    let (client, server) = connect_pair(Config::default(), Config::default());
    let client = Arc::new(client);

    let mut writers = Vec::new();
    for session in 1..=3u16 {
        let client = client.clone();
        writers.push(thread::spawn(move || {
            for i in 0..20u8 {
                let mut pkt = payload_packet(&[session as u8, i]);
                client.send(&mut pkt, session).unwrap();
            }
        }));
    }

    let mut last_seen = [0u8; 4];
    let mut counts = [0usize; 4];
    for _ in 0..60 {
        let mut recv = recv_packet();
        let id = server.recv(&mut recv).unwrap() as usize;
        let i = recv.data()[1];

        // Per session, payloads arrive in submission order.
        if counts[id] > 0 {
            assert!(i > last_seen[id]);
        }
        last_seen[id] = i;
        counts[id] += 1;
    }

    assert_eq!(counts[1..].iter().sum::<usize>(), 60);
    for writer in writers {
        writer.join().unwrap();
    }
}
