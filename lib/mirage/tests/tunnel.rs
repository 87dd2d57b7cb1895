//! Full-tunnel scenarios: a `Client` and a `Server` wired over the in-memory
//! raw channel, with mock capture handles on the client and echo transports on
//! the proxy side.

use mirage::capture::{Capture, MockCapture};
use mirage::client::Client;
use mirage::error::{Error, SessionError};
use mirage::raw::{MemRaw, Raw};
use mirage::sconn::{Config, Conn};
use mirage::server::{EchoDialer, Server};
use mirage::session::{Proto, Session};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use vapor::logging;

const MTU: usize = 1536;

fn caddr() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 36000)
}

fn saddr() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 19986)
}

fn flow(port: u16) -> Session {
    Session {
        src: SocketAddrV4::new(*caddr().ip(), port),
        proto: Proto::Tcp,
        dst: SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 80),
    }
}

fn tunnel(cfg: Config) -> (Arc<Client>, Arc<Server>) {
    let (a, b) = MemRaw::pair(caddr(), saddr(), MTU);
    let (a, b) = (Arc::new(a) as Arc<dyn Raw>, Arc::new(b) as Arc<dyn Raw>);

    let server_conn = {
        let cfg = cfg.clone();
        thread::spawn(move || Conn::accept(b, &cfg, &logging::discard()))
    };
    let client_conn = Conn::connect(a, &cfg, &logging::discard()).unwrap();
    let server_conn = server_conn.join().unwrap().unwrap();

    let server = Server::serve(
        Arc::new(server_conn),
        Box::new(EchoDialer),
        &cfg,
        &logging::discard(),
    );
    let client = Client::dial(Arc::new(client_conn), &cfg, &logging::discard());

    (client, server)
}

fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn end_to_end_echo_through_the_proxy() {
    let (client, server) = tunnel(Config::default());
    client.end_config().unwrap();

    let capture = Arc::new(MockCapture::new(flow(40001)));
    client.add_session(capture.clone()).unwrap();
    assert_eq!(server.live(), 1);

    // Captured packets travel client -> proxy -> echo -> proxy -> client and
    // come back out of the injector unchanged and in order.
    for i in 0..10u8 {
        capture.push(&[0x45, 0, 0, i]);
    }
    for i in 0..10u8 {
        let injected = capture.injected(Duration::from_secs(2)).expect("echo reply");
        assert_eq!(injected, vec![0x45, 0, 0, i]);
    }
}

#[test]
fn sessions_are_isolated_by_id() {
    let (client, _server) = tunnel(Config::default());
    client.end_config().unwrap();

    let one = Arc::new(MockCapture::new(flow(40001)));
    let two = Arc::new(MockCapture::new(flow(40002)));
    client.add_session(one.clone()).unwrap();
    client.add_session(two.clone()).unwrap();

    one.push(b"from-one");
    two.push(b"from-two");

    assert_eq!(one.injected(Duration::from_secs(2)).unwrap(), b"from-one");
    assert_eq!(two.injected(Duration::from_secs(2)).unwrap(), b"from-two");
}

#[test]
fn scenario_duplicate_descriptor_refused_until_deleted() {
    let (_client, server) = tunnel(Config::default());

    let desc = Session {
        src: caddr(),
        proto: Proto::Tcp,
        dst: SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 80),
    };

    let id = server.add(desc).unwrap();
    assert_eq!(id, 1);

    assert_eq!(
        server.add(desc).unwrap_err(),
        Error::Session(SessionError::DuplicateDescriptor)
    );

    server.del(id).unwrap();
    server.del(id).unwrap();
    assert!(server.add(desc).is_ok());
}

#[test]
fn scenario_proxy_self_is_refused() {
    let (client, server) = tunnel(Config::default());
    client.end_config().unwrap();

    let own = Session {
        src: caddr(),
        proto: Proto::Tcp,
        dst: saddr(),
    };
    let capture = Arc::new(MockCapture::new(own));

    assert_eq!(
        client.add_session(capture).unwrap_err(),
        Error::Session(SessionError::ProxySelf)
    );
    assert_eq!(client.live(), 0);
    assert_eq!(server.live(), 0);
}

#[test]
fn keepalive_reaps_idle_sessions_only() {
    let period = Duration::from_millis(80);
    let (client, server) = tunnel(Config {
        keepalive_period: period,
        ..Config::default()
    });
    client.end_config().unwrap();

    let busy = Arc::new(MockCapture::new(flow(40001)));
    let idle = Arc::new(MockCapture::new(flow(40002)));
    client.add_session(busy.clone()).unwrap();
    client.add_session(idle.clone()).unwrap();
    assert_eq!(server.live(), 2);

    // One traffic event per period keeps the busy session alive through every
    // scan; the idle one dies after two quiet ticks. Traffic keeps flowing
    // while we wait so the busy session never goes quiet itself.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut idle_reaped = false;
    while Instant::now() < deadline {
        busy.push(b"tick");
        assert!(busy.injected(Duration::from_secs(2)).is_some());
        thread::sleep(period / 2);

        if client.live() == 1 && server.live() == 1 {
            idle_reaped = true;
            break;
        }
    }

    assert!(idle_reaped);
    busy.push(b"still here");
    assert!(busy.injected(Duration::from_secs(2)).is_some());
}

#[test]
fn control_surface_answers() {
    let (client, _server) = tunnel(Config::default());

    assert_eq!(client.control().ipv6().unwrap(), false);
    assert_eq!(client.control().pack_loss().unwrap(), 0.0);
    client.control().ping().unwrap();
    client.end_config().unwrap();
}

#[test]
fn deleting_a_session_stops_its_flow() {
    let (client, server) = tunnel(Config::default());
    client.end_config().unwrap();

    let capture = Arc::new(MockCapture::new(flow(40001)));
    let id = client.add_session(capture.clone()).unwrap();

    capture.push(b"alive");
    assert!(capture.injected(Duration::from_secs(2)).is_some());

    client.del_session(id).unwrap();
    assert_eq!(client.live(), 0);
    assert!(wait_until(|| server.live() == 0, Duration::from_secs(2)));

    client.del_session(id).unwrap();
}

#[test]
fn client_close_cascades() {
    let (client, server) = tunnel(Config::default());
    client.end_config().unwrap();

    let capture = Arc::new(MockCapture::new(flow(40001)));
    let id = client.add_session(capture.clone()).unwrap();

    let cause = client.close(Error::Closed);
    assert_eq!(cause, Error::Closed);
    assert_eq!(client.close(Error::Crypto), Error::Closed);

    assert!(client.conn().is_closed());
    assert_eq!(client.live(), 0);
    assert_eq!(
        client.add_session(Arc::new(MockCapture::new(flow(40002)))).unwrap_err(),
        Error::Closed
    );

    // The capture handle was released with its session.
    let mut pkt = vapor::packet::Packet::new(0, 64);
    pkt.fill(b"x");
    assert_eq!(capture.inject(&pkt), Err(Error::Closed));

    // A silent peer is indistinguishable from an idle one on this wire; the
    // server's entry for the session is reclaimed by its keepalive, not here.
    drop((server, id));
}
