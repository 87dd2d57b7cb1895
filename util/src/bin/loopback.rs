//! In-process smoke run: client and proxy over the in-memory raw channel,
//! one captured packet through the echo transport and back.

use mirage::capture::MockCapture;
use mirage::client::Client;
use mirage::error::Error;
use mirage::raw::{MemRaw, Raw};
use mirage::sconn::{Config, Conn};
use mirage::server::{EchoDialer, Server};
use mirage::session::{Proto, Session};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use vapor::logging;

fn main() {
    let log = logging::init();

    let caddr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 36000);
    let saddr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 19986);

    let cfg = Config {
        prev_packets: vec![b"GET / HTTP/1.1\r\n".to_vec(), b"HTTP/1.1 200 OK\r\n".to_vec()],
        ..Config::default()
    };

    let (a, b) = MemRaw::pair(caddr, saddr, cfg.mtu);
    let (a, b) = (Arc::new(a) as Arc<dyn Raw>, Arc::new(b) as Arc<dyn Raw>);

    let server_conn = {
        let cfg = cfg.clone();
        let log = log.clone();
        thread::spawn(move || Conn::accept(b, &cfg, &log))
    };
    let client_conn = Conn::connect(a, &cfg, &log).expect("client handshake");
    let server_conn = server_conn.join().unwrap().expect("server handshake");

    let _server = Server::serve(Arc::new(server_conn), Box::new(EchoDialer), &cfg, &log);
    let client = Client::dial(Arc::new(client_conn), &cfg, &log);
    client.end_config().expect("end config");

    let capture = Arc::new(MockCapture::new(Session {
        src: SocketAddrV4::new(*caddr.ip(), 40001),
        proto: Proto::Tcp,
        dst: SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 80),
    }));
    client.add_session(capture.clone()).expect("add session");

    capture.push(b"probe packet");
    let echoed = capture
        .injected(Duration::from_secs(5))
        .expect("echo through the tunnel");

    logging::info!(log, "loopback complete"; "echoed" => ?echoed);
    client.close(Error::Closed);
}
