#![cfg_attr(not(target_os = "linux"), allow(dead_code, unused_imports))]

use clap::{App, Arg};
use serde_derive::Deserialize;
use std::fs;
use vapor::encoding::base64;
use vapor::logging;

#[derive(Deserialize)]
struct ProxyConfig {
    /// Listen address, `<ip>:<port>`.
    listen: String,
    /// Base64 handshake script; even indices are the client's packets.
    #[serde(default)]
    prev_packets: Vec<String>,
    /// Base64 16-byte shared key. Clients must present exactly this material;
    /// omitted means the record layer stays disabled (testing only).
    #[serde(default)]
    key: Option<String>,
    #[serde(default = "default_mtu")]
    mtu: usize,
}

fn default_mtu() -> usize {
    1500
}

#[cfg(target_os = "linux")]
fn main() {
    use mirage::handshake::KeyExchange;
    use mirage::raw::{Raw, RawListener};
    use mirage::sconn::{Config, Conn};
    use mirage::server::{RawDialer, Server};
    use std::net::SocketAddrV4;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    let matches = App::new("Mirage Proxy")
        .version("1.0")
        .about("Runs the tunnel proxy server.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .get_matches();

    let config_file_path = matches.value_of("CONFIG_FILE").unwrap();
    let config: ProxyConfig =
        serde_json::from_reader(fs::File::open(config_file_path).expect("Error opening config file"))
            .expect("Error parsing config file");

    let log = logging::init();

    let key_exchange = match &config.key {
        Some(encoded) => {
            let material = base64::decode(encoded).expect("Error decoding key");
            let mut key = [0u8; mirage::crypt::KEY_BYTES];
            if material.len() != key.len() {
                panic!("Key must be {} bytes, got {}", key.len(), material.len());
            }
            key.copy_from_slice(&material);

            let expected = material;
            KeyExchange::Sign {
                sign: Vec::new(),
                parser: Arc::new(move |sign: &[u8]| {
                    if sign == &expected[..] {
                        Some(key)
                    } else {
                        None
                    }
                }),
            }
        }
        None => KeyExchange::None,
    };

    let cfg = Config {
        prev_packets: config
            .prev_packets
            .iter()
            .map(|blob| base64::decode(blob).expect("Error decoding handshake script"))
            .collect(),
        key_exchange,
        mtu: config.mtu,
        ..Config::default()
    };

    let listen: SocketAddrV4 = config.listen.parse().expect("Error parsing listen address");
    let listener = RawListener::bind(listen).expect("Error binding raw listener");

    logging::info!(log, "proxy listening"; "addr" => %listen);

    loop {
        let raw = match listener.accept() {
            Ok(raw) => raw,
            Err(err) => {
                logging::error!(log, "accept failed"; "cause" => %err);
                continue;
            }
        };

        let cfg = cfg.clone();
        let log = log.new(logging::o!("peer" => raw.remote().to_string()));

        thread::spawn(move || {
            let conn = match Conn::accept(Arc::new(raw), &cfg, &log) {
                Ok(conn) => Arc::new(conn),
                Err(err) => {
                    logging::warn!(log, "handshake rejected"; "cause" => %err);
                    return;
                }
            };

            let server = Server::serve(conn, Box::new(RawDialer), &cfg, &log);
            while !server.is_closed() {
                thread::sleep(Duration::from_secs(1));
            }
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn main() {
    panic!("The proxy daemon requires Linux raw sockets");
}
