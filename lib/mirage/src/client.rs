//! Client side of the tunnel: owns the control channel, maps the session ids
//! the server allocated onto local capture handles, and runs the uplink
//! (capture -> tunnel) and downlink (tunnel -> inject) pipelines.

use crate::capture::Capture;
use crate::control::Controller;
use crate::error::{CloseSlot, Error, Result, SessionError};
use crate::sconn::{Config, Conn};
use crate::session::{Activity, Proto, Session, SessionId, CONTROL_SESSION};
use crate::tcpip;
use hashbrown::HashMap;
use std::sync::{mpsc, Arc, RwLock};
use std::thread;
use std::time::Duration;
use vapor::logging::{self, Logger};
use vapor::packet::Packet;

struct Entry {
    id: SessionId,
    capture: Arc<dyn Capture>,
    activity: Activity,
    closed: CloseSlot,
}

impl Entry {
    fn close(&self, cause: Error) {
        if self.closed.set(cause) {
            self.capture.close();
        }
    }
}

pub struct Client {
    conn: Arc<Conn>,
    ctr: Controller,
    sessions: RwLock<HashMap<SessionId, Arc<Entry>>>,
    max_recv_err: u32,
    keepalive_period: Duration,
    closed: CloseSlot,
    log: Logger,
}

impl Client {
    /// Wires a client onto an opened connection: starts the downlink service
    /// and the keepalive thread, and readies the control channel.
    pub fn dial(conn: Arc<Conn>, cfg: &Config, log: &Logger) -> Arc<Client> {
        let log = log.new(logging::o!("role" => "client"));
        let (control_tx, control_rx) = mpsc::channel();

        let client = Arc::new(Client {
            ctr: Controller::new(conn.clone(), control_rx, cfg.control_timeout, &log),
            conn,
            sessions: RwLock::new(HashMap::new()),
            max_recv_err: cfg.max_recv_err,
            keepalive_period: cfg.keepalive_period,
            closed: CloseSlot::new(),
            log,
        });

        {
            let client = client.clone();
            thread::spawn(move || client.downlink_service(control_tx));
        }
        {
            let client = client.clone();
            thread::spawn(move || client.keepalive_service());
        }

        client
    }

    #[inline]
    pub fn conn(&self) -> &Arc<Conn> {
        &self.conn
    }

    /// The control channel, for calls the client does not wrap.
    #[inline]
    pub fn control(&self) -> &Controller {
        &self.ctr
    }

    /// Tells the server configuration is complete; data flows only after this.
    pub fn end_config(&self) -> Result<()> {
        self.ctr.end_config()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    /// Number of live proxied sessions.
    pub fn live(&self) -> usize {
        self.sessions
            .read()
            .expect("Sessions lock poisoned")
            .values()
            .filter(|entry| !entry.closed.is_closed())
            .count()
    }

    /// Starts proxying the capture handle's flow: announces it to the server,
    /// binds the returned id and spawns the uplink worker.
    pub fn add_session(&self, capture: Arc<dyn Capture>) -> Result<SessionId> {
        if self.closed.is_closed() {
            return Err(Error::Closed);
        }

        let desc = capture.session();
        let own = Session {
            src: self.conn.local(),
            proto: Proto::Tcp,
            dst: self.conn.remote(),
        };
        if desc == own {
            return Err(SessionError::ProxySelf.into());
        }

        let id = match desc.proto {
            Proto::Tcp => self.ctr.add_tcp(desc.dst)?,
            Proto::Udp => self.ctr.add_udp(desc.dst)?,
        };

        let entry = Arc::new(Entry {
            id,
            capture,
            activity: Activity::new(),
            closed: CloseSlot::new(),
        });
        self.sessions
            .write()
            .expect("Sessions lock poisoned")
            .insert(id, entry.clone());

        logging::info!(self.log, "session added"; "id" => id, "session" => %desc);

        let conn = self.conn.clone();
        thread::spawn(move || Client::uplink_service(conn, entry));

        Ok(id)
    }

    /// Stops proxying a session on both ends. Idempotent locally.
    pub fn del_session(&self, id: SessionId) -> Result<()> {
        let removed = self
            .sessions
            .write()
            .expect("Sessions lock poisoned")
            .remove(&id);

        if let Some(entry) = removed {
            let result = match entry.capture.session().proto {
                Proto::Tcp => self.ctr.del_tcp(id),
                Proto::Udp => self.ctr.del_udp(id),
            };
            entry.close(Error::Closed);
            logging::info!(self.log, "session deleted"; "id" => id);
            result
        } else {
            Ok(())
        }
    }

    /// Capture-to-tunnel pipeline for one session.
    fn uplink_service(conn: Arc<Conn>, entry: Arc<Entry>) {
        let mut pkt = Packet::new(tcpip::HEADERS_SIZE, conn.mtu());

        loop {
            pkt.reset(tcpip::HEADERS_SIZE);
            if let Err(err) = entry.capture.capture(&mut pkt) {
                entry.close(err);
                return;
            }

            entry.activity.bump();
            if let Err(err) = conn.send(&mut pkt, entry.id) {
                entry.close(err);
                return;
            }
        }
    }

    /// The sole reader of the connection: control frames feed the controller's
    /// inbox, data frames are injected back into the host.
    fn downlink_service(&self, control_tx: mpsc::Sender<Vec<u8>>) {
        let mut pkt = Packet::new(0, self.conn.mtu());
        let mut tiny = 0u32;

        loop {
            pkt.reset(0);
            let result = match self.conn.recv(&mut pkt) {
                Ok(CONTROL_SESSION) => {
                    // A dropped inbox only means nobody is waiting on a call.
                    drop(control_tx.send(pkt.data().to_vec()));
                    Ok(())
                }
                Ok(id) => self.inject(id, &pkt),
                Err(err) => Err(err),
            };

            match result {
                Ok(()) => tiny = 0,
                Err(err) if err.tolerated() => {
                    tiny += 1;
                    logging::warn!(self.log, "tolerated packet error";
                                   "cause" => %err,
                                   "consecutive" => tiny);

                    if tiny >= self.max_recv_err {
                        self.close(err);
                        return;
                    }
                }
                Err(err) => {
                    self.close(err);
                    return;
                }
            }
        }
    }

    /// Hands one downlink frame to its session's injector.
    fn inject(&self, id: SessionId, pkt: &Packet) -> Result<()> {
        let entry = {
            let sessions = self.sessions.read().expect("Sessions lock poisoned");
            sessions.get(&id).cloned()
        };

        let entry = match entry {
            Some(entry) if !entry.closed.is_closed() => entry,
            _ => return Err(SessionError::UnknownId(id).into()),
        };

        entry.activity.bump();
        entry.capture.inject(pkt)
    }

    /// Ticks session keepalives and keeps the control channel warm with a
    /// ping per period.
    fn keepalive_service(&self) {
        loop {
            thread::sleep(self.keepalive_period);
            if self.closed.is_closed() {
                return;
            }

            let mut reap = Vec::new();
            {
                let sessions = self.sessions.read().expect("Sessions lock poisoned");
                for entry in sessions.values() {
                    if entry.closed.is_closed() {
                        reap.push(entry.id);
                    } else if entry.activity.tick() {
                        entry.close(SessionError::KeepaliveExceeded.into());
                        logging::info!(self.log, "session expired"; "id" => entry.id);
                        reap.push(entry.id);
                    }
                }
            }

            if !reap.is_empty() {
                let mut sessions = self.sessions.write().expect("Sessions lock poisoned");
                for id in reap {
                    sessions.remove(&id);
                }
            }

            // An otherwise idle tunnel still shows liveness to the server.
            if let Err(err) = self.ctr.ping() {
                logging::debug!(self.log, "keepalive ping failed"; "cause" => %err);
            }
        }
    }

    /// Closes the client and cascades: every session, then the connection.
    pub fn close(&self, cause: Error) -> Error {
        if self.closed.set(cause.clone()) {
            logging::info!(self.log, "client closing"; "cause" => %cause);

            let sessions: Vec<_> = {
                let mut map = self.sessions.write().expect("Sessions lock poisoned");
                map.drain().map(|(_, entry)| entry).collect()
            };
            for entry in sessions {
                entry.close(Error::Closed);
            }

            self.conn.close_with(cause);
        }
        self.closed.get().expect("Latched cause missing")
    }
}
