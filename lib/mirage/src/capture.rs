//! The packet-capture collaborator contract. Platform capture (divert,
//! nflog, nfqueue) lives outside this crate; the tunnel only relies on this
//! seam. `MockCapture` is the in-process stand-in used by tests and loopback
//! runs.

use crate::error::{Error, Result};
use crate::session::Session;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;
use vapor::packet::Packet;

/// OS-provided handle yielding outbound packets for one flow descriptor and
/// accepting injected inbound packets.
pub trait Capture: Send + Sync {
    /// The descriptor this handle was opened for.
    fn session(&self) -> Session;

    /// Blocks until an outbound packet for the flow is available and writes
    /// the full IP packet into the window. Fails with `Closed` after `close`.
    fn capture(&self, pkt: &mut Packet) -> Result<()>;

    /// Injects an IP packet into the host's inbound path.
    fn inject(&self, pkt: &Packet) -> Result<()>;

    /// Releases OS resources and unblocks pending captures. Idempotent.
    fn close(&self);
}

/// Process-local capture handle: `push` stands in for the OS handing us an
/// outbound packet, `injected` observes what the tunnel delivered back.
pub struct MockCapture {
    desc: Session,
    feed_tx: Mutex<mpsc::Sender<Vec<u8>>>,
    feed_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    injected_tx: Mutex<mpsc::Sender<Vec<u8>>>,
    injected_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: AtomicBool,
}

impl MockCapture {
    pub fn new(desc: Session) -> MockCapture {
        let (feed_tx, feed_rx) = mpsc::channel();
        let (injected_tx, injected_rx) = mpsc::channel();

        MockCapture {
            desc,
            feed_tx: Mutex::new(feed_tx),
            feed_rx: Mutex::new(feed_rx),
            injected_tx: Mutex::new(injected_tx),
            injected_rx: Mutex::new(injected_rx),
            closed: AtomicBool::new(false),
        }
    }

    /// Hands the capture loop one outbound packet.
    pub fn push(&self, data: &[u8]) {
        drop(
            self.feed_tx
                .lock()
                .expect("Feed queue poisoned")
                .send(data.to_vec()),
        );
    }

    /// Waits for the next packet the tunnel injected back toward the host.
    pub fn injected(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.injected_rx
            .lock()
            .expect("Injected queue poisoned")
            .recv_timeout(timeout)
            .ok()
    }
}

impl Capture for MockCapture {
    #[inline]
    fn session(&self) -> Session {
        self.desc
    }

    fn capture(&self, pkt: &mut Packet) -> Result<()> {
        let feed = self.feed_rx.lock().expect("Feed queue poisoned");

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }

            let data = feed
                .recv()
                .map_err(|_| Error::Io(io::ErrorKind::BrokenPipe))?;

            // Shutdown sentinel.
            if data.is_empty() {
                continue;
            }
            if data.len() > pkt.len() {
                continue;
            }

            pkt.truncate(data.len());
            pkt.data_mut().copy_from_slice(&data);
            return Ok(());
        }
    }

    fn inject(&self, pkt: &Packet) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        self.injected_tx
            .lock()
            .expect("Injected queue poisoned")
            .send(pkt.data().to_vec())
            .map_err(|_| Error::Io(io::ErrorKind::BrokenPipe))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            drop(
                self.feed_tx
                    .lock()
                    .expect("Feed queue poisoned")
                    .send(Vec::new()),
            );
        }
    }
}
