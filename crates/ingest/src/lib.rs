//! The live-mode ingestion server.
//!
//! One acceptor thread takes connections; each connection gets a reader
//! thread that decodes frames, groups events into batches of the announced
//! window size, and hands each batch to the orchestrator through a bounded
//! channel. A batch is acknowledged only after that hand-off. Framing
//! corruption closes the offending connection and nothing else.

pub mod protocol;

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use crate::protocol::{read_frame, write_ack, Frame};

/// How long a reader waits for traffic before re-checking shutdown.
const IDLE_POLL: Duration = Duration::from_millis(200);

/// Counters exposed to the status output.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub batches: AtomicU64,
    pub events: AtomicU64,
    pub skipped_events: AtomicU64,
    pub failed_connections: AtomicU64,
}

pub struct IngestServer {
    listener: TcpListener,
    batch_tx: Sender<Vec<String>>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<IngestStats>,
}

impl IngestServer {
    /// Bind the listening socket. Failure here is fatal to live mode.
    pub fn bind(
        addr: SocketAddr,
        batch_tx: Sender<Vec<String>>,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!(addr = %listener.local_addr()?, "ingest server listening");
        Ok(Self {
            listener,
            batch_tx,
            shutdown,
            stats: Arc::new(IngestStats::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// Start the acceptor thread.
    pub fn spawn(self) -> JoinHandle<()> {
        thread::Builder::new()
            .name("ingest-accept".into())
            .spawn(move || self.accept_loop())
            .expect("failed to spawn acceptor thread")
    }

    fn accept_loop(self) {
        let mut readers: Vec<JoinHandle<()>> = Vec::new();
        while !self.shutdown.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "shipper connected");
                    let batch_tx = self.batch_tx.clone();
                    let shutdown = Arc::clone(&self.shutdown);
                    let stats = Arc::clone(&self.stats);
                    let handle = thread::Builder::new()
                        .name(format!("ingest-{}", peer))
                        .spawn(move || {
                            if let Err(e) = serve_connection(stream, &batch_tx, &shutdown, &stats)
                            {
                                stats.failed_connections.fetch_add(1, Ordering::Relaxed);
                                warn!(%peer, error = %e, "connection closed on error");
                            } else {
                                debug!(%peer, "shipper disconnected");
                            }
                        })
                        .expect("failed to spawn reader thread");
                    readers.push(handle);
                    readers.retain(|h| !h.is_finished());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(IDLE_POLL);
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    thread::sleep(IDLE_POLL);
                }
            }
        }
        for handle in readers {
            let _ = handle.join();
        }
        info!("ingest server stopped");
    }
}

/// Drive one shipper connection until EOF, error, or shutdown.
fn serve_connection(
    mut stream: TcpStream,
    batch_tx: &Sender<Vec<String>>,
    shutdown: &AtomicBool,
    stats: &IngestStats,
) -> Result<(), cidrwatch_common::CidrwatchError> {
    stream.set_nonblocking(false)?;

    let mut window_size: usize = 1;
    let mut pending: Vec<String> = Vec::new();
    let mut batch_events: usize = 0;
    let mut highest_seq: u32 = 0;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            flush(&mut pending, batch_tx, stats);
            return Ok(());
        }

        // Wait for a full header without consuming it, so a poll timeout
        // never splits a frame.
        stream.set_read_timeout(Some(IDLE_POLL))?;
        let mut header_probe = [0u8; 2];
        match stream.peek(&mut header_probe) {
            Ok(0) => {
                // EOF: hand off whatever arrived before the close.
                flush(&mut pending, batch_tx, stats);
                return Ok(());
            }
            Ok(n) if n < 2 => {
                thread::sleep(Duration::from_millis(5));
                continue;
            }
            Ok(_) => {}
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => return Err(e.into()),
        }

        stream.set_read_timeout(None)?;
        match read_frame(&mut stream)? {
            Frame::WindowSize(size) => {
                window_size = (size as usize).max(1);
                debug!(window_size, "window announced");
            }
            Frame::Events(events) => {
                for event in events {
                    batch_events += 1;
                    highest_seq = highest_seq.max(event.seq);
                    match event.message {
                        Some(message) => pending.push(message),
                        None => {
                            stats.skipped_events.fetch_add(1, Ordering::Relaxed);
                            debug!(seq = event.seq, "event without message skipped");
                        }
                    }
                }
                // Skipped events still complete the window; the shipper is
                // owed its ack either way.
                if batch_events >= window_size {
                    flush(&mut pending, batch_tx, stats);
                    write_ack(&mut stream, highest_seq)?;
                    batch_events = 0;
                }
            }
        }
    }
}

/// Hand a batch to the orchestrator channel. Blocks while the channel is
/// full; the ack goes out only after this returns.
fn flush(pending: &mut Vec<String>, batch_tx: &Sender<Vec<String>>, stats: &IngestStats) {
    if pending.is_empty() {
        return;
    }
    let batch = std::mem::take(pending);
    stats.events.fetch_add(batch.len() as u64, Ordering::Relaxed);
    stats.batches.fetch_add(1, Ordering::Relaxed);
    if batch_tx.send(batch).is_err() {
        // Orchestrator is gone; shutdown is in progress.
        debug!("batch channel closed, dropping batch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode;
    use crossbeam_channel::bounded;
    use std::io::Write as _;

    fn start_server() -> (
        SocketAddr,
        crossbeam_channel::Receiver<Vec<String>>,
        Arc<AtomicBool>,
        Arc<IngestStats>,
        JoinHandle<()>,
    ) {
        let (tx, rx) = bounded(16);
        let shutdown = Arc::new(AtomicBool::new(false));
        let server = IngestServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            tx,
            Arc::clone(&shutdown),
        )
        .unwrap();
        let addr = server.local_addr().unwrap();
        let stats = server.stats();
        let handle = server.spawn();
        (addr, rx, shutdown, stats, handle)
    }

    #[test]
    fn batches_are_delivered_and_acked() {
        let (addr, rx, shutdown, _stats, handle) = start_server();

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(&encode::window(2)).unwrap();
        client
            .write_all(&encode::data(1, &[("message", "line one")]))
            .unwrap();
        client
            .write_all(&encode::data(2, &[("message", "line two")]))
            .unwrap();

        let batch = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(batch, vec!["line one".to_string(), "line two".to_string()]);

        // The ack for the batch names the highest sequence.
        let mut ack = [0u8; 6];
        std::io::Read::read_exact(&mut client, &mut ack).unwrap();
        assert_eq!(ack[0], protocol::VERSION);
        assert_eq!(ack[1], protocol::FRAME_ACK);
        assert_eq!(u32::from_be_bytes([ack[2], ack[3], ack[4], ack[5]]), 2);

        shutdown.store(true, Ordering::Relaxed);
        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn compressed_batch_round_trip() {
        let (addr, rx, shutdown, _stats, handle) = start_server();

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(&encode::window(3)).unwrap();
        let frames = vec![
            encode::data(1, &[("message", "a")]),
            encode::data(2, &[("message", "b")]),
            encode::json(3, r#"{"message":"c"}"#),
        ];
        client.write_all(&encode::compressed(&frames)).unwrap();

        let batch = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(batch, vec!["a".to_string(), "b".to_string(), "c".to_string()]);

        shutdown.store(true, Ordering::Relaxed);
        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn malformed_events_are_skipped() {
        let (addr, rx, shutdown, stats, handle) = start_server();

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(&encode::window(2)).unwrap();
        client
            .write_all(&encode::data(1, &[("host", "no-message")]))
            .unwrap();
        client
            .write_all(&encode::data(2, &[("message", "kept")]))
            .unwrap();

        // The skipped event still completes the two-event window.
        let batch = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(batch, vec!["kept".to_string()]);
        assert_eq!(stats.skipped_events.load(Ordering::Relaxed), 1);

        shutdown.store(true, Ordering::Relaxed);
        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn partial_batch_flushes_on_disconnect() {
        let (addr, rx, shutdown, _stats, handle) = start_server();

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(&encode::window(100)).unwrap();
        client
            .write_all(&encode::data(1, &[("message", "straggler")]))
            .unwrap();
        drop(client);

        let batch = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(batch, vec!["straggler".to_string()]);

        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn corrupt_frame_closes_only_that_connection() {
        let (addr, rx, shutdown, stats, handle) = start_server();

        let mut bad = TcpStream::connect(addr).unwrap();
        bad.write_all(&[0xFF, 0xFF, 0, 0, 0, 0]).unwrap();

        let mut good = TcpStream::connect(addr).unwrap();
        good.write_all(&encode::window(1)).unwrap();
        good.write_all(&encode::data(1, &[("message", "survives")]))
            .unwrap();

        let batch = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(batch, vec!["survives".to_string()]);

        // The corrupt connection was counted as failed.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while stats.failed_connections.load(Ordering::Relaxed) == 0
            && std::time::Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(stats.failed_connections.load(Ordering::Relaxed), 1);

        shutdown.store(true, Ordering::Relaxed);
        drop(good);
        handle.join().unwrap();
    }
}
