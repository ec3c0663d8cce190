// Host event loop: listener, handshake and reader threads around one
// `Session`.
//
// Architecture: thread-per-reader with a central `mpsc` channel.
//
// - **Accept thread**: non-blocking `Listener::accept()` loop, so it can
//   notice `keep_running` going false. Each accepted connection gets a short
//   handshake thread.
// - **Handshake threads**: read the first frame with the handshake timeout and
//   send `InternalEvent::Handshake` (connection plus decoded `Connect`) to the
//   main thread. A joiner that never speaks only ever ties up its own thread.
// - **Reader threads** (one per admitted peer): read frames, decode
//   envelopes, send `InternalEvent::EnvelopeFrom`. On EOF, error or an
//   undecodable frame, send `InternalEvent::Disconnected` and exit.
// - **Main thread**: owns the `Session`, applies events in arrival order, and
//   uses `recv_timeout` up to the session's next wakeup as its timer for
//   heartbeats and vote deadlines.
//
// Only the main thread writes to sockets (through the session's bus).
//
// Shutdown: `HostHandle::stop` clears `keep_running`; the main loop exits,
// the session says goodbye and closes every link, which wakes the reader
// threads.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use wayfarer_protocol::{Envelope, LeaveReason, Message, PeerId, decode};

use crate::collaborators::{NoPersistence, SaveDirectory, SessionPersistence};
use crate::config::SessionConfig;
use crate::connection::{Connection, ConnectionReader, Listener, listen};
use crate::error::ConnectionError;
use crate::handshake::{HandshakeGate, JoinRequest};
use crate::session::Session;

/// Longest the main loop sleeps before rechecking `keep_running`.
const MAX_IDLE: Duration = Duration::from_millis(100);

/// Accept-loop back-off while no connection is pending.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(20);

/// Events sent from accept/handshake/reader threads to the main thread.
enum InternalEvent {
    Handshake {
        conn: Connection,
        request: JoinRequest,
    },
    EnvelopeFrom {
        peer_id: PeerId,
        envelope: Envelope,
    },
    Disconnected {
        peer_id: PeerId,
        reason: LeaveReason,
    },
}

/// Handle returned by `start_host` to control the running coordinator.
pub struct HostHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl HostHandle {
    /// Signal the coordinator to stop and wait for it to shut down.
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

/// Start the session coordinator on a background thread. Returns a handle
/// for stopping it and the bound address (useful with port 0).
pub fn start_host(config: SessionConfig) -> std::io::Result<(HostHandle, SocketAddr)> {
    config
        .validate()
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidInput, e))?;
    let listener = listen(&config.bind_address, config.port, config.max_peers as usize)?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_clone = keep_running.clone();

    log::info!(
        "hosting {:?} on {addr} (version {}, up to {} peers)",
        config.session_name,
        config.game_version,
        config.max_peers
    );
    let thread = thread::spawn(move || {
        run_host(listener, config, keep_running_clone);
    });

    Ok((
        HostHandle {
            keep_running,
            thread: Some(thread),
        },
        addr,
    ))
}

fn persistence_for(config: &SessionConfig) -> Box<dyn SessionPersistence> {
    match &config.save_dir {
        Some(dir) => Box::new(SaveDirectory::new(dir.clone())),
        None => Box::new(NoPersistence),
    }
}

/// Main coordinator loop. Runs until `keep_running` is cleared.
fn run_host(listener: Listener, config: SessionConfig, keep_running: Arc<AtomicBool>) {
    let mut session = Session::new(&config, persistence_for(&config), Instant::now());
    let (tx, rx): (Sender<InternalEvent>, Receiver<InternalEvent>) = mpsc::channel();

    let keep_running_accept = keep_running.clone();
    let tx_accept = tx.clone();
    let handshake_timeout = config.handshake_timeout();
    thread::spawn(move || {
        accept_loop(listener, handshake_timeout, tx_accept, keep_running_accept);
    });

    while keep_running.load(Ordering::SeqCst) {
        let wait = session
            .next_wakeup()
            .saturating_duration_since(Instant::now())
            .min(MAX_IDLE);
        match rx.recv_timeout(wait) {
            Ok(event) => {
                handle_event(&mut session, event, &tx);
                while let Ok(event) = rx.try_recv() {
                    handle_event(&mut session, event, &tx);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        session.on_tick(Instant::now());
    }

    log::info!("closing session {:?}", session.name());
    session.shutdown();
}

fn accept_loop(
    listener: Listener,
    handshake_timeout: Duration,
    tx: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
) {
    while keep_running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok(conn) => {
                let tx = tx.clone();
                thread::spawn(move || read_handshake(conn, handshake_timeout, tx));
            }
            Err(ConnectionError::Io(e)) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_BACKOFF);
            }
            Err(ConnectionError::AtCapacity { .. }) => {}
            Err(e) => {
                log::warn!("accept failed: {e}");
                thread::sleep(ACCEPT_BACKOFF);
            }
        }
    }
}

/// Wait for the joiner's `Connect`, then hand the connection to the main
/// thread for the admission decision.
fn read_handshake(mut conn: Connection, timeout: Duration, tx: Sender<InternalEvent>) {
    let addr = conn.peer_addr();
    match HandshakeGate::receive_connect(&mut conn, timeout) {
        Ok(request) => {
            let _ = tx.send(InternalEvent::Handshake { conn, request });
        }
        Err(e) => {
            log::info!("handshake with {addr} failed: {e}");
            conn.close();
        }
    }
}

fn handle_event(session: &mut Session, event: InternalEvent, tx: &Sender<InternalEvent>) {
    let now = Instant::now();
    match event {
        InternalEvent::Handshake { conn, request } => {
            let peer_id = request.peer_id;
            if let Ok(reader) = session.admit(conn, request, now) {
                let tx = tx.clone();
                thread::spawn(move || reader_loop(reader, peer_id, tx));
            }
        }
        InternalEvent::EnvelopeFrom { peer_id, envelope } => {
            session.handle_envelope(peer_id, envelope, now);
        }
        InternalEvent::Disconnected { peer_id, reason } => {
            session.remove_peer(peer_id, reason, now);
        }
    }
}

/// Reader loop for one admitted peer. Runs in its own thread.
fn reader_loop(mut reader: ConnectionReader, peer_id: PeerId, tx: Sender<InternalEvent>) {
    let reason = loop {
        let bytes = match reader.receive() {
            Ok(bytes) => bytes,
            Err(ConnectionError::Closed) => break LeaveReason::ConnectionClosed,
            Err(e) => {
                log::warn!("read from {peer_id} failed: {e}");
                break LeaveReason::ConnectionClosed;
            }
        };
        let envelope = match decode(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("bad frame from {peer_id}: {e}");
                break LeaveReason::ProtocolMismatch;
            }
        };
        let goodbye = matches!(envelope.body, Message::Goodbye);
        let event = InternalEvent::EnvelopeFrom { peer_id, envelope };
        if tx.send(event).is_err() {
            return;
        }
        if goodbye {
            return;
        }
    };
    let _ = tx.send(InternalEvent::Disconnected { peer_id, reason });
}
