//! The server side of the fabric.
//!
//! A [`Service`] owns the listening endpoint, one accept thread, and one
//! reader thread per connection. Readers invoke the request handler
//! serially, so requests on a single connection are answered in arrival
//! order; connections never wait on each other.

use std::io::ErrorKind;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use burrow_primitives::{Conn, Listener, ShmRegion, WakeResult};
use parking_lot::Mutex;

use crate::error::StartError;
use crate::frame::{FrameHeader, FrameKind, FRAME_HEADER_SIZE};
use crate::layout::SharedRegionView;
use crate::status::Status;
use crate::PROTOCOL_VERSION;

/// Installed per-request callback: `(method_id, request) -> (status,
/// response)`. The status travels back in the response frame's `aux` field;
/// positive values are the application's to define.
pub type RequestHandler = Arc<dyn Fn(u32, &[u8]) -> (Status, Vec<u8>) + Send + Sync>;

/// A named service accepting connections from local clients.
pub struct Service {
    inner: Arc<ServiceInner>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

struct ServiceInner {
    name: String,
    running: AtomicBool,
    listener: Mutex<Option<Arc<Listener>>>,
    handler: Mutex<Option<RequestHandler>>,
    connections: Mutex<Vec<Arc<Connection>>>,
}

/// Server-side bundle for one client: socket, mapping, reader thread.
struct Connection {
    socket: Conn,
    view: SharedRegionView,
    /// Keeps the mapping the view points into alive.
    #[allow(dead_code)]
    shm: ShmRegion,
    /// Serializes producers of the server→client ring: the reader thread
    /// writing responses and any thread broadcasting notifications.
    tx: Mutex<()>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

// SAFETY: the view's raw pointers target the mapping held alongside it; ring
// access is synchronized by the control-block atomics plus the tx lock.
unsafe impl Send for Connection {}
unsafe impl Sync for Connection {}

impl Connection {
    /// Write one frame into the server→client ring and wake the client.
    /// Fails with `RING_FULL` (nothing written) or `DISCONNECTED` (wake
    /// could not be delivered).
    fn send_frame(&self, header: &FrameHeader, payload: &[u8]) -> Result<(), Status> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(payload);

        {
            let _guard = self.tx.lock();
            if !self.view.server_to_client().write(&frame) {
                return Err(Status::RING_FULL);
            }
        }

        match self.socket.send_wake() {
            WakeResult::Sent | WakeResult::Coalesced => Ok(()),
            WakeResult::PeerDead => Err(Status::DISCONNECTED),
        }
    }
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                name: name.into(),
                running: AtomicBool::new(false),
                listener: Mutex::new(None),
                handler: Mutex::new(None),
                connections: Mutex::new(Vec::new()),
            }),
            accept_thread: Mutex::new(None),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Number of currently established connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Install (or replace) the request handler. Takes effect for the next
    /// dispatched request; in-flight invocations keep the handler they
    /// snapshotted.
    pub fn set_request_handler(
        &self,
        handler: impl Fn(u32, &[u8]) -> (Status, Vec<u8>) + Send + Sync + 'static,
    ) {
        *self.inner.handler.lock() = Some(Arc::new(handler));
    }

    /// Create the listening endpoint and spawn the accept thread.
    pub fn start(&self) -> Result<(), StartError> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(StartError::AlreadyRunning);
        }

        let listener = match Listener::bind(&self.inner.name) {
            Ok(listener) => Arc::new(listener),
            Err(source) => {
                self.inner.running.store(false, Ordering::Release);
                return Err(StartError::Bind { service: self.inner.name.clone(), source });
            }
        };
        *self.inner.listener.lock() = Some(listener.clone());

        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name(format!("burrow-accept-{}", self.inner.name))
            .spawn(move || accept_loop(inner, listener));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(source) => {
                // Undo the partial start: release the endpoint and the flag.
                self.inner.listener.lock().take();
                self.inner.running.store(false, Ordering::Release);
                return Err(StartError::Spawn(source));
            }
        };
        *self.accept_thread.lock() = Some(handle);

        tracing::debug!(service = %self.inner.name, "service started");
        Ok(())
    }

    /// Shut everything down: the listener, the accept thread, then every
    /// connection's socket, reader thread, mapping and descriptors.
    /// Idempotent.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(listener) = self.inner.listener.lock().take() {
            listener.shutdown();
        }
        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }

        let connections = mem::take(&mut *self.inner.connections.lock());
        for connection in &connections {
            connection.socket.shutdown();
        }
        for connection in &connections {
            let handle = connection.reader.lock().take();
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }

        tracing::debug!(service = %self.inner.name, "service stopped");
    }

    /// Broadcast a notification to every connected client.
    ///
    /// Every connection is attempted; the first error observed is returned
    /// (`RING_FULL` if some client's ring had no room, `DISCONNECTED` if a
    /// wake could not be delivered), and the remaining connections are
    /// unaffected.
    pub fn notify(&self, service_id: u32, notify_id: u32, payload: &[u8]) -> Result<(), Status> {
        let header = FrameHeader::notify(service_id, notify_id, payload.len() as u32);
        let connections: Vec<Arc<Connection>> = self.inner.connections.lock().clone();

        let mut first_error = None;
        for connection in &connections {
            if let Err(status) = connection.send_frame(&header, payload) {
                tracing::debug!(service = %self.inner.name, %status, "notify skipped a connection");
                first_error.get_or_insert(status);
            }
        }

        match first_error {
            None => Ok(()),
            Some(status) => Err(status),
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(inner: Arc<ServiceInner>, listener: Arc<Listener>) {
    while inner.running.load(Ordering::Acquire) {
        let conn = match listener.accept() {
            Ok(conn) => conn,
            Err(err) => {
                if !inner.running.load(Ordering::Acquire) {
                    break;
                }
                tracing::warn!(service = %inner.name, error = %err, "accept failed");
                continue;
            }
        };

        match establish(conn) {
            Ok(connection) => {
                tracing::debug!(
                    service = %inner.name,
                    ring_capacity = connection.view.ring_capacity(),
                    "connection established"
                );
                // Enter the table before the reader runs, so a client that
                // hangs up instantly still finds its entry to remove.
                inner.connections.lock().push(connection.clone());

                let reader_inner = inner.clone();
                let reader_connection = connection.clone();
                let spawned = thread::Builder::new()
                    .name(format!("burrow-reader-{}", inner.name))
                    .spawn(move || reader_loop(reader_inner, reader_connection));
                match spawned {
                    Ok(handle) => *connection.reader.lock() = Some(handle),
                    Err(err) => {
                        // This connection is unusable without a reader, but
                        // the service (and its other clients) carry on.
                        tracing::warn!(
                            service = %inner.name,
                            error = %err,
                            "failed to spawn reader thread, dropping connection"
                        );
                        let mut connections = inner.connections.lock();
                        connections.retain(|c| !Arc::ptr_eq(c, &connection));
                        drop(connections);
                        connection.socket.shutdown();
                    }
                }
            }
            Err(err) => {
                tracing::debug!(service = %inner.name, error = %err, "handshake rejected");
            }
        }
    }
}

/// Run the server half of the handshake on a freshly accepted socket:
/// receive `(version, region fd)`, validate both, then ack.
fn establish(conn: Conn) -> std::io::Result<Arc<Connection>> {
    let mut payload = [0u8; 8];
    let (n, fd) = conn.recv_with_fd(&mut payload)?;
    if n < 2 {
        return Err(std::io::Error::new(ErrorKind::InvalidData, "short handshake datagram"));
    }
    let Some(fd) = fd else {
        return Err(std::io::Error::new(ErrorKind::InvalidData, "handshake carried no fd"));
    };

    let version = u16::from_le_bytes([payload[0], payload[1]]);
    if version != PROTOCOL_VERSION {
        // Reject: ack 0, then drop socket and fd.
        let _ = conn.send_byte(0);
        return Err(std::io::Error::new(
            ErrorKind::Unsupported,
            format!("client offered protocol version {version}"),
        ));
    }

    // Map and validate the region before committing to the connection; a
    // region we cannot use is rejected the same way as a bad version.
    let shm = match ShmRegion::from_fd(fd) {
        Ok(shm) => shm,
        Err(err) => {
            let _ = conn.send_byte(0);
            return Err(err);
        }
    };
    // SAFETY: the mapping stays alive in `shm`, stored alongside the view.
    let view = match unsafe { SharedRegionView::attach(shm.region()) } {
        Ok(view) => view,
        Err(err) => {
            let _ = conn.send_byte(0);
            return Err(std::io::Error::new(ErrorKind::InvalidData, err));
        }
    };

    conn.send_byte(1)?;

    Ok(Arc::new(Connection {
        socket: conn,
        view,
        shm,
        tx: Mutex::new(()),
        reader: Mutex::new(None),
    }))
}

fn reader_loop(inner: Arc<ServiceInner>, connection: Arc<Connection>) {
    let mut violated = false;

    while inner.running.load(Ordering::Acquire) {
        if connection.socket.recv_byte().is_err() {
            // Peer closed or the service is shutting this socket down.
            break;
        }
        if drain_requests(&inner, &connection).is_err() {
            tracing::warn!(
                service = %inner.name,
                "malformed frame from client, closing connection"
            );
            violated = true;
            break;
        }
    }

    // Peer hangup (or protocol violation) while the service keeps running:
    // this connection is finished, drop it from the table.
    if inner.running.load(Ordering::Acquire) {
        remove_connection(&inner, &connection, violated);
    }
}

/// Drain every complete frame from the client→server ring. Returns `Err`
/// on a protocol violation (frame that can never fit, or conflicting kind
/// bits).
fn drain_requests(inner: &Arc<ServiceInner>, connection: &Arc<Connection>) -> Result<(), ()> {
    let ring = connection.view.client_to_server();
    let max_payload = ring.capacity() - FRAME_HEADER_SIZE as u32;

    loop {
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        if !ring.peek(&mut header_buf) {
            return Ok(());
        }
        let header = FrameHeader::decode_array(&header_buf);

        if header.payload_len > max_payload {
            return Err(());
        }
        if ring.read_available() < FRAME_HEADER_SIZE as u32 + header.payload_len {
            // Partial frame: the producer has published the header but not
            // the payload yet. Leave the tail alone.
            return Ok(());
        }

        ring.skip(FRAME_HEADER_SIZE as u32);
        let mut payload = vec![0u8; header.payload_len as usize];
        if header.payload_len > 0 {
            ring.read(&mut payload);
        }

        match header.kind() {
            Some(FrameKind::Request) => answer_request(inner, connection, &header, &payload),
            Some(_) => {
                // Responses and notifications have no server-side meaning;
                // the frame has already been advanced past.
            }
            None => return Err(()),
        }
    }
}

fn answer_request(
    inner: &Arc<ServiceInner>,
    connection: &Arc<Connection>,
    request: &FrameHeader,
    payload: &[u8],
) {
    let handler = inner.handler.lock().clone();
    let (status, response_payload) = match handler {
        Some(handler) => handler(request.message_id, payload),
        None => (Status::INVALID_METHOD, Vec::new()),
    };

    let response =
        FrameHeader::response_to(request, response_payload.len() as u32, status.as_wire());
    if let Err(err) = connection.send_frame(&response, &response_payload) {
        // A full ring drops the response; the caller will time out. A dead
        // peer is about to be noticed by this thread's next recv.
        tracing::warn!(service = %inner.name, seq = request.seq, %err, "response dropped");
    }
}

fn remove_connection(inner: &Arc<ServiceInner>, connection: &Arc<Connection>, violated: bool) {
    let mut connections = inner.connections.lock();
    if let Some(index) = connections.iter().position(|c| Arc::ptr_eq(c, connection)) {
        let removed = connections.remove(index);
        drop(connections);

        removed.socket.shutdown();
        // We are the reader: detach the handle instead of joining ourselves.
        removed.reader.lock().take();
        tracing::debug!(service = %inner.name, violated, "connection removed");
    }
}
