//! The client side of the fabric.
//!
//! A [`Client`] owns its socket, its shared region, and one receiver
//! thread. Callers invoke [`call`](Client::call) and
//! [`notify`](Client::notify) directly from any thread; outgoing ring
//! writes are serialized by a short producer-side lock, and responses are
//! routed back to blocked callers through a per-call condition variable
//! keyed by sequence number.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use burrow_primitives::{socket, Conn, ShmRegion, WakeResult};
use parking_lot::{Condvar, Mutex};

use crate::error::ConnectError;
use crate::frame::{FrameHeader, FrameKind, FRAME_HEADER_SIZE};
use crate::layout::{region_size, SharedRegionView, DEFAULT_RING_CAPACITY, MIN_RING_CAPACITY};
use crate::status::Status;
use crate::PROTOCOL_VERSION;

/// Installed notification callback: `(notify_id, payload)`. Runs on the
/// receiver thread, so a slow handler delays subsequent responses and
/// notifications on this connection.
pub type NotifyHandler = Arc<dyn Fn(u32, &[u8]) + Send + Sync>;

/// Tunables for a client connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-direction ring capacity in bytes. Power of two, at least
    /// [`MIN_RING_CAPACITY`].
    pub ring_capacity: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { ring_capacity: DEFAULT_RING_CAPACITY }
    }
}

/// A connection to a named local service.
pub struct Client {
    name: String,
    config: ClientConfig,
    /// Survives reconnects; installable before the first connect.
    notify_handler: Arc<Mutex<Option<NotifyHandler>>>,
    link: Mutex<Option<Arc<Link>>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

/// Established-connection state shared with the receiver thread.
struct Link {
    socket: Conn,
    view: SharedRegionView,
    /// Keeps the mapping the view points into alive.
    #[allow(dead_code)]
    shm: ShmRegion,
    running: AtomicBool,
    /// Correlation tokens. Starts at 1 so 0 never looks like "absent".
    next_seq: AtomicU32,
    /// Serializes producers of the client→server ring across caller
    /// threads.
    tx: Mutex<()>,
    pending: Mutex<HashMap<u32, Arc<PendingCall>>>,
}

// SAFETY: the view's raw pointers target the mapping held alongside it; ring
// access is synchronized by the control-block atomics plus the tx lock.
unsafe impl Send for Link {}
unsafe impl Sync for Link {}

/// One outstanding request, shared between its caller and the receiver.
struct PendingCall {
    state: Mutex<PendingState>,
    completed: Condvar,
}

struct PendingState {
    done: bool,
    status: Status,
    response: Vec<u8>,
}

impl PendingCall {
    fn new() -> Self {
        Self {
            state: Mutex::new(PendingState {
                done: false,
                status: Status::DISCONNECTED,
                response: Vec::new(),
            }),
            completed: Condvar::new(),
        }
    }

    /// Complete the call and wake its waiter. A call completes once; later
    /// attempts (e.g. a response racing a disconnect) are ignored.
    fn complete(&self, status: Status, response: Vec<u8>) {
        let mut state = self.state.lock();
        if !state.done {
            state.done = true;
            state.status = status;
            state.response = response;
        }
        drop(state);
        self.completed.notify_one();
    }
}

impl Link {
    /// Write one frame into the client→server ring and wake the service.
    fn send_frame(&self, header: &FrameHeader, payload: &[u8]) -> Result<(), Status> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(payload);

        {
            let _guard = self.tx.lock();
            if !self.view.client_to_server().write(&frame) {
                return Err(Status::RING_FULL);
            }
        }

        match self.socket.send_wake() {
            WakeResult::Sent | WakeResult::Coalesced => Ok(()),
            WakeResult::PeerDead => Err(Status::DISCONNECTED),
        }
    }

    /// Fail every still-pending call with `status` and wake the waiters.
    fn fail_pending(&self, status: Status) {
        let entries: Vec<Arc<PendingCall>> =
            self.pending.lock().drain().map(|(_, call)| call).collect();
        for call in entries {
            call.complete(status, Vec::new());
        }
    }
}

impl Client {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, ClientConfig::default())
    }

    /// # Panics
    ///
    /// Panics if the configured ring capacity is not a power of two of at
    /// least [`MIN_RING_CAPACITY`] bytes.
    pub fn with_config(name: impl Into<String>, config: ClientConfig) -> Self {
        assert!(
            config.ring_capacity >= MIN_RING_CAPACITY && config.ring_capacity.is_power_of_two(),
            "ring capacity must be a power of two ≥ {MIN_RING_CAPACITY}"
        );
        Self {
            name: name.into(),
            config,
            notify_handler: Arc::new(Mutex::new(None)),
            link: Mutex::new(None),
            receiver: Mutex::new(None),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().as_ref().is_some_and(|link| link.running.load(Ordering::Acquire))
    }

    /// Install (or replace) the notification callback.
    pub fn set_notify_handler(&self, handler: impl Fn(u32, &[u8]) + Send + Sync + 'static) {
        *self.notify_handler.lock() = Some(Arc::new(handler));
    }

    /// Connect with the defaults: current protocol version, 10 ms between
    /// attempts, up to 200 attempts.
    pub fn connect(&self) -> Result<(), ConnectError> {
        self.connect_with(PROTOCOL_VERSION, Duration::from_millis(10), 200)
    }

    /// Connect to the service, retrying the socket connect while the
    /// service is not (yet) listening, then create and share the region and
    /// run the version handshake. On any failure the partial state is torn
    /// down and nothing remains.
    pub fn connect_with(
        &self,
        version: u16,
        retry_delay: Duration,
        max_attempts: u32,
    ) -> Result<(), ConnectError> {
        let mut link_slot = self.link.lock();
        if let Some(existing) = link_slot.as_ref() {
            if existing.running.load(Ordering::Acquire) {
                return Err(ConnectError::AlreadyConnected);
            }
            // The previous connection died under us; finish tearing it down
            // before building a new one.
            link_slot.take();
            if let Some(handle) = self.receiver.lock().take() {
                let _ = handle.join();
            }
        }

        let conn = connect_with_retry(&self.name, retry_delay, max_attempts)?;

        let shm = ShmRegion::create(region_size(self.config.ring_capacity))
            .map_err(ConnectError::Region)?;
        // SAFETY: the region was just created and is not yet shared; the
        // mapping stays alive in `shm`, stored alongside the view.
        let view = unsafe { SharedRegionView::init(shm.region(), self.config.ring_capacity) };

        conn.send_with_fd(&version.to_le_bytes(), shm.fd()).map_err(ConnectError::Handshake)?;
        let ack = conn.recv_byte().map_err(ConnectError::Handshake)?;
        if ack == 0 {
            tracing::debug!(service = %self.name, version, "service rejected handshake");
            return Err(ConnectError::Rejected { offered: version });
        }

        let link = Arc::new(Link {
            socket: conn,
            view,
            shm,
            running: AtomicBool::new(true),
            next_seq: AtomicU32::new(1),
            tx: Mutex::new(()),
            pending: Mutex::new(HashMap::new()),
        });

        // A failed spawn tears the fresh link down with the other locals.
        let receiver_link = link.clone();
        let receiver_handlers = self.notify_handler.clone();
        let service = self.name.clone();
        let handle = thread::Builder::new()
            .name(format!("burrow-recv-{}", self.name))
            .spawn(move || receiver_loop(service, receiver_link, receiver_handlers))
            .map_err(ConnectError::Spawn)?;

        *link_slot = Some(link);
        *self.receiver.lock() = Some(handle);
        tracing::debug!(service = %self.name, "connected");
        Ok(())
    }

    /// Tear the connection down: unblock and join the receiver, fail every
    /// pending call with `STOPPED`, release the mapping and descriptors.
    /// Idempotent.
    pub fn disconnect(&self) {
        let link = self.link.lock().take();
        let Some(link) = link else { return };

        link.running.store(false, Ordering::Release);
        link.socket.shutdown();
        if let Some(handle) = self.receiver.lock().take() {
            let _ = handle.join();
        }

        // Whatever the receiver did not already fail is ours to fail.
        link.fail_pending(Status::STOPPED);
        tracing::debug!(service = %self.name, "disconnected");
    }

    /// Issue a request and wait up to `timeout` for its response.
    ///
    /// On success returns the response payload. Any non-`OK` status
    /// (the fabric's own, or an application status returned by the
    /// service's handler) surfaces as `Err`.
    pub fn call(
        &self,
        service_id: u32,
        method_id: u32,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, Status> {
        let link = self.link.lock().clone().ok_or(Status::DISCONNECTED)?;
        if !link.running.load(Ordering::Acquire) {
            return Err(Status::DISCONNECTED);
        }

        let seq = link.next_seq.fetch_add(1, Ordering::Relaxed);
        let header = FrameHeader::request(service_id, method_id, seq, request.len() as u32);

        // Register before the bytes become visible so even an instant
        // response finds its entry.
        let call = Arc::new(PendingCall::new());
        link.pending.lock().insert(seq, call.clone());

        if let Err(status) = link.send_frame(&header, request) {
            link.pending.lock().remove(&seq);
            return Err(status);
        }

        let deadline = Instant::now() + timeout;
        let mut state = call.state.lock();
        loop {
            if state.done {
                break;
            }
            if call.completed.wait_until(&mut state, deadline).timed_out() {
                if state.done {
                    break;
                }
                drop(state);
                link.pending.lock().remove(&seq);
                return Err(Status::TIMEOUT);
            }
        }

        let status = state.status;
        let response = mem::take(&mut state.response);
        drop(state);
        link.pending.lock().remove(&seq);

        if status.is_ok() {
            Ok(response)
        } else {
            Err(status)
        }
    }

    /// Send a notification to the service without waiting. Consumes no
    /// sequence number.
    pub fn notify(&self, service_id: u32, notify_id: u32, payload: &[u8]) -> Result<(), Status> {
        let link = self.link.lock().clone().ok_or(Status::DISCONNECTED)?;
        if !link.running.load(Ordering::Acquire) {
            return Err(Status::DISCONNECTED);
        }

        let header = FrameHeader::notify(service_id, notify_id, payload.len() as u32);
        link.send_frame(&header, payload)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn connect_with_retry(
    service: &str,
    retry_delay: Duration,
    max_attempts: u32,
) -> Result<Conn, ConnectError> {
    let mut last_error = None;
    for attempt in 0..max_attempts.max(1) {
        match socket::connect(service) {
            Ok(conn) => return Ok(conn),
            Err(err) => last_error = Some(err),
        }
        if attempt + 1 < max_attempts {
            thread::sleep(retry_delay);
        }
    }

    Err(ConnectError::Unreachable {
        service: service.to_string(),
        attempts: max_attempts.max(1),
        source: last_error
            .unwrap_or_else(|| std::io::Error::new(ErrorKind::Other, "no attempts made")),
    })
}

fn receiver_loop(service: String, link: Arc<Link>, handlers: Arc<Mutex<Option<NotifyHandler>>>) {
    while link.running.load(Ordering::Acquire) {
        if link.socket.recv_byte().is_err() {
            break;
        }
        if drain_incoming(&link, &handlers).is_err() {
            tracing::warn!(service = %service, "malformed frame from service, closing connection");
            break;
        }
    }

    // If the exit was peer-initiated (running still true), fail the waiters
    // here; a local disconnect fails them with STOPPED instead.
    if link.running.swap(false, Ordering::AcqRel) {
        link.socket.shutdown();
        link.fail_pending(Status::DISCONNECTED);
        tracing::debug!(service = %service, "receiver exited, connection lost");
    }
}

/// Drain every complete frame from the server→client ring. `Err` means a
/// protocol violation.
fn drain_incoming(link: &Arc<Link>, handlers: &Mutex<Option<NotifyHandler>>) -> Result<(), ()> {
    let ring = link.view.server_to_client();
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
            return Ok(());
        }

        ring.skip(FRAME_HEADER_SIZE as u32);
        let mut payload = vec![0u8; header.payload_len as usize];
        if header.payload_len > 0 {
            ring.read(&mut payload);
        }

        match header.kind() {
            Some(FrameKind::Response) => {
                let call = link.pending.lock().get(&header.seq).cloned();
                match call {
                    Some(call) => call.complete(Status::from_wire(header.aux), payload),
                    // Timed out and erased; a late response is dropped.
                    None => tracing::debug!(seq = header.seq, "dropping orphaned response"),
                }
            }
            Some(FrameKind::Notify) => {
                let handler = handlers.lock().clone();
                if let Some(handler) = handler {
                    handler(header.message_id, &payload);
                }
            }
            Some(FrameKind::Request) => {
                // Requests have no client-side meaning; skip the frame.
            }
            None => return Err(()),
        }
    }
}
