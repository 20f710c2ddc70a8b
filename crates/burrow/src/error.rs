//! Setup-path errors. Wire-visible failures are [`Status`](crate::Status)
//! values; these enums cover the fallible plumbing before a connection (or a
//! service) exists.

use std::io;

/// Why [`Client::connect`](crate::Client::connect) failed. Partial state is
/// torn down before the error is returned; a failed connect leaves nothing
/// behind.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The service endpoint never became connectable within the retry
    /// budget.
    #[error("could not reach service '{service}' after {attempts} attempts: {source}")]
    Unreachable {
        service: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    /// Creating or mapping the shared region failed.
    #[error("failed to create shared region: {0}")]
    Region(#[source] io::Error),

    /// The handshake datagram or ack could not be exchanged.
    #[error("handshake failed: {0}")]
    Handshake(#[source] io::Error),

    /// The service rejected the offered protocol version.
    #[error("service rejected protocol version {offered}")]
    Rejected { offered: u16 },

    /// The receiver thread could not be spawned.
    #[error("failed to spawn receiver thread: {0}")]
    Spawn(#[source] io::Error),

    /// The client is already connected.
    #[error("already connected")]
    AlreadyConnected,
}

/// Why [`Service::start`](crate::Service::start) failed.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// The endpoint name is taken, most likely because another instance of this
    /// service is already running on this host.
    #[error("endpoint for service '{service}' is unavailable: {source}")]
    Bind {
        service: String,
        #[source]
        source: io::Error,
    },

    /// The accept thread could not be spawned.
    #[error("failed to spawn accept thread: {0}")]
    Spawn(#[source] io::Error),

    /// The service is already running.
    #[error("already running")]
    AlreadyRunning,
}
