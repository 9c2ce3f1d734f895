//! The donor side of a handover (§4.J): publishes a Unix socket advertising a listener to hand
//! off, and transfers it to the first recipient that connects.

use std::{
    os::fd::{AsRawFd, RawFd},
    path::PathBuf,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::{
    io::{AsyncReadExt, Interest},
    net::{TcpListener, UnixListener},
};
use tracing::{debug, info, warn};

use crate::{
    error::{HandoverError, HandoverResult},
    protocol::{self, ACK_LINE, REQ_LINE},
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A published handover socket, ready to hand a listener off to the first recipient that
/// connects. Removes its socket file on drop.
pub struct Donor {
    socket_path: PathBuf,
    listener: UnixListener,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Donor {
    /// Publishes a new donor socket under `dir`, named per §4.J's `rf-handover-<unix-seconds>.sock`
    /// grammar. Creates `dir` if it doesn't already exist.
    pub async fn publish(dir: impl Into<PathBuf>) -> HandoverResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let unix_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let socket_path = dir.join(protocol::socket_filename(unix_secs));

        let listener = UnixListener::bind(&socket_path)?;
        info!(path = %socket_path.display(), "published handover socket");

        Ok(Self { socket_path, listener })
    }

    /// The path of the published socket.
    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    /// Waits up to `timeout` for a recipient to connect, then runs the handshake and transfers
    /// `tcp_listener`'s file descriptor to it. On success the caller's listener remains valid
    /// (the recipient received a duplicate), but the caller must stop accepting on it and begin
    /// a graceful shutdown per §4.J step 5.
    pub async fn hand_off(&self, tcp_listener: &TcpListener, timeout: Duration) -> HandoverResult<()> {
        tokio::time::timeout(timeout, self.hand_off_inner(tcp_listener)).await?
    }

    async fn hand_off_inner(&self, tcp_listener: &TcpListener) -> HandoverResult<()> {
        let (stream, _addr) = self.listener.accept().await?;
        debug!("recipient connected to handover socket");

        let mut greeting = [0u8; REQ_LINE.len()];
        stream.readable().await?;
        let mut reader = &stream;
        AsyncReadExt::read_exact(&mut reader, &mut greeting).await?;
        if greeting != *REQ_LINE {
            return Err(HandoverError::UnexpectedGreeting(greeting.to_vec()));
        }

        let listener_fd = tcp_listener.as_raw_fd();
        send_ack_with_fd(&stream, listener_fd).await?;
        info!("handed off listener to recipient");

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn send_ack_with_fd(stream: &tokio::net::UnixStream, fd: RawFd) -> HandoverResult<()> {
    loop {
        stream.writable().await?;
        match stream.try_io(Interest::WRITABLE, || {
            protocol::send_with_fd(stream.as_raw_fd(), ACK_LINE, fd).map_err(std::io::Error::other)
        }) {
            Ok(_) => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                warn!("handover ack write would block, retrying");
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for Donor {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}
