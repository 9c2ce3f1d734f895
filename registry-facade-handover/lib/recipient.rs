//! The recipient side of a handover (§4.J): finds the most recently published donor socket in a
//! directory, connects to it, and recovers the donor's listening file descriptor.

use std::os::fd::{FromRawFd, RawFd};
use std::path::Path;
use std::time::Duration;

use tokio::{
    io::Interest,
    net::{TcpListener, UnixStream},
};
use tracing::{debug, info, warn};

use crate::{
    error::{HandoverError, HandoverResult},
    protocol::{self, ACK_LINE, REQ_LINE},
};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Attempts to recover a handed-off [`TcpListener`] from the donor publishing in `dir`, per §4.J.
///
/// Picks the lexicographically greatest `rf-handover-<unix-seconds>.sock` filename in `dir`
/// (donor timestamps sort monotonically, so this is the most recent donor), connects to it, runs
/// the greeting/ack handshake, and recovers the transferred listener file descriptor. Returns
/// `Err(HandoverError::NoDonor)` if no donor socket is present, which the caller must treat as a
/// signal to fall back to binding its own listener rather than a hard failure.
pub async fn recover(dir: impl AsRef<Path>, timeout: Duration) -> HandoverResult<TcpListener> {
    let dir = dir.as_ref();
    let Some(socket_path) = protocol::pick_latest_socket(dir)? else {
        return Err(HandoverError::NoDonor);
    };

    tokio::time::timeout(timeout, recover_from(&socket_path)).await?
}

async fn recover_from(socket_path: &Path) -> HandoverResult<TcpListener> {
    debug!(path = %socket_path.display(), "connecting to donor handover socket");
    let stream = UnixStream::connect(socket_path).await?;

    stream.writable().await?;
    send_greeting(&stream).await?;
    info!("sent handover greeting, awaiting ack");

    let fd = recv_ack_with_fd(&stream).await?;

    // SAFETY: `fd` is a freshly received, owned duplicate of the donor's listening socket,
    // handed to us exactly once via SCM_RIGHTS; no other code holds or closes it.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(std_listener)?;

    info!("recovered listener from donor");
    Ok(listener)
}

async fn send_greeting(stream: &UnixStream) -> HandoverResult<()> {
    loop {
        stream.writable().await?;
        match stream.try_write(REQ_LINE) {
            Ok(n) if n == REQ_LINE.len() => return Ok(()),
            Ok(_) => return Err(HandoverError::Io(std::io::Error::other("short handover write"))),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

async fn recv_ack_with_fd(stream: &UnixStream) -> HandoverResult<RawFd> {
    use std::os::fd::AsRawFd;

    let mut buf = [0u8; ACK_LINE.len()];
    loop {
        stream.readable().await?;
        match stream.try_io(Interest::READABLE, || {
            protocol::recv_with_fd(stream.as_raw_fd(), &mut buf).map_err(std::io::Error::other)
        }) {
            Ok((n, fd)) => {
                if n != ACK_LINE.len() || buf != *ACK_LINE {
                    if let Some(fd) = fd {
                        // Reply was malformed; close the unexpectedly-received fd rather than leak it.
                        unsafe { std::net::TcpListener::from_raw_fd(fd) };
                    }
                    return Err(HandoverError::UnexpectedReply(buf[..n.min(buf.len())].to_vec()));
                }
                return fd.ok_or(HandoverError::NoFileDescriptor);
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                warn!("handover ack read would block, retrying");
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recover_reports_no_donor_when_directory_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = recover(dir.path(), Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, HandoverError::NoDonor));
    }

    #[tokio::test]
    async fn recover_reports_no_donor_when_directory_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let err = recover(&missing, Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, HandoverError::NoDonor));
    }

    #[tokio::test]
    async fn full_handover_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();

        let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp_listener.local_addr().unwrap();

        let donor = crate::donor::Donor::publish(dir.path()).await.unwrap();

        let dir_path = dir.path().to_path_buf();
        let recipient_task = tokio::spawn(async move { recover(&dir_path, Duration::from_secs(5)).await });

        donor.hand_off(&tcp_listener, Duration::from_secs(5)).await.unwrap();

        let recovered = recipient_task.await.unwrap().unwrap();
        assert_eq!(recovered.local_addr().unwrap().port(), addr.port());
    }
}
