//! SSH-tunneled transport for remote libvirt sockets.
//!
//! A tunnel binds a throwaway local UNIX socket and bridges every accepted
//! connection to the remote libvirt socket over a `direct-streamlocal`
//! channel. The libvirt session is then opened against the local socket, so
//! the RPC layer never knows it is crossing SSH.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use russh::{
    Disconnect, client,
    keys::{self, PrivateKeyWithHashAlg},
};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::DriverError;

const SSH_CONNECT_TIMEOUT_SECONDS: u64 = 15;

/// Accepts every server key. Hosts are registered explicitly by the
/// operator, which is the trust decision; a pinning store could be threaded
/// through here later.
struct AcceptingHandler;

impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// A live tunnel. Closing it stops the forward loop, disconnects the SSH
/// session and removes the local socket.
pub struct SshTunnel {
    local_socket: PathBuf,
    cancel: CancellationToken,
}

impl SshTunnel {
    /// Dials `user@host:port` with the caller's default private key and
    /// starts forwarding a fresh local socket to `remote_socket`.
    pub async fn open(
        user: &str,
        host: &str,
        port: u16,
        remote_socket: &str,
    ) -> Result<SshTunnel, DriverError> {
        let config = Arc::new(client::Config::default());

        let connect_result = timeout(
            Duration::from_secs(SSH_CONNECT_TIMEOUT_SECONDS),
            client::connect(config, (host, port), AcceptingHandler),
        )
        .await;

        let mut session = match connect_result {
            Ok(Ok(session)) => session,
            Ok(Err(error)) => return Err(DriverError::Dial(error.to_string())),
            Err(_) => {
                return Err(DriverError::Dial(format!(
                    "SSH connection to {host}:{port} timed out"
                )));
            }
        };

        let key_path = default_key_path()?;
        let key_pair = keys::load_secret_key(&key_path, None).map_err(|e| {
            DriverError::Handshake(format!(
                "unable to read private key from {}: {e}",
                key_path.display()
            ))
        })?;
        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .map_err(|e| DriverError::Handshake(e.to_string()))?
            .flatten();
        let key = PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

        let auth = session
            .authenticate_publickey(user.to_string(), key)
            .await
            .map_err(|e| DriverError::Handshake(e.to_string()))?;
        if !auth.success() {
            return Err(DriverError::Handshake(format!(
                "SSH authentication failed for user {user}"
            )));
        }

        let local_socket =
            std::env::temp_dir().join(format!("virtumancer-{}.sock", Uuid::new_v4()));
        let listener = UnixListener::bind(&local_socket)
            .map_err(|e| DriverError::Dial(format!("failed to bind tunnel socket: {e}")))?;

        let cancel = CancellationToken::new();
        tokio::spawn(forward_loop(
            session,
            listener,
            remote_socket.to_string(),
            cancel.clone(),
        ));

        debug!(host, port, socket = %local_socket.display(), "SSH tunnel established");
        Ok(SshTunnel {
            local_socket,
            cancel,
        })
    }

    pub fn local_socket(&self) -> &Path {
        &self.local_socket
    }

    /// Idempotent teardown.
    pub fn close(&self) {
        self.cancel.cancel();
        if let Err(error) = std::fs::remove_file(&self.local_socket)
            && error.kind() != std::io::ErrorKind::NotFound
        {
            debug!(socket = %self.local_socket.display(), %error, "failed to remove tunnel socket");
        }
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn forward_loop(
    session: client::Handle<AcceptingHandler>,
    listener: UnixListener,
    remote_socket: String,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(error) => {
                        warn!(%error, "tunnel listener failed");
                        break;
                    }
                };

                match session
                    .channel_open_direct_streamlocal(remote_socket.as_str())
                    .await
                {
                    Ok(channel) => {
                        tokio::spawn(bridge(stream, channel));
                    }
                    Err(error) => {
                        warn!(%error, remote = %remote_socket, "failed to open forward channel");
                    }
                }
            }
        }
    }

    if let Err(error) = session
        .disconnect(Disconnect::ByApplication, "tunnel closed", "en")
        .await
    {
        debug!(%error, "failed to gracefully close SSH session");
    }
}

async fn bridge(mut stream: UnixStream, channel: russh::Channel<client::Msg>) {
    let mut channel_stream = channel.into_stream();
    if let Err(error) = tokio::io::copy_bidirectional(&mut stream, &mut channel_stream).await {
        debug!(%error, "tunnel stream ended");
    }
}

fn default_key_path() -> Result<PathBuf, DriverError> {
    let home = std::env::var("HOME")
        .map_err(|_| DriverError::Handshake("could not determine home directory".to_string()))?;
    Ok(Path::new(&home).join(".ssh").join("id_rsa"))
}
