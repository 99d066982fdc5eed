//! Local port forwarding through an SSH server.
//!
//! A listener on `local_bind_address:port` accepts connections and forwards
//! each one over an SSH `direct-tcpip` channel to the document store's
//! `host:port`, as seen from the SSH server.

use async_trait::async_trait;
use metastore_query::{DataError, Result, SshCredentials};
use russh::client::{self, Handle};
use russh::Disconnect;
use russh_keys::key::PublicKey;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Accepts the server key of the bastion host
struct TunnelHandler {
    ssh_host: String,
}

#[async_trait]
impl client::Handler for TunnelHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        debug!(
            "Accepting host key {} for {}",
            server_public_key.fingerprint(),
            self.ssh_host
        );
        Ok(true)
    }
}

/// An open SSH tunnel. Dropping it stops forwarding; [`SshTunnel::close`]
/// also disconnects the SSH session.
pub struct SshTunnel {
    local_addr: SocketAddr,
    session: Arc<Handle<TunnelHandler>>,
    forwarder: JoinHandle<()>,
}

impl SshTunnel {
    /// Connect and authenticate to the SSH server, then start forwarding
    pub async fn open(credentials: &SshCredentials) -> Result<Self> {
        let ssh_addr = (credentials.ssh_host.as_str(), credentials.ssh_port);
        debug!(
            "Opening SSH session to {}:{}",
            credentials.ssh_host, credentials.ssh_port
        );

        let config = Arc::new(client::Config::default());
        let handler = TunnelHandler {
            ssh_host: credentials.ssh_host.clone(),
        };
        let mut session = client::connect(config, ssh_addr, handler)
            .await
            .map_err(|e| {
                error!("Failed to connect to SSH host {}: {}", credentials.ssh_host, e);
                DataError::connection(format!(
                    "Failed to connect to SSH host {}:{}: {}",
                    credentials.ssh_host, credentials.ssh_port, e
                ))
            })?;

        let authenticated = session
            .authenticate_password(
                credentials.ssh_username.clone(),
                credentials.ssh_password_str().to_string(),
            )
            .await
            .map_err(|e| DataError::connection(format!("SSH authentication failed: {}", e)))?;
        if !authenticated {
            return Err(DataError::connection(format!(
                "SSH authentication rejected for user {}",
                credentials.ssh_username
            )));
        }

        let bind = (
            credentials.local_bind_address.as_str(),
            credentials.store.port,
        );
        let listener = TcpListener::bind(bind).await.map_err(|e| {
            DataError::connection(format!(
                "Failed to bind local tunnel address {}:{}: {}",
                credentials.local_bind_address, credentials.store.port, e
            ))
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| DataError::connection(format!("Failed to read local address: {}", e)))?;

        let session = Arc::new(session);
        let forwarder = tokio::spawn(forward_connections(
            listener,
            session.clone(),
            credentials.store.host.clone(),
            credentials.store.port,
        ));

        info!(
            "SSH tunnel open: {} -> {}:{} via {}",
            local_addr, credentials.store.host, credentials.store.port, credentials.ssh_host
        );

        Ok(Self {
            local_addr,
            session,
            forwarder,
        })
    }

    /// Local address the tunnel listens on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop forwarding and disconnect the SSH session
    pub async fn close(&self) -> Result<()> {
        self.forwarder.abort();
        self.session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| DataError::connection(format!("Failed to close SSH session: {}", e)))?;
        info!("SSH tunnel on {} closed", self.local_addr);
        Ok(())
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

async fn forward_connections(
    listener: TcpListener,
    session: Arc<Handle<TunnelHandler>>,
    remote_host: String,
    remote_port: u16,
) {
    // Dropping the set (when this task is aborted) aborts every live connection
    let mut connections = JoinSet::new();

    loop {
        while connections.try_join_next().is_some() {}

        let (mut socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Tunnel accept failed: {}", e);
                continue;
            }
        };
        debug!("Forwarding connection from {}", peer);

        let session = session.clone();
        let remote_host = remote_host.clone();
        connections.spawn(async move {
            let channel = match session
                .channel_open_direct_tcpip(
                    remote_host.clone(),
                    u32::from(remote_port),
                    peer.ip().to_string(),
                    u32::from(peer.port()),
                )
                .await
            {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(
                        "Failed to open channel to {}:{}: {}",
                        remote_host, remote_port, e
                    );
                    return;
                }
            };

            let mut stream = channel.into_stream();
            if let Err(e) = tokio::io::copy_bidirectional(&mut socket, &mut stream).await {
                debug!("Tunnel connection from {} ended: {}", peer, e);
            }
        });
    }
}
