use std::{convert::Infallible, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use anyhow::Context;
use futures::FutureExt;
use tokio::{io::AsyncReadExt, net::TcpStream};

use crate::{config::ClientDefinition, diagnostics::ClientStatus};

/// Pause between the end of one control session and the next attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunnel-client engine: runs one control-channel session to completion.
#[async_trait::async_trait]
pub trait ControlChannel: Send + Sync {
    /// Returns when the session ends, whatever the reason.
    async fn run_session(&self, client: &ClientDefinition) -> anyhow::Result<()>;
}

/// Holds a TCP connection to the client's server until the peer closes it.
/// The control protocol spoken over it belongs to the tunnel engine.
pub struct TcpSessionChannel {
    connect_timeout: Duration,
}

impl Default for TcpSessionChannel {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

#[async_trait::async_trait]
impl ControlChannel for TcpSessionChannel {
    async fn run_session(&self, client: &ClientDefinition) -> anyhow::Result<()> {
        let mut stream =
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(&client.server_addr))
                .await
                .with_context(|| format!("timed out connecting to {}", client.server_addr))?
                .with_context(|| format!("failed to connect to {}", client.server_addr))?;
        log::info!(
            "[{}] control channel to {} established, {} proxy mapping(s)",
            client.name,
            client.server_addr,
            client.proxies.len()
        );
        let mut buf = [0u8; 4096];
        loop {
            if stream.read(&mut buf).await? == 0 {
                return Ok(());
            }
        }
    }
}

/// Keeps one client connected: session, fixed delay, session, forever.
pub struct ClientSupervisor<C: ?Sized> {
    client: Arc<ClientDefinition>,
    channel: Arc<C>,
    status: Arc<ClientStatus>,
    delay: Duration,
}

impl<C: ControlChannel + ?Sized> ClientSupervisor<C> {
    pub fn new(client: Arc<ClientDefinition>, channel: Arc<C>, status: Arc<ClientStatus>) -> Self {
        Self {
            client,
            channel,
            status,
            delay: RECONNECT_DELAY,
        }
    }

    pub async fn run(self) -> Infallible {
        let name = &self.client.name;
        loop {
            let attempt = self.status.begin_session();
            log::debug!(
                "[{}] connecting to {} (attempt {})",
                name,
                self.client.server_addr,
                attempt
            );
            let session = AssertUnwindSafe(self.channel.run_session(&self.client)).catch_unwind();
            match session.await {
                Ok(Ok(())) => log::info!("[{}] control channel closed", name),
                Ok(Err(error)) => {
                    self.status.record_failure();
                    log::warn!("[{}] control channel ended: {:#}", name, error);
                }
                Err(_) => {
                    self.status.record_failure();
                    log::error!("[{}] control channel panicked", name);
                }
            }
            tokio::time::sleep(self.delay).await;
        }
    }
}
