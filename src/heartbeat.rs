use std::{convert::Infallible, future::Future, pin::Pin, sync::Arc, task, time::Duration};

use anyhow::{bail, Context};
use hyper::{Body, Client, Uri};
use rustls::{pki_types::ServerName, ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::{chain::ConnectedStream, diagnostics::HeartbeatStatus};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Collector URL and device id, fixed for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatTarget {
    pub url: String,
    pub device_id: String,
}

impl HeartbeatTarget {
    pub fn endpoint(&self) -> String {
        format!("{}/{}", self.url, self.device_id)
    }

    /// Rejects endpoints the pinger could never reach.
    pub fn validate(&self) -> anyhow::Result<()> {
        let endpoint = self.endpoint();
        let uri: Uri = endpoint
            .parse()
            .with_context(|| format!("invalid heartbeat url \"{}\"", endpoint))?;
        scheme_port(&uri)?;
        anyhow::ensure!(uri.host().is_some(), "heartbeat url \"{}\" has no host", endpoint);
        Ok(())
    }
}

/// Default port of a supported collector scheme, and whether it needs TLS.
fn scheme_port(uri: &Uri) -> anyhow::Result<(u16, bool)> {
    match uri.scheme_str() {
        Some("http") => Ok((80, false)),
        Some("https") => Ok((443, true)),
        Some(other) => bail!("unsupported heartbeat scheme \"{}\"", other),
        None => bail!("heartbeat url \"{}\" has no scheme", uri),
    }
}

#[async_trait::async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self, url: &str) -> anyhow::Result<()>;
}

/// Dials `http` collectors in the clear and `https` ones over rustls.
#[derive(Clone)]
struct CollectorConnector {
    tls: TlsConnector,
}

impl CollectorConnector {
    fn new(roots: RootCertStore) -> Self {
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            tls: TlsConnector::from(Arc::new(config)),
        }
    }
}

impl hyper::service::Service<Uri> for CollectorConnector {
    type Response = ConnectedStream;
    type Error = anyhow::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _: &mut task::Context<'_>) -> task::Poll<Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let tls = self.tls.clone();
        Box::pin(async move {
            let (default_port, secure) = scheme_port(&uri)?;
            let host = uri
                .host()
                .context("heartbeat url has no host")?
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_owned();
            let port = uri.port_u16().unwrap_or(default_port);
            let stream = TcpStream::connect((host.as_str(), port))
                .await
                .with_context(|| format!("failed to connect to collector {}:{}", host, port))?;
            if !secure {
                return Ok(ConnectedStream(Box::new(stream)));
            }
            let server_name = ServerName::try_from(host)?;
            let stream = tls
                .connect(server_name, stream)
                .await
                .context("TLS handshake with collector failed")?;
            Ok(ConnectedStream(Box::new(stream)))
        })
    }
}

/// HTTP(S) GET; the body is read and dropped.
pub struct HttpPinger {
    client: Client<CollectorConnector, Body>,
    timeout: Duration,
}

impl HttpPinger {
    pub fn with_roots(roots: RootCertStore) -> Self {
        Self {
            client: Client::builder().build(CollectorConnector::new(roots)),
            timeout: REQUEST_TIMEOUT,
        }
    }
}

impl Default for HttpPinger {
    fn default() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_roots(roots)
    }
}

#[async_trait::async_trait]
impl Pinger for HttpPinger {
    async fn ping(&self, url: &str) -> anyhow::Result<()> {
        let uri: Uri = url
            .parse()
            .with_context(|| format!("invalid heartbeat url \"{}\"", url))?;
        let exchange = async {
            let response = self.client.get(uri).await?;
            let status = response.status();
            hyper::body::to_bytes(response.into_body())
                .await
                .context("read body error")?;
            anyhow::ensure!(status.is_success(), "collector answered {}", status);
            Ok::<(), anyhow::Error>(())
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .context("heartbeat request timed out")?
    }
}

pub struct HeartbeatBeacon<P> {
    target: HeartbeatTarget,
    pinger: P,
    interval: Duration,
    status: Arc<HeartbeatStatus>,
}

impl<P: Pinger> HeartbeatBeacon<P> {
    pub fn new(target: HeartbeatTarget, pinger: P, status: Arc<HeartbeatStatus>) -> Self {
        Self {
            target,
            pinger,
            interval: HEARTBEAT_INTERVAL,
            status,
        }
    }

    /// Pings the collector once per interval, forever. The timer restarts
    /// after every attempt whatever its outcome.
    pub async fn run(self) -> Infallible {
        let endpoint = self.target.endpoint();
        log::info!("heartbeat to {} every {}s", endpoint, self.interval.as_secs());
        loop {
            tokio::time::sleep(self.interval).await;
            match self.pinger.ping(&endpoint).await {
                Ok(()) => {
                    log::trace!("heartbeat sent to {}", endpoint);
                    self.status.record(true);
                }
                Err(error) => {
                    log::debug!("heartbeat to {} failed: {:#}", endpoint, error);
                    self.status.record(false);
                }
            }
        }
    }
}
