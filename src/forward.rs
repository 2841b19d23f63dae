use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::{
    chain::Chain,
    diagnostics::RouterStatus,
    route::{ListenAddr, ListenKind, Target},
    router::Router,
};

/// Forwards every accepted connection to a fixed target through the chain,
/// terminating TLS first when an acceptor is set.
pub struct ForwardRouter {
    address: ListenAddr,
    target: Target,
    chain: Arc<Chain>,
    tls: Option<TlsAcceptor>,
}

impl ForwardRouter {
    pub fn new(
        address: ListenAddr,
        target: Target,
        chain: Arc<Chain>,
        tls: Option<TlsAcceptor>,
    ) -> Self {
        Self {
            address,
            target,
            chain,
            tls,
        }
    }

    fn kind(&self) -> ListenKind {
        if self.tls.is_some() {
            ListenKind::Tls
        } else {
            ListenKind::Tcp
        }
    }

    pub async fn run(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, client_addr) = listener.accept().await?;
            let target = self.target.clone();
            let chain = self.chain.clone();
            let tls = self.tls.clone();
            tokio::spawn(async move {
                log::debug!("connection accepted: {} -> {}", &client_addr, &target);
                if let Err(error) = forward(stream, &target, &chain, tls).await {
                    log::debug!(
                        "an error occurred forwarding {} to {}; error = {:#}",
                        client_addr,
                        target,
                        error
                    );
                };
            });
        }
    }
}

#[async_trait::async_trait]
impl Router for ForwardRouter {
    fn describe(&self) -> String {
        format!("{}://{}/{}", self.kind().scheme(), self.address, self.target)
    }

    async fn serve(&self, status: &RouterStatus) -> anyhow::Result<()> {
        let listener = self.address.bind().await?;
        status.set_serving(true);
        log::info!("{} listening", self.describe());
        self.run(listener).await
    }
}

async fn forward(
    stream: TcpStream,
    target: &Target,
    chain: &Chain,
    tls: Option<TlsAcceptor>,
) -> anyhow::Result<()> {
    match tls {
        Some(acceptor) => {
            let mut stream = acceptor.accept(stream).await?;
            let mut upstream = chain.connect(target).await?;
            tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
        }
        None => {
            let mut stream = stream;
            let mut upstream = chain.connect(target).await?;
            tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use rustls::{
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
        ClientConfig, DigitallySignedStruct, SignatureScheme,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::TlsConnector;

    use super::*;
    use crate::tls;

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        addr
    }

    async fn start(tls: Option<TlsAcceptor>, target: SocketAddr) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = ForwardRouter::new(
            ListenAddr::Ip(addr),
            Target::new(target.ip().to_string(), target.port()),
            Arc::new(Chain::default()),
            tls,
        );
        tokio::spawn(async move { router.run(listener).await });
        addr
    }

    #[test]
    fn describe_includes_scheme_and_target() {
        let router = ForwardRouter::new(
            ListenAddr::Ip("0.0.0.0:2222".parse().unwrap()),
            Target::new("10.0.0.5", 22),
            Arc::new(Chain::default()),
            None,
        );
        assert_eq!(router.describe(), "tcp://0.0.0.0:2222/10.0.0.5:22");
    }

    #[tokio::test]
    async fn serving_is_reported_only_after_bind() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let router = ForwardRouter::new(
            ListenAddr::Ip(taken.local_addr().unwrap()),
            Target::new("10.0.0.5", 22),
            Arc::new(Chain::default()),
            None,
        );
        let status = RouterStatus::new(router.describe());
        assert!(router.serve(&status).await.is_err());
        assert!(!status.is_serving());

        let router = ForwardRouter::new(
            ListenAddr::parse("127.0.0.1:0").unwrap(),
            Target::new("10.0.0.5", 22),
            Arc::new(Chain::default()),
            None,
        );
        let status = Arc::new(RouterStatus::new(router.describe()));
        let serving = status.clone();
        tokio::spawn(async move { router.serve(&serving).await });
        while !status.is_serving() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn tcp_forwarding() {
        let echo = echo_server().await;
        let addr = start(None, echo).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn unreachable_target_drops_only_that_connection() {
        let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = unused.local_addr().unwrap();
        drop(unused);
        let addr = start(None, dead).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap_or(0), 0);

        assert!(TcpStream::connect(addr).await.is_ok());
    }

    #[derive(Debug)]
    struct AcceptAnyCert;

    impl ServerCertVerifier for AcceptAnyCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    #[tokio::test]
    async fn tls_termination_with_generated_identity() {
        let identity = tls::generate().unwrap();
        let echo = echo_server().await;
        let addr = start(Some(identity.acceptor()), echo).await;

        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut stream = connector
            .connect(ServerName::try_from("localhost").unwrap(), stream)
            .await
            .unwrap();
        stream.write_all(b"secret").await.unwrap();
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"secret");
    }
}
