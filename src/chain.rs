use std::{
    io,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    task::{Context, Poll},
};

use anyhow::{bail, Result};
use base64::Engine;
use fast_socks5::{
    client::Socks5Stream, util::target_addr::TargetAddr, AuthenticationMethod, Socks5Command,
};
use hyper::{
    client::connect::{Connected, Connection},
    header, Body, Method, Request, StatusCode,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use wildmatch::WildMatch;

use crate::{
    config::Credentials,
    route::{HopKind, HopNode, Target},
};

pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// Stream handed to a hyper client connector; it already points at the
/// request's destination.
pub struct ConnectedStream(pub BoxedStream);

impl Connection for ConnectedStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl AsyncRead for ConnectedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for ConnectedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

#[derive(Debug)]
pub struct Hop {
    node: HopNode,
    bypass: Vec<WildMatch>,
}

impl From<HopNode> for Hop {
    fn from(node: HopNode) -> Self {
        let bypass = node.bypass.iter().map(|pattern| WildMatch::new(pattern)).collect();
        Self { node, bypass }
    }
}

impl Hop {
    fn bypasses(&self, host: &str) -> bool {
        self.bypass.iter().any(|pattern| pattern.matches(host))
    }
}

/// Ordered forward chain shared by every listener of a route.
#[derive(Debug, Default)]
pub struct Chain {
    hops: Vec<Hop>,
}

impl Chain {
    pub fn new(hops: Vec<HopNode>) -> Self {
        Self {
            hops: hops.into_iter().map(Hop::from).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    /// Opens a stream to `target` through the chain. The chain is cut just
    /// before the first hop whose bypass list matches the target host.
    pub async fn connect(&self, target: &Target) -> Result<BoxedStream> {
        let hops = self.route_for(&target.host);
        log::debug!("connect to {} through {} hop(s)", target, hops.len());
        dial(hops, target).await
    }

    fn route_for(&self, host: &str) -> &[Hop] {
        match self.hops.iter().position(|hop| hop.bypasses(host)) {
            Some(index) => &self.hops[..index],
            None => &self.hops,
        }
    }
}

#[async_recursion::async_recursion]
async fn dial(hops: &[Hop], target: &Target) -> Result<BoxedStream> {
    match hops.split_last() {
        None => direct_connect(target).await,
        Some((last, rest)) => {
            let stream = dial(rest, &last.node.address).await?;
            match last.node.kind {
                HopKind::Socks5 => socks5_connect(stream, &last.node, target).await,
                HopKind::Http => http_connect(stream, &last.node, target).await,
            }
        }
    }
}

async fn socks5_connect(
    stream: BoxedStream,
    hop: &HopNode,
    target: &Target,
) -> Result<BoxedStream> {
    let auth = hop
        .credentials
        .as_ref()
        .map(|Credentials { username, password }| AuthenticationMethod::Password {
            username: username.clone(),
            password: password.expose().to_owned(),
        });
    let target_addr = match target.host.parse::<IpAddr>() {
        Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, target.port)),
        Err(_) => TargetAddr::Domain(target.host.clone(), target.port),
    };
    let config = fast_socks5::client::Config::default();
    let mut socks = Socks5Stream::use_stream(stream, auth, config)
        .await
        .map_err(|error| {
            log::error!("socks5 handshake with {} failed: {}", hop.address, error);
            error
        })?;
    socks
        .request(Socks5Command::TCPConnect, target_addr)
        .await
        .map_err(|error| {
            log::error!("socks5 hop {} cannot reach {}: {}", hop.address, target, error);
            error
        })?;
    Ok(Box::new(socks.get_socket()))
}

async fn http_connect(
    stream: BoxedStream,
    hop: &HopNode,
    target: &Target,
) -> Result<BoxedStream> {
    let (mut sender, connection) = hyper::client::conn::handshake(stream).await?;
    let hop_address = hop.address.clone();
    tokio::spawn(async move {
        if let Err(error) = connection.await {
            log::debug!("http hop {} connection closed: {}", hop_address, error);
        }
    });
    let mut request = Request::builder()
        .method(Method::CONNECT)
        .uri(target.address())
        .header(header::HOST, target.address());
    if let Some(credentials) = &hop.credentials {
        request = request.header(header::PROXY_AUTHORIZATION, basic_auth(credentials));
    }
    let response = sender.send_request(request.body(Body::empty())?).await?;
    if response.status() != StatusCode::OK {
        log::error!(
            "http hop {} refused CONNECT to {}: {}",
            hop.address,
            target,
            response.status()
        );
        bail!("http hop {} answered {}", hop.address, response.status());
    }
    let upgraded = hyper::upgrade::on(response).await?;
    Ok(Box::new(upgraded))
}

fn basic_auth(credentials: &Credentials) -> String {
    let token = base64::engine::general_purpose::STANDARD.encode(format!(
        "{}:{}",
        credentials.username,
        credentials.password.expose()
    ));
    format!("Basic {}", token)
}

async fn direct_connect(target: &Target) -> Result<BoxedStream> {
    let address = target.address();
    let stream = TcpStream::connect(&address).await.map_err(|error| {
        log::error!(
            "failed to create a direct connection with {}: {}",
            address,
            error
        );
        error
    })?;
    Ok(Box::new(stream))
}
