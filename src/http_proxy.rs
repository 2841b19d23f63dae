use core::{task, task::Poll};
use std::{future::Future, pin::Pin, sync::Arc};

use hyper::{
    http::{self, uri::Authority},
    server::conn::AddrIncoming,
    Body, Client, Method, Request, Response, Server, Uri,
};

use crate::{
    chain::{Chain, ConnectedStream},
    diagnostics::RouterStatus,
    route::{ListenAddr, Target},
    router::Router,
};

/// Plain HTTP proxy: absolute-form requests are relayed, `CONNECT` opens a
/// raw tunnel. Upstream connections go through the route's chain.
pub struct HttpProxyRouter {
    address: ListenAddr,
    chain: Arc<Chain>,
}

impl HttpProxyRouter {
    pub fn new(address: ListenAddr, chain: Arc<Chain>) -> Self {
        Self { address, chain }
    }
}

#[async_trait::async_trait]
impl Router for HttpProxyRouter {
    fn describe(&self) -> String {
        format!("http://{}", self.address)
    }

    async fn serve(&self, status: &RouterStatus) -> anyhow::Result<()> {
        let make_service = MakeHttpProxy {
            chain: self.chain.clone(),
        };
        let incoming = AddrIncoming::from_listener(self.address.bind().await?)?;
        status.set_serving(true);
        let server = Server::builder(incoming)
            .http1_preserve_header_case(true)
            .http1_title_case_headers(true)
            .serve(make_service);
        log::info!("{} listening", self.describe());
        Ok(server.await?)
    }
}

#[derive(Debug)]
struct HttpProxy {
    chain: Arc<Chain>,
}

impl hyper::service::Service<Request<Body>> for HttpProxy {
    type Response = Response<Body>;
    type Error = anyhow::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        Ok(()).into()
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        Box::pin(proxy(req, self.chain.clone()))
    }
}

struct MakeHttpProxy {
    chain: Arc<Chain>,
}

impl<T> hyper::service::Service<T> for MakeHttpProxy {
    type Response = HttpProxy;
    type Error = std::io::Error;
    type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        Ok(()).into()
    }

    fn call(&mut self, _: T) -> Self::Future {
        std::future::ready(Ok(HttpProxy {
            chain: self.chain.clone(),
        }))
    }
}

#[derive(Clone)]
struct ChainConnector {
    target: Target,
    chain: Arc<Chain>,
}

impl hyper::service::Service<Uri> for ChainConnector {
    type Response = ConnectedStream;
    type Error = anyhow::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _: &mut task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _: Uri) -> Self::Future {
        let target = self.target.clone();
        let chain = self.chain.clone();
        Box::pin(async move { Ok(ConnectedStream(chain.connect(&target).await?)) })
    }
}

async fn proxy(req: Request<Body>, chain: Arc<Chain>) -> Result<Response<Body>, anyhow::Error> {
    let target = match request_target(&req) {
        Some(target) => target,
        None => {
            log::debug!("no usable target in http request to {}; drop", req.uri());
            return respond_status(http::StatusCode::BAD_REQUEST);
        }
    };
    if req.method() == Method::CONNECT {
        return tunnel(req, target, chain).await;
    }
    let connector = ChainConnector {
        target: target.clone(),
        chain,
    };
    let client = Client::builder()
        .http1_title_case_headers(true)
        .http1_preserve_header_case(true)
        .set_host(false)
        .build(connector);
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|value| value.as_str())
        .unwrap_or("/");
    let new_uri = Uri::builder()
        .scheme("http")
        .authority(target.address().as_str())
        .path_and_query(path_and_query)
        .build()?;
    let builder = Request::builder()
        .method(req.method())
        .uri(new_uri)
        .version(req.version());
    let builder = req
        .headers()
        .iter()
        .filter(|(key, _)| !is_hop_by_hop(key))
        .fold(builder, |builder, (key, value)| builder.header(key, value));
    let new_req = builder.body(req.into_body())?;
    match client.request(new_req).await {
        Ok(response) => Ok(response),
        Err(error) => {
            log::debug!("upstream request to {} failed: {}", target, error);
            respond_status(http::StatusCode::BAD_GATEWAY)
        }
    }
}

async fn tunnel(
    req: Request<Body>,
    target: Target,
    chain: Arc<Chain>,
) -> Result<Response<Body>, anyhow::Error> {
    let mut upstream = match chain.connect(&target).await {
        Ok(upstream) => upstream,
        Err(error) => {
            log::debug!("CONNECT to {} failed: {:#}", target, error);
            return respond_status(http::StatusCode::BAD_GATEWAY);
        }
    };
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(mut upgraded) => {
                let copied = tokio::io::copy_bidirectional(&mut upgraded, &mut upstream).await;
                if let Err(error) = copied {
                    log::debug!("tunnel to {} closed with error: {}", target, error);
                }
            }
            Err(error) => log::debug!("CONNECT upgrade for {} failed: {}", target, error),
        }
    });
    respond_status(http::StatusCode::OK)
}

/// Destination of a proxied request: the CONNECT authority, the absolute
/// URI, or the Host header for origin-form requests.
fn request_target(req: &Request<Body>) -> Option<Target> {
    let default_port = if req.method() == Method::CONNECT {
        443
    } else {
        80
    };
    let authority = match req.uri().authority() {
        Some(authority) => authority.clone(),
        None => req
            .headers()
            .get(hyper::header::HOST)?
            .to_str()
            .ok()?
            .parse::<Authority>()
            .ok()?,
    };
    let host = authority.host().trim_start_matches('[').trim_end_matches(']');
    Some(Target::new(host, authority.port_u16().unwrap_or(default_port)))
}

fn is_hop_by_hop(name: &hyper::header::HeaderName) -> bool {
    matches!(
        name.as_str(),
        "proxy-connection" | "proxy-authorization" | "connection" | "keep-alive" | "te" | "trailer"
            | "upgrade"
    )
}

fn respond_status(status: http::StatusCode) -> Result<Response<Body>, anyhow::Error> {
    Ok(Response::builder().status(status).body(Body::empty())?)
}
