use std::sync::Arc;

use crate::{
    chain::Chain,
    forward::ForwardRouter,
    http_proxy::HttpProxyRouter,
    route::{ListenKind, RouteSpec},
    router::{Router, RouterFactory},
    sni_proxy::SniRouter,
    tls::TlsIdentity,
};

/// Builds real listeners for a route. Every listener of a route shares one
/// chain; `tls://` listeners terminate with the process identity.
pub struct ChainEngine {
    tls: Arc<TlsIdentity>,
}

impl ChainEngine {
    pub fn new(tls: Arc<TlsIdentity>) -> Self {
        Self { tls }
    }
}

impl RouterFactory for ChainEngine {
    fn gen_routers(&self, spec: &RouteSpec) -> anyhow::Result<Vec<Box<dyn Router>>> {
        let route = spec.parse()?;
        let chain = Arc::new(Chain::new(route.hops));
        if !route.listeners.is_empty() {
            log::debug!(
                "route \"{}\": {} listener(s) over {} hop(s)",
                spec.name,
                route.listeners.len(),
                chain.len()
            );
        }
        let routers = route
            .listeners
            .into_iter()
            .map(|node| -> Box<dyn Router> {
                match (node.kind, node.target) {
                    (ListenKind::Tcp, Some(target)) => {
                        Box::new(ForwardRouter::new(node.address, target, chain.clone(), None))
                    }
                    (ListenKind::Tls, Some(target)) => Box::new(ForwardRouter::new(
                        node.address,
                        target,
                        chain.clone(),
                        Some(self.tls.acceptor()),
                    )),
                    (ListenKind::Sni, _) => Box::new(SniRouter::new(node.address, chain.clone())),
                    (_, _) => Box::new(HttpProxyRouter::new(node.address, chain.clone())),
                }
            })
            .collect();
        Ok(routers)
    }
}
