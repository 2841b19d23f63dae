use std::{convert::Infallible, path::Path, sync::Arc};

use tokio::task::JoinHandle;

use crate::{
    args::Args,
    config::{RouteConfig, TunnelConfig},
    diagnostics::{self, Status},
    engine::ChainEngine,
    error::StartupError,
    heartbeat::{HeartbeatBeacon, HeartbeatTarget, HttpPinger, Pinger},
    logging,
    route::RouteSpec,
    router::{self, RouterFactory},
    supervisor::{ClientSupervisor, ControlChannel, TcpSessionChannel},
    tls::{self, TlsIdentity},
};

/// Everything the process needs, resolved once from the command line, the
/// route file and the auth blob.
#[derive(Debug)]
pub struct Settings {
    pub debug: bool,
    pub routes: RouteConfig,
    pub tunnel: TunnelConfig,
    pub heartbeat: HeartbeatTarget,
}

impl Settings {
    /// `-L`/`-F` nodes are appended to the file's base route and `-D` is
    /// OR'ed with the file's `debug`.
    pub async fn load(args: &Args) -> Result<Self, StartupError> {
        let mut routes = if args.config.is_empty() {
            RouteConfig::default()
        } else {
            RouteConfig::load(Path::new(&args.config))
                .await
                .map_err(StartupError::Config)?
        };
        routes.serve_nodes.extend(args.serve_nodes.iter().cloned());
        routes.chain_nodes.extend(args.chain_nodes.iter().cloned());
        let tunnel =
            TunnelConfig::from_auth_blob(args.auth.expose()).map_err(StartupError::Config)?;
        let heartbeat = HeartbeatTarget {
            url: args.heartbeat_url.clone(),
            device_id: args.device_id.clone(),
        };
        heartbeat.validate().map_err(StartupError::Config)?;
        Ok(Self {
            debug: args.debug || routes.debug,
            routes,
            tunnel,
            heartbeat,
        })
    }

    fn route_specs(&self) -> (RouteSpec, Vec<RouteSpec>) {
        let base = RouteSpec::from(&self.routes.base_route());
        let groups = self.routes.routes.iter().map(RouteSpec::from).collect();
        (base, groups)
    }
}

/// Handles of every long-running activity.
pub struct Activities {
    status: Arc<Status>,
    supervisors: Vec<JoinHandle<Infallible>>,
    routers: Vec<JoinHandle<()>>,
    beacon: JoinHandle<Infallible>,
}

impl Activities {
    pub fn status(&self) -> &Arc<Status> {
        &self.status
    }

    /// Waits on the client supervisors, which never finish on their own.
    /// Without clients the beacon is the sentinel instead.
    pub async fn join(self) {
        log::info!(
            "running {} client supervisor(s) and {} router(s)",
            self.supervisors.len(),
            self.routers.len()
        );
        if self.supervisors.is_empty() {
            match self.beacon.await {
                Ok(never) => match never {},
                Err(error) => log::error!("heartbeat beacon aborted: {}", error),
            }
            return;
        }
        for result in futures::future::join_all(self.supervisors).await {
            match result {
                Ok(never) => match never {},
                Err(error) => log::error!("client supervisor aborted: {}", error),
            }
        }
        log::warn!("every client supervisor has stopped");
    }
}

/// Builds every router and, only once that succeeded, spawns the client
/// supervisors, the routers and the heartbeat beacon.
pub fn start<C, P>(
    settings: &Settings,
    factory: &dyn RouterFactory,
    channel: Arc<C>,
    pinger: P,
) -> Result<Activities, StartupError>
where
    C: ControlChannel + ?Sized + 'static,
    P: Pinger + 'static,
{
    let (base, groups) = settings.route_specs();
    let routers = router::build(factory, &base, &groups)?;
    log::info!("{} router(s) built from {} route(s)", routers.len(), groups.len() + 1);

    let status = Arc::new(Status::new(
        settings
            .tunnel
            .clients
            .iter()
            .map(|client| client.name.clone())
            .collect(),
        routers.iter().map(|router| router.describe()).collect(),
    ));

    let supervisors = settings
        .tunnel
        .clients
        .iter()
        .zip(status.clients())
        .map(|(client, client_status)| {
            let supervisor = ClientSupervisor::new(
                Arc::new(client.clone()),
                channel.clone(),
                client_status.clone(),
            );
            tokio::spawn(supervisor.run())
        })
        .collect();
    let router_handles = router::serve_all(routers, status.routers());
    let beacon = HeartbeatBeacon::new(
        settings.heartbeat.clone(),
        pinger,
        status.heartbeat().clone(),
    );
    let beacon = tokio::spawn(beacon.run());

    Ok(Activities {
        status,
        supervisors,
        routers: router_handles,
        beacon,
    })
}

/// Acquires the TLS identity and starts every activity on top of it. No
/// activity is spawned when the identity cannot be had.
pub fn launch<G, C, P>(
    settings: &Settings,
    generate: G,
    channel: Arc<C>,
    pinger: P,
) -> Result<Activities, StartupError>
where
    G: FnOnce() -> anyhow::Result<TlsIdentity>,
    C: ControlChannel + ?Sized + 'static,
    P: Pinger + 'static,
{
    let identity =
        tls::acquire_with(&settings.routes.cert_file, &settings.routes.key_file, generate)?;
    log::debug!(
        "TLS identity ready: {:?}, {} certificate(s) in chain",
        identity.origin(),
        identity.cert_chain().len()
    );
    let engine = ChainEngine::new(Arc::new(identity));
    start(settings, &engine, channel, pinger)
}

/// Process lifecycle after logging is up. Returns only on a startup
/// failure or when every supervisor has gone away.
pub async fn run(args: Args, handle: &log4rs::Handle) -> Result<(), StartupError> {
    let settings = Settings::load(&args).await?;
    logging::apply(handle, &settings.tunnel.log, settings.debug).map_err(StartupError::Logging)?;
    log::debug!("settings: {:?}", settings);

    let activities = launch(
        &settings,
        tls::generate,
        Arc::new(TcpSessionChannel::default()),
        HttpPinger::default(),
    )?;
    diagnostics::spawn_if_enabled(activities.status().clone());
    activities.join().await;
    Ok(())
}
