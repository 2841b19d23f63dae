use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::{diagnostics::RouterStatus, error::StartupError, route::RouteSpec};

/// A listener plus its forwarding rule.
#[async_trait::async_trait]
pub trait Router: Send + Sync {
    fn describe(&self) -> String;

    /// Binds the listener, marks `status` serving once bound, and serves
    /// until it fails.
    async fn serve(&self, status: &RouterStatus) -> anyhow::Result<()>;
}

/// Turns one textual route into routers, one per serve node.
pub trait RouterFactory {
    fn gen_routers(&self, spec: &RouteSpec) -> anyhow::Result<Vec<Box<dyn Router>>>;
}

/// Expands the base route and then every named group, in order. Any
/// failure discards everything built so far.
pub fn build(
    factory: &dyn RouterFactory,
    base: &RouteSpec,
    groups: &[RouteSpec],
) -> Result<Vec<Box<dyn Router>>, StartupError> {
    let mut routers = Vec::new();
    for spec in std::iter::once(base).chain(groups) {
        let generated = factory
            .gen_routers(spec)
            .map_err(|error| StartupError::Route {
                route: spec.name.clone(),
                error,
            })?;
        log::debug!("route \"{}\" yields {} router(s)", spec.name, generated.len());
        routers.extend(generated);
    }
    if routers.is_empty() {
        return Err(StartupError::NoRouters);
    }
    Ok(routers)
}

/// Spawns one task per router, `statuses[i]` tracking `routers[i]`. A router
/// that stops is logged and left stopped; its siblings keep serving.
pub fn serve_all(
    routers: Vec<Box<dyn Router>>,
    statuses: &[Arc<RouterStatus>],
) -> Vec<JoinHandle<()>> {
    assert_eq!(routers.len(), statuses.len(), "every router needs exactly one status");
    routers
        .into_iter()
        .zip(statuses.iter().cloned())
        .map(|(router, status)| {
            tokio::spawn(async move {
                let name = router.describe();
                let result = router.serve(&status).await;
                status.set_serving(false);
                match result {
                    Ok(()) => log::warn!("router {} stopped", name),
                    Err(error) => log::error!("router {} failed: {:#}", name, error),
                }
            })
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Router that records when it is served and then parks or fails to
    /// bind.
    pub(crate) struct MockRouter {
        pub name: String,
        pub fail: bool,
        pub served: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Router for MockRouter {
        fn describe(&self) -> String {
            self.name.clone()
        }

        async fn serve(&self, status: &RouterStatus) -> anyhow::Result<()> {
            self.served.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                tokio::task::yield_now().await;
                anyhow::bail!("address already in use");
            }
            status.set_serving(true);
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    /// One router per serve node, named `<route>/<node>`. Nodes starting
    /// with `!` fail to parse, nodes starting with `x` fail to serve.
    #[derive(Default)]
    pub(crate) struct MockFactory {
        pub served: Arc<AtomicUsize>,
    }

    impl RouterFactory for MockFactory {
        fn gen_routers(&self, spec: &RouteSpec) -> anyhow::Result<Vec<Box<dyn Router>>> {
            spec.serve_nodes
                .iter()
                .map(|node| {
                    if node.starts_with('!') {
                        anyhow::bail!("malformed node \"{}\"", node);
                    }
                    Ok(Box::new(MockRouter {
                        name: format!("{}/{}", spec.name, node),
                        fail: node.starts_with('x'),
                        served: self.served.clone(),
                    }) as Box<dyn Router>)
                })
                .collect()
        }
    }

    pub(crate) fn spec(name: &str, nodes: &[&str]) -> RouteSpec {
        RouteSpec {
            name: name.to_owned(),
            serve_nodes: nodes.iter().map(|node| node.to_string()).collect(),
            chain_nodes: Vec::new(),
        }
    }

    #[test]
    fn build_concatenates_base_then_groups() {
        let factory = MockFactory::default();
        let routers = build(
            &factory,
            &spec("base", &["a"]),
            &[spec("g1", &["b", "c"]), spec("g2", &[]), spec("g3", &["d"])],
        )
        .unwrap();
        let names: Vec<String> = routers.iter().map(|router| router.describe()).collect();
        assert_eq!(names, ["base/a", "g1/b", "g1/c", "g3/d"]);
    }

    #[test]
    fn empty_base_with_groups_is_fine() {
        let factory = MockFactory::default();
        let routers = build(&factory, &spec("base", &[]), &[spec("g1", &["b"])]).unwrap();
        assert_eq!(routers.len(), 1);
    }

    #[test]
    fn zero_routers_is_invalid_config() {
        let factory = MockFactory::default();
        let error = build(&factory, &spec("base", &[]), &[spec("g1", &[])])
            .err()
            .unwrap();
        assert!(matches!(error, StartupError::NoRouters));
        assert_eq!(error.to_string(), "invalid config");
    }

    #[test]
    fn expansion_error_aborts_the_build() {
        let factory = MockFactory::default();
        let error = build(
            &factory,
            &spec("base", &["a"]),
            &[spec("g1", &["b"]), spec("g2", &["!bad"])],
        )
        .err()
        .unwrap();
        match error {
            StartupError::Route { route, .. } => assert_eq!(route, "g2"),
            other => panic!("unexpected error: {}", other),
        }
    }

    fn statuses(routers: &[Box<dyn Router>]) -> Vec<Arc<RouterStatus>> {
        routers
            .iter()
            .map(|router| Arc::new(RouterStatus::new(router.describe())))
            .collect()
    }

    #[tokio::test]
    async fn bind_failure_never_reports_serving() {
        let factory = MockFactory::default();
        let routers = build(&factory, &spec("base", &["xbroken"]), &[]).unwrap();
        let statuses = statuses(&routers);
        let seen_serving = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let watcher = {
            let status = statuses[0].clone();
            let seen_serving = seen_serving.clone();
            tokio::spawn(async move {
                loop {
                    if status.is_serving() {
                        seen_serving.store(true, Ordering::SeqCst);
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut handles = serve_all(routers, &statuses);
        handles.remove(0).await.unwrap();
        watcher.abort();

        assert_eq!(factory.served.load(Ordering::SeqCst), 1);
        assert!(!seen_serving.load(Ordering::SeqCst));
        assert!(!statuses[0].is_serving());
    }

    #[tokio::test]
    #[should_panic(expected = "every router needs exactly one status")]
    async fn missing_status_is_refused() {
        let factory = MockFactory::default();
        let routers = build(&factory, &spec("base", &["a", "b"]), &[]).unwrap();
        let statuses = statuses(&routers[..1]);
        serve_all(routers, &statuses);
    }

    #[tokio::test]
    async fn failing_router_does_not_stop_siblings() {
        let factory = MockFactory::default();
        let routers = build(&factory, &spec("base", &["a", "xbroken", "c"]), &[]).unwrap();
        let statuses = statuses(&routers);
        let mut handles = serve_all(routers, &statuses);

        let broken = handles.remove(1);
        broken.await.unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(factory.served.load(Ordering::SeqCst), 3);
        assert!(!statuses[1].is_serving());
        assert!(statuses[0].is_serving());
        assert!(statuses[2].is_serving());
        assert!(handles.iter().all(|handle| !handle.is_finished()));
    }
}
