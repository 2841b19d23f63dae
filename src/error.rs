/// Failures that abort the process before anything is served.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to load configuration: {0:#}")]
    Config(anyhow::Error),

    #[error("failed to configure logging: {0:#}")]
    Logging(anyhow::Error),

    #[error("route \"{route}\": {error:#}")]
    Route {
        route: String,
        error: anyhow::Error,
    },

    #[error("invalid config")]
    NoRouters,

    #[error("failed to generate a TLS certificate: {0:#}")]
    Certificate(anyhow::Error),
}
