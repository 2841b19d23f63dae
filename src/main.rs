mod args;
mod chain;
mod config;
mod coordinator;
mod diagnostics;
mod engine;
mod error;
mod forward;
mod heartbeat;
mod http_proxy;
mod logging;
mod route;
mod router;
mod sni_proxy;
mod supervisor;
mod tls;

#[tokio::main]
async fn main() {
    let args = match args::Args::from_env() {
        Some(args) => args,
        None => return,
    };
    let handle = match logging::init_logging(args.debug) {
        Ok(handle) => handle,
        Err(error) => {
            eprintln!("{:#}", error);
            std::process::exit(1);
        }
    };
    if let Err(error) = coordinator::run(args, &handle).await {
        log::error!("{}", error);
        std::process::exit(1);
    }
}
