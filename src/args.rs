use clap::{CommandFactory, Parser};

use crate::config::Secret;

pub const DEFAULT_DEVICE_ID: &str = "123456";
pub const DEFAULT_HEARTBEAT_URL: &str = "http://192.168.8.105/api/oninfos";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Forward address, repeat to build a forward chain
    #[arg(short = 'F', long = "forward", value_name = "NODE")]
    pub chain_nodes: Vec<String>,

    /// Listen address, repeat to listen on multiple ports
    #[arg(short = 'L', long = "listen", value_name = "NODE")]
    pub serve_nodes: Vec<String>,

    /// Route configuration file
    #[arg(short = 'C', long, default_value_t = String::new())]
    pub config: String,

    /// Enable debug log
    #[arg(short = 'D', long)]
    pub debug: bool,

    /// Base64-encoded client configuration
    #[arg(short = 'A', long, default_value = "")]
    pub auth: Secret,

    /// Device serial reported by the heartbeat
    #[arg(short = 'I', long, default_value_t = String::from(DEFAULT_DEVICE_ID))]
    pub device_id: String,

    /// Heartbeat collector base URL
    #[arg(short = 'U', long, default_value_t = String::from(DEFAULT_HEARTBEAT_URL))]
    pub heartbeat_url: String,
}

impl Args {
    /// Parses the command line. With no arguments at all the help text is
    /// printed and `None` is returned so the caller exits without starting.
    pub fn from_env() -> Option<Self> {
        if std::env::args_os().len() <= 1 {
            let _ = Self::command().print_help();
            println!();
            return None;
        }
        Some(Self::parse())
    }
}
