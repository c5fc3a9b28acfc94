use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "taskmaster", version, about = "taskmaster process supervisor")]
pub struct Args {
    /// Path to the programs policy YAML
    #[arg(short = 'c', long = "config", default_value = "taskmaster.yaml")]
    pub config: PathBuf,

    /// Bind address for the status dashboard
    #[arg(long = "bind", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,
}
