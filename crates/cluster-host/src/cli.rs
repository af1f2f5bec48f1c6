use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "cluster-host",
    version,
    about = "Leases test commands from a cluster coordinator and runs them on local devices"
)]
pub struct Args {
    #[arg(long, default_value = "config/cluster-host.toml")]
    pub config: PathBuf,
    #[arg(long, default_value = "~/.cluster-host/logs")]
    pub log_dir: String,
    #[arg(long, default_value_t = false)]
    pub log_to_stderr: bool,
    /// Run a single scheduling cycle, wait for its invocations and exit.
    #[arg(long, default_value_t = false)]
    pub once: bool,
}
