use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rfb-sentry", version, about = "Security proxy for VNC remote-control sessions")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Path to the policy file (overrides config file setting)
    #[arg(short, long)]
    pub policy: Option<PathBuf>,

    /// Host of the VNC servers being protected (overrides config file setting)
    #[arg(long)]
    pub upstream_host: Option<String>,

    /// Monitored VNC port; repeat for several (overrides config file setting)
    #[arg(long = "port")]
    pub ports: Vec<u16>,

    /// Offset added to each monitored port to get its listening port
    #[arg(long)]
    pub offset: Option<u16>,
}
