use std::path::PathBuf;

use clap::{Parser, Subcommand};

use gordon_common::DomainName;

#[derive(Parser, Debug)]
#[clap(name = "gordon", about = "Single-host container deployment platform")]
pub struct Args {
    /// Path to the config file
    #[clap(long, default_value = "/etc/gordon/gordon.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the registry, proxy, and deployment controller
    Start,
    /// Ask the running instance for a full config reload
    Reload,
    /// Deploy a domain's route now
    Deploy { domain: DomainName },
    /// Show routes, containers, and counters
    Status,
    /// Print recent log lines from the running instance
    Logs {
        /// Number of lines from the end
        #[clap(long, default_value_t = 100)]
        tail: usize,
    },
}
