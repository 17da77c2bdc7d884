use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "llmsafespace")]
#[command(about = "LLMSafeSpace sandbox control plane")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Start the control-plane process: leader election, reconcilers, and
    /// the HTTP/WebSocket server
    Serve {
        #[arg(long)]
        config: Option<String>,
    },

    /// Manage the Sandbox/WarmPool/WarmPod/RuntimeEnvironment/SandboxProfile CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,

    /// Install the CRDs into the connected cluster
    Install,
}
