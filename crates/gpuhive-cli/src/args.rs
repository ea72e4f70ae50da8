use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "gpuhive")]
#[command(about = "Command line client for the GPU cluster manager", long_about = None)]
pub struct Args {
    /// Cluster manager URL
    #[arg(
        long,
        env = "GPUHIVE_MANAGER_URL",
        default_value = "http://127.0.0.1:8090"
    )]
    pub manager_url: String,

    /// Print raw JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Node administration
    Nodes {
        #[command(subcommand)]
        subcommand: NodeCommand,
    },
    /// Kernel placement and lifecycle
    Kernel {
        #[command(subcommand)]
        subcommand: KernelCommand,
    },
    /// Aggregate cluster capacity
    Stats,
    /// Fetch manager metrics
    Metrics,
}

#[derive(Debug, Subcommand)]
pub enum NodeCommand {
    /// List registered nodes with their live status
    List,
    /// Show one node
    Get { node_id: String },
    /// Register a node
    Add {
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 8888)]
        port: u16,
        /// Display name (defaults to host:port)
        #[arg(long, default_value = "")]
        name: String,
        /// Tag, repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(long)]
        max_kernels: Option<u32>,
    },
    /// Change a node's configuration
    Update {
        node_id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Replaces all tags, repeatable
        #[arg(long = "tag")]
        tags: Option<Vec<String>>,
        #[arg(long)]
        priority: Option<i32>,
        #[arg(long)]
        max_kernels: Option<u32>,
        /// Drain (true) or return to service (false)
        #[arg(long)]
        maintenance: Option<bool>,
    },
    /// Unregister a node, shutting down its kernels
    Remove { node_id: String },
    /// Probe one node now, or every node when no id is given
    Refresh { node_id: Option<String> },
}

#[derive(Debug, Subcommand)]
pub enum KernelCommand {
    /// Start a kernel on the best eligible node
    Create {
        /// Place on this node instead of choosing one
        #[arg(long)]
        node: Option<String>,
        #[arg(long, default_value = "python3")]
        kernel_name: String,
        /// Allow nodes without GPUs
        #[arg(long)]
        no_gpu: bool,
        /// Minimum free memory on one GPU, in MB
        #[arg(long, default_value_t = 0)]
        min_gpu_memory: u64,
        /// Required node tag, repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Pin to one GPU index
        #[arg(long)]
        gpu_index: Option<u32>,
        /// KEY=VALUE passed to the kernel, repeatable
        #[arg(long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
    },
    /// Show the node hosting a kernel
    Locate { kernel_id: String },
    /// Print the websocket URL of a kernel
    Websocket { kernel_id: String },
    Interrupt { kernel_id: String },
    Restart { kernel_id: String },
    Shutdown { kernel_id: String },
}

pub fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}
