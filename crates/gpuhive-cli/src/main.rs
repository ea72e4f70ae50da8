mod args;
mod client;
mod output;

use std::collections::BTreeMap;

use anyhow::Result;
use clap::Parser;
use reqwest::Method;
use serde_json::{json, Value};

use gpuhive_common::{
    ClusterStats, CreateKernelRequest, KernelLaunch, KernelLocation, NodeSpec, NodeUpdate,
    NodeView, PlacementRequest,
};

use crate::args::{Args, Command, KernelCommand, NodeCommand};
use crate::client::ManagerClient;
use crate::output::{render_launch, render_location, render_node, render_nodes, render_stats};

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("✗ {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let client = ManagerClient::new(&args.manager_url);
    let raw = args.json;

    match args.command {
        Command::Nodes { subcommand } => match subcommand {
            NodeCommand::List => {
                let nodes: Vec<NodeView> = client.get("/cluster/nodes").await?;
                if raw {
                    print_json(&nodes)?;
                } else {
                    print!("{}", render_nodes(&nodes));
                }
            }
            NodeCommand::Get { node_id } => {
                let node: NodeView = client.get(&format!("/cluster/nodes/{node_id}")).await?;
                if raw {
                    print_json(&node)?;
                } else {
                    print!("{}", render_node(&node));
                }
            }
            NodeCommand::Add {
                host,
                port,
                name,
                tags,
                priority,
                max_kernels,
            } => {
                let spec = NodeSpec {
                    name,
                    host,
                    port,
                    tags,
                    priority,
                    max_kernels,
                };
                let node: NodeView = client.post("/cluster/nodes", &spec).await?;
                if raw {
                    print_json(&node)?;
                } else {
                    println!(
                        "✓ Node {} registered as {} (status: {})",
                        node.node.name, node.node.id, node.live.status
                    );
                }
            }
            NodeCommand::Update {
                node_id,
                name,
                port,
                tags,
                priority,
                max_kernels,
                maintenance,
            } => {
                let update = NodeUpdate {
                    name,
                    port,
                    tags,
                    priority,
                    max_kernels,
                    maintenance,
                };
                if update.is_empty() {
                    anyhow::bail!("nothing to update, pass at least one option");
                }
                let node: NodeView = client
                    .put(&format!("/cluster/nodes/{node_id}"), &update)
                    .await?;
                if raw {
                    print_json(&node)?;
                } else {
                    println!("✓ Node {} updated (status: {})", node.node.name, node.live.status);
                }
            }
            NodeCommand::Remove { node_id } => {
                client
                    .call(Method::DELETE, &format!("/cluster/nodes/{node_id}"))
                    .await?;
                println!("✓ Node {node_id} removed");
            }
            NodeCommand::Refresh { node_id: Some(node_id) } => {
                let node: NodeView = client
                    .post(&format!("/cluster/nodes/{node_id}/refresh"), &json!({}))
                    .await?;
                if raw {
                    print_json(&node)?;
                } else {
                    print!("{}", render_node(&node));
                }
            }
            NodeCommand::Refresh { node_id: None } => {
                let nodes: Vec<NodeView> = client.post("/cluster/refresh", &json!({})).await?;
                if raw {
                    print_json(&nodes)?;
                } else {
                    print!("{}", render_nodes(&nodes));
                }
            }
        },
        Command::Kernel { subcommand } => match subcommand {
            KernelCommand::Create {
                node,
                kernel_name,
                no_gpu,
                min_gpu_memory,
                tags,
                gpu_index,
                env,
            } => {
                let req = CreateKernelRequest {
                    placement: PlacementRequest {
                        node_id: node,
                        require_gpu: !no_gpu,
                        min_gpu_memory_mb: min_gpu_memory,
                        required_tags: tags.into_iter().collect(),
                        gpu_index,
                    },
                    kernel_name,
                    env: env.into_iter().collect::<BTreeMap<_, _>>(),
                };
                let launch: KernelLaunch = client.post("/cluster/kernels", &req).await?;
                if raw {
                    print_json(&launch)?;
                } else {
                    print!("{}", render_launch(&launch));
                }
            }
            KernelCommand::Locate { kernel_id } => {
                let node: NodeView = client
                    .get(&format!("/cluster/kernels/{kernel_id}/node"))
                    .await?;
                if raw {
                    print_json(&node)?;
                } else {
                    print!("{}", render_node(&node));
                }
            }
            KernelCommand::Websocket { kernel_id } => {
                let loc: KernelLocation = client
                    .get(&format!("/cluster/kernels/{kernel_id}/websocket"))
                    .await?;
                if raw {
                    print_json(&loc)?;
                } else {
                    print!("{}", render_location(&loc));
                }
            }
            KernelCommand::Interrupt { kernel_id } => {
                client
                    .call(
                        Method::POST,
                        &format!("/cluster/kernels/{kernel_id}/interrupt"),
                    )
                    .await?;
                println!("✓ Kernel {kernel_id} interrupted");
            }
            KernelCommand::Restart { kernel_id } => {
                let _: Value = client
                    .post(&format!("/cluster/kernels/{kernel_id}/restart"), &json!({}))
                    .await?;
                println!("✓ Kernel {kernel_id} restarted");
            }
            KernelCommand::Shutdown { kernel_id } => {
                client
                    .call(Method::DELETE, &format!("/cluster/kernels/{kernel_id}"))
                    .await?;
                println!("✓ Kernel {kernel_id} shut down");
            }
        },
        Command::Stats => {
            let stats: ClusterStats = client.get("/cluster/stats").await?;
            if raw {
                print_json(&stats)?;
            } else {
                print!("{}", render_stats(&stats));
            }
        }
        Command::Metrics => {
            print!("{}", client.text("/metrics").await?);
        }
    }
    Ok(())
}
