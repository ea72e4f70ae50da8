use std::fmt::Write as _;

use chrono::Utc;
use gpuhive_common::{ClusterStats, KernelLaunch, KernelLocation, NodeView};

pub fn render_nodes(nodes: &[NodeView]) -> String {
    let mut out = String::from("\n=== GPU Cluster Nodes ===\n");
    if nodes.is_empty() {
        out.push_str("  (No nodes registered)\n");
        return out;
    }

    let _ = writeln!(
        out,
        "  {:<36} {:<16} {:<21} {:<12} {:>8} {:>6} {:>12} {:<10}",
        "Node ID", "Name", "Address", "Status", "Kernels", "GPUs", "Max Free MB", "Heartbeat"
    );
    for v in nodes {
        let _ = writeln!(
            out,
            "  {:<36} {:<16} {:<21} {:<12} {:>8} {:>6} {:>12} {:<10}",
            v.node.id,
            truncate(&v.node.name, 16),
            format!("{}:{}", v.node.host, v.node.port),
            v.live.status.as_str().to_uppercase(),
            format!("{}/{}", v.live.active_kernels, v.node.max_kernels),
            v.live.gpus.len(),
            v.live.max_free_gpu_memory_mb(),
            last_seen(v),
        );
    }
    out
}

pub fn render_node(v: &NodeView) -> String {
    let mut out = format!("\n=== Node {} ===\n", v.node.name);
    let _ = writeln!(out, "  ID:          {}", v.node.id);
    let _ = writeln!(out, "  Address:     {}:{}", v.node.host, v.node.port);
    let _ = writeln!(out, "  Status:      {}", v.live.status.as_str().to_uppercase());
    let _ = writeln!(out, "  Kernels:     {}/{}", v.live.active_kernels, v.node.max_kernels);
    let _ = writeln!(out, "  Priority:    {}", v.node.priority);
    let tags: Vec<&str> = v.node.tags.iter().map(String::as_str).collect();
    let _ = writeln!(
        out,
        "  Tags:        {}",
        if tags.is_empty() { "-".to_string() } else { tags.join(", ") }
    );
    let _ = writeln!(out, "  Maintenance: {}", v.node.maintenance);
    let _ = writeln!(out, "  CPU:         {} cores, {:.1}%", v.live.cpu_count, v.live.cpu_percent);
    let _ = writeln!(
        out,
        "  Memory:      {} / {} MB available",
        v.live.memory_available_mb, v.live.memory_total_mb
    );
    let _ = writeln!(out, "  Heartbeat:   {}", last_seen(v));

    out.push_str("\n  [GPUs]\n");
    if v.live.gpus.is_empty() {
        out.push_str("  (No GPUs reported)\n");
    } else {
        let _ = writeln!(
            out,
            "  {:<5} {:<24} {:>10} {:>10} {:>6} {:>6}",
            "Index", "Name", "Free MB", "Total MB", "Util", "Temp"
        );
        for g in &v.live.gpus {
            let _ = writeln!(
                out,
                "  {:<5} {:<24} {:>10} {:>10} {:>5}% {:>5}C",
                g.index,
                truncate(&g.name, 24),
                g.memory_free_mb,
                g.memory_total_mb,
                g.utilization_pct,
                g.temperature_c
            );
        }
    }
    out
}

pub fn render_stats(s: &ClusterStats) -> String {
    let mut out = String::from("\n=== GPU Cluster Stats ===\n");
    let _ = writeln!(out, "  Nodes:     {} online / {} total", s.online_nodes, s.total_nodes);
    let _ = writeln!(out, "  GPUs:      {} available / {} total", s.available_gpus, s.total_gpus);
    let _ = writeln!(
        out,
        "  Memory:    {} MB available / {} MB total",
        s.available_memory_mb, s.total_memory_mb
    );
    let _ = writeln!(out, "  Kernels:   {} active / {} capacity", s.active_kernels, s.max_kernels);
    out
}

pub fn render_launch(l: &KernelLaunch) -> String {
    format!(
        "✓ Kernel {} started on {} ({})\n",
        l.kernel_id, l.node_name, l.node_id
    )
}

pub fn render_location(l: &KernelLocation) -> String {
    format!("{}\n", l.websocket_url)
}

fn last_seen(v: &NodeView) -> String {
    match v.live.last_heartbeat {
        None => "never".to_string(),
        Some(hb) => format!("{}s ago", (Utc::now() - hb).num_seconds().max(0)),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut t: String = s.chars().take(max.saturating_sub(1)).collect();
    t.push('…');
    t
}
