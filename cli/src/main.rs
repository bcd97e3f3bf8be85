// meshfence: network stack simulator CLI
//
// Runs complete nodes on a simulated radio medium in one process.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use meshfence_core::routing::line_routes;
use meshfence_core::rpc::{ping_endpoint, rpc_ping};
use meshfence_core::{MessagePing, Node, NodeId, SimMedium, StackConfig, MAX_NODES};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

const PORT_DEMO: u8 = 30;

#[derive(Parser)]
#[command(name = "meshfence")]
#[command(about = "Meshfence sensor network stack simulator", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log protocol events at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Two nodes: a message from A to B, then an RPC ping from B back to A
    Demo,
    /// RPC ping across a line of simulated nodes
    Rping {
        from: NodeId,
        to: NodeId,
        #[arg(default_value = "7")]
        token: u8,
        /// Nodes on the line, ids 1..=N
        #[arg(short, long, default_value = "5")]
        nodes: u8,
        /// Call timeout in seconds
        #[arg(short, long, default_value = "30")]
        timeout: u64,
    },
    /// Message-layer ping across a line of simulated nodes
    Mping {
        from: NodeId,
        to: NodeId,
        #[arg(default_value = "1")]
        token: u8,
        /// Nodes on the line, ids 1..=N
        #[arg(short, long, default_value = "5")]
        nodes: u8,
        /// Ping once per ping period until this many pongs arrived
        #[arg(short, long, default_value = "1")]
        count: u32,
    },
    /// Show or edit the node configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective config as JSON
    Show,
    /// Write the default config file
    Init,
    /// Show the config file location
    Path,
    Get { key: String },
    Set { key: String, value: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let path = cli.config.as_deref();
    match cli.command {
        Commands::Demo => cmd_demo(config::load(path)?).await,
        Commands::Rping {
            from,
            to,
            token,
            nodes,
            timeout,
        } => cmd_rping(config::load(path)?, from, to, token, nodes, timeout).await,
        Commands::Mping {
            from,
            to,
            token,
            nodes,
            count,
        } => cmd_mping(config::load(path)?, from, to, token, nodes, count).await,
        Commands::Config { action } => cmd_config(path, action),
    }
}

/// Start one node per id on `medium`, each from `base` with its own id
fn spawn_nodes(medium: &SimMedium, base: &StackConfig, ids: &[NodeId]) -> Result<Vec<Node>> {
    ids.iter()
        .map(|&id| {
            let config = StackConfig {
                node_id: id,
                ..base.clone()
            };
            Node::spawn(config, Arc::new(medium.attach(id)))
                .with_context(|| format!("Failed to start node {}", id))
        })
        .collect()
}

async fn cmd_demo(base: StackConfig) -> Result<()> {
    println!("{}", "Meshfence demo".bold());
    println!();

    let medium = SimMedium::new();
    let nodes = spawn_nodes(&medium, &base, &[1, 2])?;
    let (a, b) = (&nodes[0], &nodes[1]);
    a.router().set_route(2, 2)?;
    b.router().set_route(1, 1)?;
    println!("  {} Nodes {} and {} up", "✓".green(), a.id(), b.id());

    let inbox = b.router().register_listener(PORT_DEMO, 4)?;
    inbox.activate();
    a.router().send(2, PORT_DEMO, 0, b"hello")?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let msg = inbox
        .recv_until(deadline)
        .await
        .context("Message from A never reached B")?;
    println!(
        "  {} B received \"{}\" from node {}",
        "✓".green(),
        String::from_utf8_lossy(&msg.payload).bright_cyan(),
        msg.sender
    );

    let server_side = ping_endpoint(Arc::clone(a.router()), a.config().pong_delay())?;
    let server = tokio::spawn(async move { server_side.server.serve_forever().await });
    let mut caller = ping_endpoint(Arc::clone(b.router()), b.config().pong_delay())?;

    let started = Instant::now();
    let result = rpc_ping(&mut caller.client, 1, 0x07, Duration::from_secs(10)).await;
    server.abort();
    result.context("RPC ping from B to A failed")?;
    println!(
        "  {} B pinged A over RPC in {:.1?}",
        "✓".green(),
        started.elapsed()
    );

    Ok(())
}

/// Bring up nodes 1..=`nodes` on a line and flood routes from `from`
async fn start_line(base: &StackConfig, from: NodeId, to: NodeId, nodes: u8) -> Result<Vec<Node>> {
    let max = (MAX_NODES - 1) as u8;
    if nodes < 2 || nodes > max {
        anyhow::bail!("Line must have 2..={} nodes", max);
    }
    if from == to || !(1..=nodes).contains(&from) || !(1..=nodes).contains(&to) {
        anyhow::bail!("Endpoints must be distinct ids in 1..={}", nodes);
    }

    let ids: Vec<NodeId> = (1..=nodes).collect();
    info!("line {} -> {} over {} nodes", from, to, nodes);
    let medium = SimMedium::line(&ids);
    let line = spawn_nodes(&medium, base, &ids)?;

    println!(
        "{} {}",
        "Line:".bold(),
        ids.iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(" - ")
    );

    // flood routes from the caller and give them time to settle
    line[(from - 1) as usize]
        .router()
        .broadcast_routes(&line_routes(&ids), 1)?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    Ok(line)
}

async fn cmd_rping(
    base: StackConfig,
    from: NodeId,
    to: NodeId,
    token: u8,
    nodes: u8,
    timeout: u64,
) -> Result<()> {
    let line = start_line(&base, from, to, nodes).await?;
    let node = |id: NodeId| &line[(id - 1) as usize];

    let target = ping_endpoint(Arc::clone(node(to).router()), node(to).config().pong_delay())?;
    let server = tokio::spawn(async move { target.server.serve_forever().await });
    let mut caller = ping_endpoint(
        Arc::clone(node(from).router()),
        node(from).config().pong_delay(),
    )?;

    let started = Instant::now();
    let result = rpc_ping(&mut caller.client, to, token, Duration::from_secs(timeout)).await;
    server.abort();

    match result {
        Ok(()) => {
            println!(
                "  {} {} -> {} token {:#04x} in {:.1?}",
                "✓".green(),
                from,
                to,
                token,
                started.elapsed()
            );
            Ok(())
        }
        Err(e) => {
            println!("  {} {} -> {}: {}", "✗".red(), from, to, e);
            Err(e).context("RPC ping failed")
        }
    }
}

async fn cmd_mping(
    base: StackConfig,
    from: NodeId,
    to: NodeId,
    token: u8,
    nodes: u8,
    count: u32,
) -> Result<()> {
    let line = start_line(&base, from, to, nodes).await?;
    let node = |id: NodeId| &line[(id - 1) as usize];
    let period = node(from).config().ping_period();

    let responder = MessagePing::new(
        Arc::clone(node(to).router()),
        node(to).config().pong_delay(),
        node(to).config().ping_period(),
    )?;
    let pinger = Arc::new(MessagePing::new(
        Arc::clone(node(from).router()),
        node(from).config().pong_delay(),
        period,
    )?);
    let mut tasks = vec![tokio::spawn(async move { responder.serve_forever().await })];
    let local = Arc::clone(&pinger);
    tasks.push(tokio::spawn(async move { local.serve_forever().await }));

    if count > 1 {
        let periodic = Arc::clone(&pinger);
        tasks.push(tokio::spawn(async move { periodic.run_periodic(to).await }));
    } else {
        pinger.ping(to, token).context("Message ping failed")?;
    }

    let started = Instant::now();
    let deadline = tokio::time::Instant::now() + period * count.max(1);
    let mut received = 0;
    while received < count.max(1) {
        let Some(pong) = pinger.wait_pong(deadline).await else {
            break;
        };
        received += 1;
        println!(
            "  {} pong from {} token {:#04x} rssi ping/pong {}/{} at {:.1?}",
            "✓".green(),
            pong.from,
            pong.token,
            pong.ping_rssi,
            pong.pong_rssi,
            started.elapsed()
        );
    }
    for task in tasks {
        task.abort();
    }

    if received < count.max(1) {
        println!("  {} {} -> {}: {} of {} answered", "✗".red(), from, to, received, count);
        anyhow::bail!("Message ping to {} timed out", to);
    }
    Ok(())
}

fn cmd_config(path: Option<&std::path::Path>, action: Option<ConfigAction>) -> Result<()> {
    match action.unwrap_or(ConfigAction::Show) {
        ConfigAction::Show => {
            let config = config::load(path)?;
            println!("{}", config.to_json_pretty()?);
        }
        ConfigAction::Init => {
            let written = config::save(&StackConfig::default(), path)?;
            println!("{} Wrote {}", "✓".green(), written.display());
        }
        ConfigAction::Path => {
            println!("{}", config::config_file(path)?.display());
        }
        ConfigAction::Get { key } => match config::get(&config::load(path)?, &key) {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },
        ConfigAction::Set { key, value } => {
            let mut config = config::load(path)?;
            config::set(&mut config, &key, &value)?;
            config::save(&config, path)?;
            println!("{} {} = {}", "✓".green(), key.bright_cyan(), value);
        }
        ConfigAction::List => {
            let config = config::load(path)?;
            println!("{}", "Configuration".bold());
            for (key, value) in config::list(&config) {
                println!("  {:<22} {}", key, value.bright_yellow());
            }
        }
    }
    Ok(())
}
