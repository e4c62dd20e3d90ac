//! hyview CLI
//!
//! Runs the host daemon, sends sample geometry to it, and pokes at its RPC
//! surface.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};

use hyview::{AttributeDefinition, AttributeDomain, Config, Geometry, MemoryScene, Point, Registry};
use hyview_rpc::{App, BuildOptions, Connection, HostClient, HostController, Server, logging};

/// hyview - stream geometry into a long-running 3D host
#[derive(Parser, Debug)]
#[command(name = "hyview")]
#[command(about = "Stream geometry from any process into a long-running 3D host")]
struct Cli {
    /// Host both endpoints live on (overrides HYVIEW_HOST)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Requester streaming port (overrides HYVIEW_PORT)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Host control port (overrides HYVIEW_APP_PORT)
    #[arg(long, global = true)]
    app_port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the host daemon until Ctrl+C
    Host {
        /// Plugin search path (overrides HYVIEW_PLUGIN_PATH)
        #[arg(long)]
        plugin_path: Option<String>,
    },

    /// Build a random coloured point cloud on the host
    Send {
        /// Number of points
        #[arg(short = 'n', long, default_value_t = 1000)]
        count: usize,

        /// Node name; defaults to the geometry's identifier
        #[arg(long)]
        name: Option<String>,

        /// Frame number of the cache artifact
        #[arg(long, default_value_t = 1)]
        frame: i64,

        /// Re-stream even if a cache artifact exists
        #[arg(long)]
        no_cache: bool,

        /// Seed for reproducible clouds
        #[arg(long)]
        seed: Option<u64>,
    },

    /// List the host's nodes
    Nodes,

    /// Destroy every node on the host
    Clear,

    /// List the host's methods and their shapes
    Methods,

    /// Call a host method with JSON arguments
    Call {
        /// Method name
        method: String,

        /// JSON arguments
        #[arg(default_value = "null")]
        args: String,

        /// Call a streaming method and print each item
        #[arg(long)]
        stream: bool,
    },
}

const PALETTE: [[f64; 3]; 8] = [
    [0.5, 0.0, 0.5],
    [1.0, 0.75, 0.8],
    [1.0, 0.65, 0.0],
    [0.5, 0.5, 0.5],
    [1.0, 1.0, 1.0],
    [0.0, 0.0, 1.0],
    [0.0, 0.5, 0.0],
    [1.0, 1.0, 0.0],
];

const LABELS: [&str; 8] = [
    "purple", "pink", "orange", "grey", "white", "blue", "green", "yellow",
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(port) = cli.app_port {
        config.app_port = port;
    }
    logging::init(&config);

    match cli.command {
        Command::Host { plugin_path } => {
            if plugin_path.is_some() {
                config.plugin_path = plugin_path;
            }
            run_host(&config).await
        }
        Command::Send {
            count,
            name,
            frame,
            no_cache,
            seed,
        } => {
            let geometry = sample_cloud(count, seed);
            let options = BuildOptions {
                name,
                frame,
                cache: !no_cache,
            };
            let app = App::start(&config).await?;
            let built = app.build(geometry, options).await;
            app.stop().await?;
            println!("{}", built?);
            Ok(())
        }
        Command::Nodes => {
            let host = HostClient::connect(config.app_addr()).await?;
            for name in host.all_nodes().await? {
                println!("{name}");
            }
            Ok(())
        }
        Command::Clear => {
            let host = HostClient::connect(config.app_addr()).await?;
            host.clear().await?;
            Ok(())
        }
        Command::Methods => {
            let conn = Connection::connect(config.app_addr()).await?;
            for (name, kind) in conn.inspect().await? {
                println!("{name}\t{}", kind.as_str());
            }
            Ok(())
        }
        Command::Call {
            method,
            args,
            stream,
        } => {
            let args: Value = serde_json::from_str(&args).context("arguments must be JSON")?;
            let conn = Connection::connect(config.app_addr()).await?;
            if stream {
                let mut items = conn.stream(&method, args).await?;
                while let Some(item) = items.next().await {
                    println!("{}", serde_json::to_string(&item?)?);
                }
            } else {
                let value = conn.call(&method, args).await?;
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            Ok(())
        }
    }
}

async fn run_host(config: &Config) -> anyhow::Result<()> {
    let scene = Arc::new(MemoryScene::new());
    let controller = Arc::new(HostController::from_scene(scene, config));
    let mut methods = controller.methods()?;

    let mut registry = Registry::new();
    if let Some(path) = &config.plugin_path {
        let loaded = registry
            .load_paths([path], &controller.plugin_context())
            .with_context(|| format!("loading plugins from {path}"))?;
        tracing::info!(loaded, methods = ?registry.names(), "loaded plugins");
    }
    registry.merge_into(&mut methods)?;

    let server = Server::new(methods).bind(config.app_addr()).await?;
    server.run().await?;
    Ok(())
}

fn sample_cloud(count: usize, seed: Option<u64>) -> Geometry {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let attributes = vec![
        AttributeDefinition::new("Cd", AttributeDomain::Point, json!([0.1, 0.1, 0.1])),
        AttributeDefinition::new("luminance", AttributeDomain::Point, 1),
        AttributeDefinition::new("label", AttributeDomain::Point, -1),
    ];
    let points = (0..count)
        .map(|_| {
            let colour = rng.gen_range(0..PALETTE.len());
            Point::new(
                rng.gen_range(-10.0..10.0),
                rng.gen_range(-10.0..10.0),
                rng.gen_range(-10.0..10.0),
            )
            .with_attr("Cd", json!(PALETTE[colour]))
            .with_attr("luminance", rng.gen_range(0.0_f64..1.0))
            .with_attr("label", LABELS[colour])
        })
        .collect();
    Geometry::from_points(attributes, points)
}
