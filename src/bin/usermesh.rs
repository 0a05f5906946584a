//! usermesh node and discovery CLI

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use usermesh::{common::Config, discovery, service::shutdown_signal, Node, ServiceResolver};

#[derive(Parser)]
#[command(name = "usermesh")]
#[command(about = "User service node with discovery, caching and rate limiting")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// etcd endpoints (comma-separated); overrides the config file
    #[arg(long, global = true, value_delimiter = ',')]
    etcd: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a service node
    Serve {
        /// Service name to register under
        #[arg(long)]
        name: Option<String>,

        /// Bind address for the public HTTP API
        #[arg(long)]
        http: Option<SocketAddr>,

        /// Bind address for the internal RPC listener
        #[arg(long)]
        rpc: Option<SocketAddr>,

        /// Host other instances dial
        #[arg(long)]
        advertise_host: Option<String>,

        /// Redis URL for the cache store
        #[arg(long)]
        redis: Option<String>,
    },

    /// Print the current instances of a service
    Resolve {
        service: String,

        /// Keep printing the set as it changes
        #[arg(long)]
        watch: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if !cli.etcd.is_empty() {
        config.discovery.endpoints = cli.etcd.clone();
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve {
            name,
            http,
            rpc,
            advertise_host,
            redis,
        } => {
            if let Some(name) = name {
                config.service.name = name;
            }
            if let Some(http) = http {
                config.service.http_addr = http;
            }
            if let Some(rpc) = rpc {
                config.service.rpc_addr = rpc;
            }
            if let Some(host) = advertise_host {
                config.service.advertise_host = host;
            }
            if redis.is_some() {
                config.cache.url = redis;
            }
            config.validate()?;

            let node = Node::start(config).await?;
            node.run().await?;
        }

        Commands::Resolve { service, watch } => {
            if config.discovery.endpoints.is_empty() {
                anyhow::bail!("resolve needs etcd endpoints (--etcd or discovery.endpoints)");
            }
            let client = discovery::connect(&config.discovery).await?;
            let resolver = ServiceResolver::new(
                client,
                config.discovery.namespace.clone(),
                config.discovery.dial_timeout(),
            );
            let resolved = resolver.resolve(&service).await?;
            print_instances(&service, &resolved.addresses());

            if watch {
                let mut updates = resolved.subscribe();
                let signal = shutdown_signal();
                tokio::pin!(signal);
                loop {
                    tokio::select! {
                        _ = &mut signal => break,
                        changed = updates.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let addrs = updates.borrow_and_update().clone();
                            print_instances(&service, &addrs);
                        }
                    }
                }
            }
            resolver.close().await;
        }
    }

    Ok(())
}

fn print_instances(service: &str, addrs: &[String]) {
    if addrs.is_empty() {
        println!("{}: no instances", service);
        return;
    }
    println!("{}: {} instance(s)", service, addrs.len());
    for addr in addrs {
        println!("  {}", addr);
    }
}
