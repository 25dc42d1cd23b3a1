//! Tidewire CLI
//!
//! Thin wrapper around tidewire-core for running a host and poking at it.
//!
//! ## Usage
//!
//! ```bash
//! # Run a host with types from a config file
//! tidewire serve --config tidewire.json
//!
//! # Follow a group (cache replay first, then live traffic)
//! tidewire watch 127.0.0.1:11235 Widget PeerState
//!
//! # Publish or remove an object
//! tidewire publish 127.0.0.1:11235 Widget '{"id": 1, "color": "red"}'
//! tidewire publish 127.0.0.1:11235 Widget '{"id": 1}' --remove
//!
//! # List the types a host knows
//! tidewire schemas 127.0.0.1:11235
//! ```

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tidewire_core::logging::AuditLayer;
use tidewire_core::transport::tcp;
use tidewire_core::{
    host, BrokerConfig, ControlMessage, Guest, Payload, Registry, StructSchema, Transmission,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;

/// Tidewire - typed publish/subscribe broker
#[derive(Parser)]
#[command(name = "tidewire")]
#[command(version)]
#[command(about = "Tidewire - typed publish/subscribe broker with cached object replay")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a broker host
    Serve {
        /// JSON config file
        #[arg(short, long, env = "TIDEWIRE_CONFIG")]
        config: Option<PathBuf>,

        /// Address to listen on (overrides the config)
        #[arg(short, long)]
        listen: Option<String>,

        /// Host name announced to guests (overrides the config)
        #[arg(short, long)]
        name: Option<String>,

        /// Write a JSONL audit log into this directory
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },

    /// Join groups and print what arrives
    Watch {
        /// Host address
        addr: String,

        /// Groups to join
        #[arg(required = true)]
        groups: Vec<String>,

        /// Guest name
        #[arg(long, default_value = "tidewire-watch")]
        name: String,
    },

    /// Publish one object given as a JSON object keyed by property name
    Publish {
        /// Host address
        addr: String,

        /// Type name
        type_name: String,

        /// Object as JSON
        json: String,

        /// Remove the object instead (only key properties are needed)
        #[arg(long)]
        remove: bool,

        /// Guest name
        #[arg(long, default_value = "tidewire-publish")]
        name: String,
    },

    /// List the types a host knows
    Schemas {
        /// Host address
        addr: String,

        /// Only these types
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,

        /// Skip these types
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,

        /// Print definitions as JSON
        #[arg(long)]
        json: bool,
    },
}

fn setup_logging(verbosity: u8, audit: Option<(&Path, &str)>) -> Result<()> {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let audit_layer = match audit {
        Some((dir, broker)) => Some(
            AuditLayer::new(dir, broker)
                .with_context(|| format!("failed to open audit log in {}", dir.display()))?,
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(audit_layer)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            listen,
            name,
            log_dir,
        } => {
            let mut config = match config {
                Some(path) => BrokerConfig::load(&path)
                    .with_context(|| format!("failed to load config {}", path.display()))?,
                None => BrokerConfig::default(),
            };
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if let Some(name) = name {
                config.name = name;
            }
            setup_logging(
                cli.verbose,
                log_dir.as_deref().map(|dir| (dir, config.name.as_str())),
            )?;
            serve(config).await
        }
        Commands::Watch { addr, groups, name } => {
            setup_logging(cli.verbose, None)?;
            watch(&addr, &groups, &name).await
        }
        Commands::Publish {
            addr,
            type_name,
            json,
            remove,
            name,
        } => {
            setup_logging(cli.verbose, None)?;
            publish(&addr, &type_name, &json, remove, &name).await
        }
        Commands::Schemas {
            addr,
            only,
            exclude,
            json,
        } => {
            setup_logging(cli.verbose, None)?;
            schemas(&addr, only, exclude, json).await
        }
    }
}

async fn serve(config: BrokerConfig) -> Result<()> {
    let broker = config.build_broker()?;
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to listen on {}", config.listen))?;
    println!("{} listening on {}", config.name, listener.local_addr()?);

    let (handle, task) = host::spawn(broker, config.sweep_interval());
    let cancel = CancellationToken::new();
    let server = tokio::spawn(tcp::serve(listener, handle.clone(), cancel.clone()));

    tokio::signal::ctrl_c().await?;
    println!("shutting down");
    cancel.cancel();
    handle.shutdown();
    server.await??;
    task.await?;
    Ok(())
}

async fn watch(addr: &str, groups: &[String], name: &str) -> Result<()> {
    let mut guest = Guest::connect(addr, name, true).await?;
    guest.request_schemas(None, None).await?;
    for group in groups {
        guest.join(group).await?;
    }
    for transmission in guest.finish_preload().await? {
        print_transmission(guest.registry(), &transmission);
    }
    while let Some(transmission) = guest.recv().await? {
        print_transmission(guest.registry(), &transmission);
    }
    println!("host closed the connection");
    Ok(())
}

fn print_transmission(registry: &Registry, transmission: &Transmission) {
    let header = &transmission.header;
    match &transmission.payload {
        Payload::Object(instance) => {
            let operation = if header.remove {
                "remove"
            } else if header.from_cache.is_some() {
                "cached"
            } else {
                "update"
            };
            let body = match registry.find_struct(instance.type_name()) {
                Some(schema) => schema.instance_to_json(instance).to_string(),
                None => format!("{:?}", instance),
            };
            println!("{} {} {}", instance.type_name(), operation, body);
        }
        Payload::Control(ControlMessage::CacheInfo {
            type_name: Some(type_name),
            end_transmission: true,
            ..
        }) => println!("{} end-of-replay", type_name),
        Payload::Control(_) => {}
    }
}

async fn publish(addr: &str, type_name: &str, json: &str, remove: bool, name: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(json).context("object must be valid JSON")?;
    let mut guest = Guest::connect(addr, name, false).await?;
    let found = guest
        .request_schemas(Some(vec![type_name.to_string()]), None)
        .await?;
    let schema = found
        .into_iter()
        .find(|s| s.name == type_name)
        .ok_or_else(|| anyhow!("host does not know type '{}'", type_name))?;

    let instance = schema.instance_from_json(&value)?;
    if remove {
        guest.remove(&schema, instance).await?;
    } else {
        guest.publish(&schema, instance, None).await?;
    }
    guest.close().await?;
    println!("{} {}", if remove { "removed" } else { "published" }, type_name);
    Ok(())
}

async fn schemas(addr: &str, only: Vec<String>, exclude: Vec<String>, json: bool) -> Result<()> {
    let mut guest = Guest::connect(addr, "tidewire-schemas", false).await?;
    let whitelist = (!only.is_empty()).then_some(only);
    let blacklist = (!exclude.is_empty()).then_some(exclude);
    let structs = guest.request_schemas(whitelist, blacklist).await?;
    guest.close().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&structs)?);
        return Ok(());
    }
    if structs.is_empty() {
        println!("No types found.");
    }
    for schema in &structs {
        print_schema(schema);
    }
    Ok(())
}

fn print_schema(schema: &StructSchema) {
    println!("{} [{}]", schema.name, schema.flags.to_flag_string());
    for property in &schema.properties {
        println!(
            "  {:>2} {}{}: {:?}",
            property.tag,
            property.name,
            if property.key { " (key)" } else { "" },
            property.kind
        );
    }
}
