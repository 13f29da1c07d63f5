use clap::{Parser, Subcommand};
use log::{error, info};
use peer_overlay::{Config, Node, Result, setup_logging};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "peer-overlay")]
#[command(about = "A self-organizing peer-to-peer overlay for commands and files")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a peer and read commands from stdin
    Start {
        /// Address to listen on
        #[arg(short, long)]
        listen: Option<SocketAddr>,
        /// Address other peers should use to reach this one
        #[arg(short, long)]
        advertise: Option<SocketAddr>,
        /// Bootstrap peer address (host:port); omit to create a new network
        #[arg(short, long)]
        bootstrap: Option<String>,
        /// Directory to share files from
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// Directory received files are written to
        #[arg(long)]
        downloads: Option<PathBuf>,
        /// Node name for logs
        #[arg(short, long)]
        name: Option<String>,
        /// JSON config file; flags override its values
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// One line typed at the prompt.
#[derive(Debug, PartialEq, Eq)]
enum DriverCommand {
    PrintRoutingTable,
    Command { text: String, peer_id: String },
    Notify { text: String, peer_id: String },
    FileRequest { path: String, peer_id: String },
}

impl DriverCommand {
    /// `print r`, `command <text> <peerId>`, `notify <text> <peerId>` or
    /// `file_request <path> <peerId>`.
    /// The peer id is the last word; everything between is the argument.
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (verb, rest) = line.split_once(char::is_whitespace)?;
        let rest = rest.trim();

        match verb {
            "print" if rest == "r" => Some(DriverCommand::PrintRoutingTable),
            "command" | "notify" | "file_request" => {
                let (argument, peer_id) = rest.rsplit_once(char::is_whitespace)?;
                let argument = argument.trim().to_string();
                let peer_id = peer_id.to_string();
                if argument.is_empty() {
                    return None;
                }
                match verb {
                    "command" => Some(DriverCommand::Command {
                        text: argument,
                        peer_id,
                    }),
                    "notify" => Some(DriverCommand::Notify {
                        text: argument,
                        peer_id,
                    }),
                    _ => Some(DriverCommand::FileRequest {
                        path: argument,
                        peer_id,
                    }),
                }
            }
            _ => None,
        }
    }
}

async fn execute(node: Arc<Node>, command: DriverCommand) {
    match command {
        DriverCommand::PrintRoutingTable => {
            println!("{}", node.get_routing_table().await);
        }
        DriverCommand::Command { text, peer_id } => match node.send_command(&text, &peer_id).await {
            Ok(outcome) => println!("{}", outcome),
            Err(e) => println!("command failed: {}", e),
        },
        DriverCommand::Notify { text, peer_id } => match node.notify_command(&text, &peer_id).await {
            Ok(peer) => println!("delivered to {}", peer),
            Err(e) => println!("notify failed: {}", e),
        },
        DriverCommand::FileRequest { path, peer_id } => match node.request_file(&path, &peer_id).await {
            Ok(report) => println!(
                "received {} ({} bytes, {} chunks) -> {}",
                report.path,
                report.bytes,
                report.chunks,
                report.saved_to.display()
            ),
            Err(e) => println!("file request failed: {}", e),
        },
    }
}

async fn run_driver(node: Arc<Node>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down");
                break;
            }
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                break;
            }
        };

        match DriverCommand::parse(&line) {
            Some(command) => {
                tokio::spawn(execute(node.clone(), command));
            }
            None if line.trim().is_empty() => {}
            None => println!("invalid command"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            listen,
            advertise,
            bootstrap,
            dir,
            downloads,
            name,
            config,
        } => {
            let mut config = match config {
                Some(path) => Config::from_file(&path)?,
                None => Config::default(),
            };
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            if advertise.is_some() {
                config.advertise_addr = advertise;
            }
            if bootstrap.is_some() {
                config.bootstrap_peer = bootstrap;
            }
            if let Some(dir) = dir {
                config.shared_dir = dir;
            }
            if let Some(downloads) = downloads {
                config.download_dir = downloads;
            }
            if let Some(name) = name {
                config.node_name = name;
            }

            let bootstrap = config.bootstrap_peer.clone();
            let node = Arc::new(Node::bind(config).await?);
            println!("node id: {:#}", node.node_id());

            match bootstrap {
                Some(peer) => {
                    if let Err(e) = node.join_network(&peer).await {
                        println!("join failed: {} (running as a standalone network)", e);
                        node.create_network().await?;
                    }
                }
                None => node.create_network().await?,
            }

            run_driver(node.clone()).await;
            node.shutdown().await?;
        }
    }

    Ok(())
}
