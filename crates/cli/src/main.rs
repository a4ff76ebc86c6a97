mod config;
mod error;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use agent::{ChannelConfig, UnixConnector};
use clap::{Parser, Subcommand};
use guard::{FileGuard, GuardObserver};
use policy::{AccessRequest, AccessRule, AccessType, Decision};
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use error::{Error, Result};

const CONFIG_FILE: &str = "fileguard.toml";
/// `check` exit status when the request would be denied.
const DENIED_EXIT_CODE: i32 = 2;

#[derive(Parser)]
#[command(name = "fileguard")]
#[command(about = "Mediate file access for the enforcement agent", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./fileguard.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Agent socket, overriding the config file
    #[arg(short, long, global = true)]
    socket: Option<PathBuf>,

    /// Access rule as PATH=POLICY (read-write, read-only, no-access); first match wins
    #[arg(short, long = "rule", global = true)]
    rules: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register with the enforcement agent and resolve its requests until Ctrl-C
    Run,
    /// Resolve a single request against the rules, without an agent (exits 2 if denied)
    Check {
        /// Path being accessed
        path: String,
        /// Check a write instead of a read
        #[arg(short, long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout carries monitoring status and decisions.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let rules = parse_rules(&cli.rules)?;

    match cli.command {
        Commands::Run => {
            let config = load_config(cli.config.as_deref())?;
            cmd_run(config.channel(cli.socket), rules).await
        }
        Commands::Check { path, write } => {
            let access = if write {
                AccessType::Write
            } else {
                AccessType::Read
            };
            let decision = cmd_check(AccessRequest::new(path, access), &rules);
            if !decision.is_allowed() {
                std::process::exit(DENIED_EXIT_CODE);
            }
            Ok(())
        }
    }
}

/// Status reported by the guard, forwarded to the main task.
#[derive(Debug)]
enum Status {
    Started,
    Stopped,
    Error(String),
}

struct ConsoleObserver(mpsc::UnboundedSender<Status>);

impl GuardObserver for ConsoleObserver {
    fn on_started(&self) {
        let _ = self.0.send(Status::Started);
    }

    fn on_stopped(&self) {
        let _ = self.0.send(Status::Stopped);
    }

    fn on_error(&self, message: &str) {
        let _ = self.0.send(Status::Error(message.to_string()));
    }
}

async fn cmd_run(channel: ChannelConfig, rules: Vec<AccessRule>) -> Result<()> {
    let connector = UnixConnector::new(&channel.socket);
    println!("fileguard v{}", env!("CARGO_PKG_VERSION"));
    println!("Agent socket: {}", connector.path().display());

    let guard = FileGuard::new(connector, channel);
    if rules.is_empty() {
        println!("No rules: every access is allowed.");
    }
    for rule in rules {
        println!("Rule: {} = {}", rule.path_prefix, rule.policy);
        guard.add_rule(rule);
    }

    let (tx, mut status) = mpsc::unbounded_channel();
    let observer: Arc<dyn GuardObserver> = Arc::new(ConsoleObserver(tx));
    guard.start(&observer);

    let mut stopping = false;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c(), if !stopping => {
                signal?;
                println!("\nStopping...");
                stopping = true;
                guard.stop();
            }
            next = status.recv() => match next {
                Some(Status::Started) => println!("Monitoring started. Press Ctrl-C to stop."),
                Some(Status::Stopped) | None => break,
                Some(Status::Error(message)) => return Err(Error::Monitoring(message)),
            },
        }
    }

    println!("Monitoring stopped.");
    Ok(())
}

fn cmd_check(request: AccessRequest, rules: &[AccessRule]) -> Decision {
    let decision = policy::resolve(&request, rules);
    let matched = rules.iter().find(|rule| rule.matches(&request.path));
    match matched {
        Some(rule) => println!(
            "{decision} ({} {} = {})",
            request.access, rule.path_prefix, rule.policy
        ),
        None => println!("{decision} (no matching rule)"),
    }
    decision
}

fn parse_rules(args: &[String]) -> Result<Vec<AccessRule>> {
    args.iter()
        .map(|arg| arg.parse::<AccessRule>().map_err(Error::from))
        .collect()
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Ok(Config::load(path)?),
        None if Path::new(CONFIG_FILE).exists() => Ok(Config::load(CONFIG_FILE)?),
        None => Ok(Config::default()),
    }
}
