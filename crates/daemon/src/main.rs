/// HSNet Daemon - hidden service endpoint
///
/// Runs one or more endpoints against the in-process loopback substrate:
/// - publishes each endpoint's introset and keeps its inbound paths alive
/// - prefetches configured tags and addresses
/// - in demo mode, opens a conversation between two endpoints

mod loopback;

use anyhow::{bail, Context, Result};
use hsnet_common::{service, time_now_ms, EndpointConfig};
use hsnet_core::{
    Endpoint, EndpointStats, EnsureError, LoggingHandler, ProtocolType, ServiceAddress,
    WorkerPool,
};
use loopback::{Event, LoopbackNet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Level};

const TICK_INTERVAL: Duration = Duration::from_millis(100);
const LOOPBACK_RELAYS: usize = 12;
const CRYPTO_WORKERS: usize = 4;

struct Args {
    command: String,
    config: Option<PathBuf>,
    options: Vec<(String, String)>,
    verbose: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        command: "run".to_string(),
        config: None,
        options: Vec::new(),
        verbose: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--verbose" | "-V" => args.verbose = true,
            "--help" | "-h" => args.command = "help".to_string(),
            "--version" => args.command = "version".to_string(),
            "--config" | "-c" => {
                let path = iter.next().context("--config needs a path")?;
                args.config = Some(PathBuf::from(path));
            }
            "--option" | "-o" => {
                let option = iter.next().context("--option needs key=value")?;
                let (key, value) = option
                    .split_once('=')
                    .with_context(|| format!("option {:?} is not key=value", option))?;
                args.options.push((key.to_string(), value.to_string()));
            }
            other if !other.starts_with('-') => args.command = other.to_string(),
            other => bail!("Unknown flag: {}", other),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    match args.command.as_str() {
        "help" => print_help(),
        "version" => println!("HSNet Daemon v{}", env!("CARGO_PKG_VERSION")),
        "run" => run_endpoint_mode(&args).await?,
        "demo" => run_demo_mode().await?,
        other => {
            eprintln!("Unknown command: {}", other);
            eprintln!("Run with 'help' to see available commands");
            std::process::exit(1);
        }
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<EndpointConfig> {
    let config_path = args.config.clone().unwrap_or_else(|| PathBuf::from("hsnet.toml"));
    let mut config = if config_path.exists() {
        info!("Loading configuration from {:?}", config_path);
        EndpointConfig::from_file(&config_path)?
    } else {
        info!("No configuration file found, using defaults");
        EndpointConfig::default()
    };
    for (key, value) in &args.options {
        config.set_option(key, value)?;
    }
    Ok(config)
}

/// Commands accepted by a running endpoint task
#[derive(Debug)]
enum Command {
    SendText { to: ServiceAddress, text: String },
}

struct EndpointTask {
    name: &'static str,
    endpoint: Endpoint,
    events: mpsc::UnboundedReceiver<Event>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl EndpointTask {
    fn new(
        name: &'static str,
        config: EndpointConfig,
        net: &LoopbackNet,
    ) -> Result<(Self, mpsc::UnboundedSender<Command>)> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (dht, paths) = net.attach(events_tx);
        let worker = Arc::new(WorkerPool::new(CRYPTO_WORKERS)?);
        let endpoint = Endpoint::new(
            config,
            Box::new(dht),
            Box::new(paths),
            Box::new(LoggingHandler::default()),
            worker,
        );
        let task = Self {
            name,
            endpoint,
            events,
            commands,
        };
        Ok((task, commands_tx))
    }

    fn start(&mut self) -> Result<ServiceAddress> {
        self.endpoint.start(time_now_ms())?;
        let address = self
            .endpoint
            .address()
            .context("endpoint started without identity")?;
        info!("[{}] Listening as {}", self.name, address);
        Ok(address)
    }

    fn handle_event(&mut self, event: Event) {
        let now = time_now_ms();
        match event {
            Event::GotIntro(msg) => {
                self.endpoint.handle_got_intro_message(msg, now);
            }
            Event::GotRouter(msg) => {
                self.endpoint.handle_got_router_message(msg, now);
            }
            Event::PathBuilt(built) => {
                self.endpoint.handle_path_built(built, now);
            }
            Event::Frame(frame) => {
                self.endpoint.handle_hidden_service_frame(frame, now);
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        let now = time_now_ms();
        match command {
            Command::SendText { to, text } => {
                match self
                    .endpoint
                    .ensure_path_to_service(to, service::DEFAULT_ENSURE_TIMEOUT_MS, now)
                {
                    Ok(handle) => {
                        let name = self.name;
                        tokio::spawn(async move {
                            match handle.wait().await {
                                Some(session) => {
                                    info!("[{}] Path to {} ready on {}", name, to, session.tag)
                                }
                                None => warn!("[{}] Could not reach {}", name, to),
                            }
                        });
                    }
                    Err(EnsureError::AlreadyPending(_)) => {}
                    Err(e) => {
                        warn!("[{}] {}", self.name, e);
                        return;
                    }
                }
                if !self
                    .endpoint
                    .send_to_service(&to, ProtocolType::Text, text.into_bytes(), now)
                {
                    warn!("[{}] Message to {} dropped", self.name, to);
                }
            }
        }
    }

    async fn run(mut self, shutdown: tokio::sync::watch::Receiver<bool>) -> EndpointStats {
        let mut shutdown = shutdown;
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.endpoint.tick(time_now_ms());
                    ticks += 1;
                    if ticks % 100 == 0 {
                        debug!("[{}] {:?}", self.name, self.endpoint.stats());
                    }
                }
                Some(event) = self.events.recv() => self.handle_event(event),
                Some(command) = self.commands.recv() => self.handle_command(command),
                Some(completion) = self.endpoint.recv_completion() => {
                    self.endpoint.handle_completion(completion, time_now_ms());
                }
                _ = shutdown.changed() => break,
            }
        }
        self.endpoint.stats()
    }
}

/// Run a single endpoint
async fn run_endpoint_mode(args: &Args) -> Result<()> {
    let config = load_config(args)?;
    let net = LoopbackNet::new(LOOPBACK_RELAYS);
    let (mut task, _commands) = EndpointTask::new("endpoint", config, &net)?;
    task.start()?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let running = tokio::spawn(task.run(shutdown_rx));

    info!("Endpoint is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    let stats = running.await?;
    print_stats("endpoint", &stats);
    Ok(())
}

/// Two endpoints on one loopback network, one greeting the other
async fn run_demo_mode() -> Result<()> {
    let net = LoopbackNet::new(LOOPBACK_RELAYS);

    let mut bob_config = EndpointConfig::default();
    bob_config.set_option("tag", "demo")?;
    let (mut alice, alice_commands) = EndpointTask::new("alice", EndpointConfig::default(), &net)?;
    let (mut bob, _bob_commands) = EndpointTask::new("bob", bob_config, &net)?;
    alice.start()?;
    let bob_address = bob.start()?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let alice = tokio::spawn(alice.run(shutdown_rx.clone()));
    let bob = tokio::spawn(bob.run(shutdown_rx));

    // give bob a few ticks to publish
    tokio::time::sleep(TICK_INTERVAL * 5).await;
    alice_commands
        .send(Command::SendText {
            to: bob_address,
            text: "hello from alice".to_string(),
        })
        .map_err(|_| anyhow::anyhow!("alice stopped early"))?;

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(3)) => {}
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
    }
    let _ = shutdown_tx.send(true);

    print_stats("alice", &alice.await?);
    print_stats("bob", &bob.await?);
    Ok(())
}

fn print_stats(name: &str, stats: &EndpointStats) {
    println!("\n========================================");
    println!("         {} endpoint", name);
    println!("========================================");
    println!("Inbound paths:        {}", stats.inbound_paths_ready);
    println!("Introsets published:  {}", stats.intro_sets_published);
    println!("Outbound contexts:    {}", stats.outbound_contexts);
    println!("Sessions:             {}", stats.sessions);
    println!("Established / accepted: {} / {}", stats.sessions_established, stats.sessions_accepted);
    println!("Frames sent / received: {} / {}", stats.frames_sent, stats.frames_received);
    println!("Messages delivered:   {}", stats.messages_delivered);
    println!("Frames dropped:       {}", stats.frames_dropped);
    println!("========================================\n");
}

fn print_help() {
    println!("HSNet Daemon - hidden service endpoint");
    println!();
    println!("USAGE:");
    println!("    hsnet-daemon [COMMAND] [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    run         Run an endpoint on the loopback network (default)");
    println!("    demo        Run two endpoints and open a conversation between them");
    println!("    help        Show this help message");
    println!("    version     Show version information");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <PATH>     TOML configuration (default: hsnet.toml)");
    println!("    -o, --option <K=V>      Endpoint option, e.g. -o paths=6 -o tag=chat");
    println!("    -V, --verbose           Debug logging");
    println!();
    println!("ENDPOINT OPTIONS:");
    println!("    keyfile, netns, tag, prefetch-tag, prefetch-addr, paths, hops,");
    println!("    inbound-policy, inbound-allow, session-timeout");
}
