use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use a3s_agent_bridge::probe::{dry_run, probe_agent, probe_bus, probe_client_id, probe_topic};
use a3s_agent_bridge::provider::mqtt::connection_hints;
use a3s_agent_bridge::{
    Bridge, BridgeConfig, BusEvent, BusProvider, CommandAgent, InboundMessage, MqttProvider,
    Publisher, ResponseEnvelope, Result, Status,
};
use clap::{Parser, Subcommand};
use colored::Colorize;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(
    name = "a3s-agent-bridge",
    version,
    about = "a3s-agent-bridge — forward MQTT instructions to a local command-line agent"
)]
struct Cli {
    /// Broker host (overrides MQTT_BROKER_HOST / MQTT_BROKER)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Broker port (overrides MQTT_BROKER_PORT / MQTT_PORT)
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge until interrupted (default)
    Serve,
    /// Publish an instruction to the inbound topic
    Send {
        /// Instruction text (words are joined with spaces)
        #[arg(required = true)]
        message: Vec<String>,
        /// Correlation id; sends JSON instead of plain text
        #[arg(short, long)]
        request_id: Option<String>,
    },
    /// Print envelopes published on the outbound topic
    Listen,
    /// Check broker connectivity and the agent executable
    Check {
        /// Also run this instruction through the agent (no broker) and
        /// print the envelope the bridge would publish
        #[arg(short, long)]
        message: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    if let Err(e) = run(cli).await {
        eprintln!("{} {e}", "[a3s-agent-bridge]".red().bold());
        std::process::exit(1);
    }
}

fn init_logging() {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_ansi(ansi)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = BridgeConfig::from_env()?;
    if let Some(host) = cli.host {
        config.broker_host = host;
    }
    if let Some(port) = cli.port {
        config.broker_port = port;
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Send {
            message,
            request_id,
        } => send(&config, message.join(" "), request_id).await,
        Commands::Listen => listen(&config).await,
        Commands::Check { message } => check(&config, message.as_deref()).await,
    }
}

async fn serve(config: BridgeConfig) -> Result<()> {
    tracing::info!("Starting MQTT agent bridge service...");
    tracing::info!(
        broker = %config.broker_addr(),
        inbound = %config.inbound_topic,
        outbound = %config.outbound_topic,
        client_id = %config.client_id,
        agent = %config.agent.executable,
        agent_id = %config.agent.agent_id,
        status_policy = %config.status_policy,
        "Bridge configuration"
    );

    let hints = connection_hints(&config);
    let provider = MqttProvider::new(&config);
    let agent = Arc::new(CommandAgent::new(config.agent.clone()));
    let mut bridge = Bridge::new(config, provider, agent);

    if let Err(e) = bridge.connect().await {
        tracing::error!(error = %e, "Broker connection failed");
        for hint in hints {
            tracing::error!("{}", hint);
        }
        return Err(e);
    }

    tracing::info!("Waiting for messages...");
    bridge.run_until(shutdown_signal()).await
}

/// Copy of `config` with a throwaway client id so harness sessions never
/// evict the running bridge
fn harness_config(config: &BridgeConfig, purpose: &str) -> BridgeConfig {
    BridgeConfig {
        client_id: probe_client_id(purpose),
        ..config.clone()
    }
}

async fn send(config: &BridgeConfig, message: String, request_id: Option<String>) -> Result<()> {
    let payload = match &request_id {
        Some(id) => serde_json::to_vec(&serde_json::json!({
            "message": message,
            "request_id": id,
        }))?,
        None => message.clone().into_bytes(),
    };

    let mut provider = MqttProvider::new(&harness_config(config, "send"));
    provider.connect().await?;
    let published = provider.publish(&config.inbound_topic, payload).await;
    provider.disconnect().await?;
    published?;

    println!("{} sent to {}", "✓".green(), config.inbound_topic.bold());
    println!("  message:    {}", message);
    if let Some(id) = request_id {
        println!("  request_id: {}", id);
    }
    Ok(())
}

async fn listen(config: &BridgeConfig) -> Result<()> {
    let mut provider = MqttProvider::new(&harness_config(config, "listen"));
    provider.connect().await?;
    provider.subscribe(&config.outbound_topic).await?;

    println!(
        "Listening on {} at {} (Ctrl+C to exit)\n",
        config.outbound_topic.bold(),
        config.broker_addr()
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let event = tokio::select! {
            _ = &mut shutdown => break,
            event = provider.next_event() => event,
        };

        match event {
            Some(BusEvent::Message(message)) => {
                print_envelope(&message);
                provider.ack(&message).await?;
            }
            Some(BusEvent::Connected { .. }) => {
                provider.subscribe(&config.outbound_topic).await?;
            }
            Some(BusEvent::Disconnected { reason }) => {
                tracing::warn!(%reason, "Connection lost, waiting for reconnect");
            }
            Some(BusEvent::Subscribed { .. }) => {}
            None => break,
        }
    }

    provider.disconnect().await
}

fn print_envelope(message: &InboundMessage) {
    let rule = "─".repeat(60);
    println!("{}", rule.dimmed());
    println!("topic: {}", message.topic);

    match serde_json::from_slice::<ResponseEnvelope>(&message.payload) {
        Ok(envelope) => {
            let status = match envelope.status {
                Status::Success => envelope.status.to_string().green(),
                Status::Error => envelope.status.to_string().red(),
            };
            println!("timestamp:  {}", envelope.timestamp);
            let request_id = match envelope.request_id {
                Some(serde_json::Value::String(id)) => id,
                Some(id) => id.to_string(),
                None => "N/A".to_string(),
            };
            println!("request_id: {}", request_id);
            println!("message:    {}", envelope.message.as_deref().unwrap_or("N/A"));
            println!("status:     {}", status);
            if let Some(response) = envelope.response {
                println!("\n{}", response);
            }
            if let Some(error) = envelope.error {
                println!("\n{} {}", "error:".red().bold(), error);
            }
        }
        Err(_) => println!("{}", String::from_utf8_lossy(&message.payload)),
    }
    println!();
}

async fn check(config: &BridgeConfig, message: Option<&str>) -> Result<()> {
    println!("{} {}", "Broker".bold(), config.broker_addr());
    let mut provider = MqttProvider::new(&harness_config(config, "check"));
    let bus = probe_bus(&mut provider, &probe_topic(), CHECK_TIMEOUT).await;
    match &bus {
        Ok(report) => println!(
            "  {} connect {:?}, subscribe {:?}, round trip {:?}",
            "✓".green(),
            report.connect,
            report.subscribe,
            report.round_trip
        ),
        Err(e) => {
            println!("  {} {}", "✗".red(), e);
            for hint in connection_hints(config) {
                println!("    {}", hint.dimmed());
            }
        }
    }

    println!("{} {}", "Agent".bold(), config.agent.executable);
    let agent = probe_agent(&config.agent).await;
    match &agent {
        Ok(version) => println!("  {} {}", "✓".green(), version),
        Err(e) => println!("  {} {}", "✗".red(), e),
    }

    if let Some(message) = message {
        println!("{} {}", "Dry run".bold(), message);
        let runner = Arc::new(CommandAgent::new(config.agent.clone()));
        let (envelope, body) = dry_run(runner, message, config.status_policy).await;
        let mark = match envelope.status {
            Status::Success => "✓".green(),
            Status::Error => "✗".red(),
        };
        println!("  {} {}", mark, body);
    }

    bus.map(|_| ()).and(agent.map(|_| ()))
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
