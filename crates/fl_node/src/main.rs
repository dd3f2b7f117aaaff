use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::signal;
use tracing::info;

use fl_crypto::{Aid, Passport};
use fl_directory::{AgentMetadata, Capability, DirectoryProvider, Endpoints, MemoryDirectory};
use fl_events::{EventKind, EventStream};
use fl_rpc::{
    ClientConfig, HeartbeatConfig, RateLimiter, ReconnectPolicy, RequestLogger, RequestOptions,
    RpcClient, RpcServer, ServerConfig, SignaturePolicy,
};

mod identity;

#[derive(Parser, Debug)]
#[command(author, version, about = "Fleetlock agent node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate the node identity and print its AID
    Init {
        #[arg(long, default_value = "fleetlock/identity.seed")]
        identity: PathBuf,
    },
    /// Run the agent node
    Run {
        #[arg(long, default_value = "fleetlock/identity.seed")]
        identity: PathBuf,
        /// Endpoint to serve on, e.g. rpc://0.0.0.0:7450
        #[arg(long, default_value = "rpc://127.0.0.1:7450")]
        bind: String,
        /// Agent name registered in the directory
        #[arg(long, default_value = "fleetlock-node")]
        name: String,
        /// Advertised capability; repeatable
        #[arg(long = "capability", default_value = "echo")]
        capabilities: Vec<String>,
        /// Event replay buffer size
        #[arg(long, default_value_t = 1024)]
        buffer: usize,
        /// Heartbeat interval in seconds; 0 disables
        #[arg(long, default_value_t = 30)]
        heartbeat_secs: u64,
        /// Accept unauthenticated requests
        #[arg(long)]
        allow_anonymous: bool,
        /// Per-sender request budget inside --rate-window-secs; 0 disables
        #[arg(long, default_value_t = 0)]
        rate_limit: usize,
        #[arg(long, default_value_t = 60)]
        rate_window_secs: u64,
    },
    /// Send one signed request to a peer and print the result
    Call {
        #[arg(long, default_value = "fleetlock/identity.seed")]
        identity: PathBuf,
        /// rpc:// URL of the peer
        #[arg(long)]
        to: String,
        #[arg(long)]
        method: String,
        /// JSON parameters
        #[arg(long)]
        params: Option<String>,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Follow a peer's event stream, replay first
    Watch {
        #[arg(long, default_value = "fleetlock/identity.seed")]
        identity: PathBuf,
        #[arg(long)]
        to: String,
        /// Only these event types, e.g. --kind error --kind status
        #[arg(long = "kind")]
        kinds: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Init { identity } => init_command(identity),
        Commands::Run {
            identity,
            bind,
            name,
            capabilities,
            buffer,
            heartbeat_secs,
            allow_anonymous,
            rate_limit,
            rate_window_secs,
        } => {
            run_command(
                identity,
                bind,
                name,
                capabilities,
                buffer,
                heartbeat_secs,
                allow_anonymous,
                rate_limit,
                rate_window_secs,
            )
            .await
        }
        Commands::Call {
            identity,
            to,
            method,
            params,
            timeout_secs,
        } => call_command(identity, to, method, params, timeout_secs).await,
        Commands::Watch { identity, to, kinds } => watch_command(identity, to, kinds).await,
    }
}

async fn call_command(
    identity_path: PathBuf,
    to: String,
    method: String,
    params: Option<String>,
    timeout_secs: u64,
) -> Result<()> {
    let keypair = identity::load_or_generate(&identity_path)?;
    let params = params
        .map(|p| serde_json::from_str::<serde_json::Value>(&p))
        .transpose()?;
    let client = RpcClient::with_shared_directory(keypair, ClientConfig::default());

    let mut opts =
        RequestOptions::new(to, method).timeout(Duration::from_secs(timeout_secs.max(1)));
    if let Some(params) = params {
        opts = opts.params(params);
    }
    let result = client.request(opts).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    client.close().await;
    Ok(())
}

async fn watch_command(identity_path: PathBuf, to: String, kinds: Vec<String>) -> Result<()> {
    let keypair = identity::load_or_generate(&identity_path)?;
    let filter = if kinds.is_empty() {
        None
    } else {
        let kinds = kinds
            .iter()
            .map(|k| serde_json::from_value(json!(k)))
            .collect::<Result<std::collections::HashSet<EventKind>, _>>()?;
        Some(fl_events::EventFilter {
            kinds: Some(kinds),
            ..Default::default()
        })
    };

    let client = RpcClient::new(
        keypair,
        ClientConfig {
            reconnect: ReconnectPolicy {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        },
        fl_directory::shared(),
    );
    let mut events = client.subscribe_events(&to, filter).await?;
    info!(to = %to, "watching event stream; ctrl-c to stop");
    use tokio::sync::broadcast::error::RecvError;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = signal::ctrl_c() => break,
        }
    }
    client.close().await;
    Ok(())
}

fn init_command(identity_path: PathBuf) -> Result<()> {
    let keypair = identity::load_or_generate(&identity_path)?;
    let aid = Aid::from_public_key(&keypair.public_key());
    println!("{aid}");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_command(
    identity_path: PathBuf,
    bind: String,
    name: String,
    capabilities: Vec<String>,
    buffer: usize,
    heartbeat_secs: u64,
    allow_anonymous: bool,
    rate_limit: usize,
    rate_window_secs: u64,
) -> Result<()> {
    let keypair = identity::load_or_generate(&identity_path)?;
    let aid = Aid::from_public_key(&keypair.public_key());
    let passport = Passport::issue(&keypair, capabilities.clone(), None)?;
    info!(did = %aid, name = %name, "node identity ready");

    // Install the node's directory as the process-wide instance so
    // embedded clients resolve peers against the same view.
    let directory: Arc<dyn DirectoryProvider> = Arc::new(MemoryDirectory::new());
    let _ = fl_directory::init_shared(Arc::clone(&directory));
    let stream = Arc::new(EventStream::new(buffer.max(1))?);

    let config = ServerConfig {
        require_auth: !allow_anonymous,
        signature_policy: SignaturePolicy::PayloadOnly,
        heartbeat: (heartbeat_secs > 0).then(|| HeartbeatConfig {
            interval: Duration::from_secs(heartbeat_secs),
        }),
        ..Default::default()
    };
    let server = RpcServer::with_event_stream(config, Some(Arc::clone(&stream)));
    server.use_middleware(Arc::new(RequestLogger));
    if rate_limit > 0 {
        server.use_middleware(Arc::new(RateLimiter::new(
            rate_limit,
            Duration::from_secs(rate_window_secs),
        )));
    }

    server.register("echo", |params, _from| async move {
        Ok(params.unwrap_or(serde_json::Value::Null))
    });
    let describe_passport = passport.clone();
    let describe_name = name.clone();
    server.register("describe", move |_params, _from| {
        let passport = describe_passport.clone();
        let name = describe_name.clone();
        async move {
            Ok(json!({
                "name": name,
                "did": passport.did,
                "capabilities": passport.capabilities,
                "passport": passport,
            }))
        }
    });

    let addr = server.bind(&bind).await?;
    directory
        .register(AgentMetadata {
            did: aid.clone(),
            name: name.clone(),
            capabilities: capabilities.iter().map(|c| Capability::new(c.as_str())).collect(),
            endpoints: Endpoints {
                rpc: Some(format!("rpc://{addr}")),
                http: None,
            },
        })
        .await;

    stream.emit(
        EventKind::Status,
        json!({"state": "started", "endpoint": format!("rpc://{addr}")}),
        Some(aid.clone()),
    );
    info!(addr = %addr, "node running; ctrl-c to stop");

    signal::ctrl_c().await?;
    stream.emit(
        EventKind::Status,
        json!({"state": "stopping"}),
        Some(aid.clone()),
    );
    directory.unregister(&aid).await;
    server.shutdown();
    info!("node stopped");
    Ok(())
}
