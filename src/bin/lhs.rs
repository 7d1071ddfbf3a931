//! LHS CLI binary.
//!
//! Liminal Handshake Sequence server and client.
//!
//! # Commands
//!
//! - `serve` - Accept connections, complete handshakes, echo Flow messages
//! - `connect` - Perform a handshake and print the established session
//! - `keygen` - Generate trust key material

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::{SinkExt, StreamExt};
use lhs::{
    client::HandshakeClient,
    protocol::{
        AllowAll, AuthDescriptor, Bind, BindContext, Hello, IdentityProvider, KeyMaterial,
        StaticTokens, ThreadId, TrustSealer, TrustVerifier,
    },
    server::{status_router, EchoFlow, HandshakeServer, ServerConfig},
    transport::Binding,
    Config, VERSION,
};
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "lhs")]
#[command(version = VERSION)]
#[command(about = "Liminal Handshake Sequence - ordered, replay-safe session establishment", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept connections and echo Flow messages
    Serve {
        /// Config file (default: ~/.config/lhs/config.toml if present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen address
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Transport binding (duplex, upgrade)
        #[arg(short, long)]
        binding: Option<Binding>,

        /// Serve /health and /status on this address
        #[arg(long)]
        status: Option<SocketAddr>,

        /// Ed25519 signing seed (hex); a fresh key is generated if absent
        #[arg(long, conflicts_with = "hmac_key")]
        key: Option<String>,

        /// Shared HMAC-SHA256 key (hex) instead of Ed25519
        #[arg(long)]
        hmac_key: Option<String>,

        /// Accepted credential as scheme:token (repeatable; default accepts any)
        #[arg(long = "accept")]
        accept: Vec<String>,

        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Perform a handshake and print the session as JSON
    Connect {
        /// Server URL (ws://host:port/path)
        url: String,

        /// Server Ed25519 public key (hex)
        #[arg(long, required_unless_present = "hmac_key")]
        server_key: Option<String>,

        /// Shared HMAC-SHA256 key (hex)
        #[arg(long)]
        hmac_key: Option<String>,

        /// Thread id (UUID or ULID); generated if absent
        #[arg(long)]
        thread: Option<String>,

        /// Bearer token
        #[arg(long, default_value = "anonymous")]
        token: String,

        /// Credential scheme
        #[arg(long, default_value = "bearer")]
        scheme: String,

        /// Declared intent carried in Bind
        #[arg(long)]
        intent: Option<String>,

        /// Transport binding (duplex, upgrade)
        #[arg(short, long)]
        binding: Option<Binding>,

        /// Config file for timeouts and retry
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Send this message after the handshake and print the reply
        #[arg(short, long)]
        message: Option<String>,

        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate trust key material
    Keygen {
        /// Generate a shared HMAC key instead of an Ed25519 pair
        #[arg(long)]
        hmac: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            listen,
            binding,
            status,
            key,
            hmac_key,
            accept,
            verbose,
        } => cmd_serve(config, listen, binding, status, key, hmac_key, accept, verbose),

        Commands::Connect {
            url,
            server_key,
            hmac_key,
            thread,
            token,
            scheme,
            intent,
            binding,
            config,
            message,
            verbose,
        } => cmd_connect(ConnectArgs {
            url,
            server_key,
            hmac_key,
            thread,
            token,
            scheme,
            intent,
            binding,
            config,
            message,
            verbose,
        }),

        Commands::Keygen { hmac } => cmd_keygen(hmac),
    }
}

fn init_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => match Config::default_path().filter(|p| p.exists()) {
            Some(path) => Config::from_file(&path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => Config::default(),
        },
    };
    Ok(config.with_env())
}

#[allow(clippy::too_many_arguments)]
fn cmd_serve(
    config: Option<PathBuf>,
    listen: Option<SocketAddr>,
    binding: Option<Binding>,
    status: Option<SocketAddr>,
    key: Option<String>,
    hmac_key: Option<String>,
    accept: Vec<String>,
    verbose: bool,
) -> anyhow::Result<()> {
    init_logging(verbose);

    let mut config = load_config(config)?;
    if let Some(listen) = listen {
        config.server.listen = listen;
    }
    if let Some(binding) = binding {
        config.server.binding = binding;
    }
    config.validate()?;

    let sealer = match (key, hmac_key) {
        (_, Some(hmac)) => TrustSealer::hmac(KeyMaterial::from_hex(&hmac)?)?,
        (Some(seed), None) => TrustSealer::ed25519_from_hex(&seed)?,
        (None, None) => {
            tracing::warn!("No --key given; using an ephemeral Ed25519 key");
            TrustSealer::generate()
        },
    };
    if let Some(public) = sealer.public_key_hex() {
        tracing::info!(public_key = %public, "Trust key");
    }

    let identity: Arc<dyn IdentityProvider> = if accept.is_empty() {
        tracing::warn!("No --accept credentials; every Bind credential is accepted");
        Arc::new(AllowAll)
    } else {
        let mut tokens = StaticTokens::new();
        for entry in &accept {
            let (scheme, token) = entry
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("Invalid --accept {entry:?}; use scheme:token"))?;
            tokens.insert(scheme, token);
        }
        Arc::new(tokens)
    };

    let server = Arc::new(HandshakeServer::new(
        ServerConfig::from_config(&config),
        sealer,
        identity,
    ));

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        if let Some(addr) = status {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            let app = status_router(server.state());
            tracing::info!("Status endpoint on {}", addr);
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!("Status server error: {}", e);
                }
            });
        }

        server.run(Arc::new(EchoFlow)).await?;
        Ok::<_, anyhow::Error>(())
    })
}

struct ConnectArgs {
    url: String,
    server_key: Option<String>,
    hmac_key: Option<String>,
    thread: Option<String>,
    token: String,
    scheme: String,
    intent: Option<String>,
    binding: Option<Binding>,
    config: Option<PathBuf>,
    message: Option<String>,
    verbose: bool,
}

fn cmd_connect(args: ConnectArgs) -> anyhow::Result<()> {
    init_logging(args.verbose);
    let config = load_config(args.config)?;

    let mut verifier = TrustVerifier::new();
    if let Some(public) = &args.server_key {
        verifier = TrustVerifier::ed25519_from_hex(public)?;
    }
    if let Some(hmac) = &args.hmac_key {
        verifier = verifier.with_hmac(KeyMaterial::from_hex(hmac)?);
    }

    let thread = match &args.thread {
        Some(raw) => ThreadId::parse(raw)?,
        None => ThreadId::generate(),
    };
    let mut bind = Bind::new(&thread, AuthDescriptor::new(args.scheme, args.token));
    if let Some(intent) = args.intent {
        bind = bind.with_context(BindContext {
            intent: Some(intent),
            affect: None,
        });
    }

    let client = HandshakeClient::new(Hello::default(), bind, verifier).with_config(&config);
    let binding = args.binding.unwrap_or(config.server.binding);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let (session, mut stream) = client.connect(&args.url, binding).await?;
        println!("{}", serde_json::to_string_pretty(&session)?);

        if let Some(message) = args.message {
            stream.send(Message::Text(message)).await?;
            if let Some(reply) = stream.next().await {
                println!("{}", reply?);
            }
        }
        stream.close(None).await.ok();
        Ok::<_, anyhow::Error>(())
    })
}

fn cmd_keygen(hmac: bool) -> anyhow::Result<()> {
    if hmac {
        let key = KeyMaterial::generate(32);
        println!("hmac_key: {}", hex::encode(key.as_bytes()));
        return Ok(());
    }

    let signing = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
    println!("seed:       {}", hex::encode(signing.to_bytes()));
    println!("public_key: {}", hex::encode(signing.verifying_key().to_bytes()));
    Ok(())
}
