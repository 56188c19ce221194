//! wsproxy - single-user VLESS/VMess over WebSocket tunneling proxy

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

use wsproxy::config::{parse_listen, Config};
use wsproxy::error::Result;
use wsproxy::identity;
use wsproxy::{AppState, FileStore, Server, SessionContext, TcpDialer};

fn main() -> Result<()> {
    let args = Args::parse()?;

    if args.version {
        print_version();
        return Ok(());
    }

    if args.gen_uuid {
        println!("{}", Uuid::new_v4());
        return Ok(());
    }

    // Initialize logging
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let mut config = Config::from_env()?;
    args.apply(&mut config);

    info!("wsproxy v{} starting...", env!("CARGO_PKG_VERSION"));

    let store = FileStore::new(&config.config_path);
    let identity = Arc::new(identity::resolve(&config.identity_overrides(), &store));

    let dialer = TcpDialer::new(config.dial_timeout()).with_proxy_ip(config.proxy_ip.clone());
    if let Some(proxy_ip) = &config.proxy_ip {
        info!("Outbound dials redirected to {}", proxy_ip);
    }

    let ctx = SessionContext {
        identity,
        dialer: Arc::new(dialer),
        idle_timeout: config.idle_timeout(),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (shutdown_tx, _) = broadcast::channel(1);
        let state = AppState::new(ctx, shutdown_tx.clone(), config.max_message_size);
        let server = Server::bind(config.listen, state).await?;

        let signal_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutting down..."),
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
            let _ = signal_tx.send(());
        });

        server.run().await
    })?;

    info!("Goodbye!");
    Ok(())
}

/// Command line arguments
#[derive(Default)]
struct Args {
    listen: Option<SocketAddr>,
    uuid: Option<String>,
    protocol: Option<String>,
    proxy_ip: Option<String>,
    config: Option<PathBuf>,
    gen_uuid: bool,
    version: bool,
}

impl Args {
    fn parse() -> Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let mut parsed = Self::default();

        let mut i = 1;
        while i < args.len() {
            let value = args.get(i + 1).cloned();
            match args[i].as_str() {
                "-l" | "--listen" => {
                    if let Some(v) = value {
                        parsed.listen = Some(parse_listen(&v)?);
                        i += 1;
                    }
                }
                "-u" | "--uuid" => {
                    if value.is_some() {
                        parsed.uuid = value;
                        i += 1;
                    }
                }
                "-p" | "--protocol" => {
                    if value.is_some() {
                        parsed.protocol = value;
                        i += 1;
                    }
                }
                "--proxy-ip" => {
                    if value.is_some() {
                        parsed.proxy_ip = value;
                        i += 1;
                    }
                }
                "-c" | "--config" => {
                    if let Some(v) = value {
                        parsed.config = Some(PathBuf::from(v));
                        i += 1;
                    }
                }
                "--gen-uuid" => parsed.gen_uuid = true,
                "-v" | "--version" => parsed.version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                other => eprintln!("Ignoring unknown argument: {}", other),
            }
            i += 1;
        }

        Ok(parsed)
    }

    /// Command line flags win over the environment
    fn apply(&self, config: &mut Config) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if self.uuid.is_some() {
            config.uuid = self.uuid.clone();
        }
        if self.protocol.is_some() {
            config.protocol = self.protocol.clone();
        }
        if self.proxy_ip.is_some() {
            config.proxy_ip = self.proxy_ip.clone();
        }
        if let Some(path) = &self.config {
            config.config_path = path.clone();
        }
    }
}

fn print_help() {
    println!(
        r#"wsproxy - VLESS/VMess over WebSocket tunneling proxy

USAGE:
    wsproxy [OPTIONS]

OPTIONS:
    -l, --listen <ADDR>     Listen address or port (default 0.0.0.0:8000)
    -u, --uuid <UUID>       Identifier override
    -p, --protocol <NAME>   Protocol override: vless or vmess
    --proxy-ip <HOST>       Redirect every outbound dial to this host
    -c, --config <FILE>     Identity file (default config.json)
    --gen-uuid              Print a fresh identifier and exit
    -v, --version           Print version information
    -h, --help              Print help information

ENVIRONMENT:
    LISTEN, PORT, UUID, PROTOCOL, PROXYIP, CONFIG_PATH,
    DIAL_TIMEOUT (seconds), IDLE_TIMEOUT (seconds), RUST_LOG

ENDPOINTS:
    GET /                   Landing page
    GET /<uuid>             Client configuration and share link
    GET /metrics            Prometheus metrics
    Upgrade: websocket      Tunnel session (any path)
"#
    );
}

fn print_version() {
    println!("wsproxy v{}", env!("CARGO_PKG_VERSION"));
    println!("Single-user VLESS/VMess over WebSocket tunneling proxy");
}
