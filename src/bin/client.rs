//! xtunnel client
//!
//! Builds the configured fronts, keeps an x_tunnel session alive through
//! them and forwards local TCP listeners to remote destinations.

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use xtunnel::{
    config::{generate_example_config, Config, FrontConfig, LoggingConfig},
    front::{FrontRequester, FrontStack},
    transport::{RustlsProvider, TlsProvider},
    tunnel::SessionManager,
};

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Read buffer for local connections
const PIPE_BUFFER: usize = 64 * 1024;

/// xtunnel client - fronted tunnel to an x_tunnel server
#[derive(Parser, Debug)]
#[command(name = "xtunnel-client")]
#[command(about = "Tunnel TCP connections through disguised HTTP(S) fronts")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error); overrides [logging].level
    #[arg(short = 'v', long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the tunnel and forward local listeners
    Run {
        /// LISTEN=HOST:PORT, e.g. 127.0.0.1:8022=example.com:22
        #[arg(short, long = "forward")]
        forwards: Vec<String>,
    },
    /// Probe a single IP through a front and print the result
    CheckIp {
        ip: IpAddr,
        /// Front to probe with (default: the first one)
        #[arg(long)]
        front: Option<String>,
        #[arg(long)]
        sni: Option<String>,
        #[arg(long)]
        host: Option<String>,
    },
    /// Print an example configuration
    GenConfig,
}

/// A local listener and where its connections go
#[derive(Debug, Clone, PartialEq, Eq)]
struct Forward {
    listen: String,
    host: String,
    port: u16,
}

impl std::str::FromStr for Forward {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (listen, target) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("expected LISTEN=HOST:PORT, got {:?}", s))?;
        let (host, port) = target
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("missing port in {:?}", target))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if listen.is_empty() || host.is_empty() {
            bail!("empty listen address or host in {:?}", s);
        }
        let port = port.parse().with_context(|| format!("bad port in {:?}", target))?;
        Ok(Self {
            listen: listen.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::GenConfig = args.command {
        let text = toml::to_string_pretty(&generate_example_config())
            .context("Failed to serialize example config")?;
        println!("{}", text);
        return Ok(());
    }

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    init_logging(&config.logging, args.log_level.as_deref())?;

    match args.command {
        Command::Run { forwards } => run(config, forwards).await,
        Command::CheckIp {
            ip,
            front,
            sni,
            host,
        } => check_ip(&config, ip, front.as_deref(), sni.as_deref(), host.as_deref()).await,
        Command::GenConfig => Ok(()),
    }
}

fn init_logging(logging: &LoggingConfig, level: Option<&str>) -> Result<()> {
    let level = level.unwrap_or(&logging.level);
    let filter = EnvFilter::try_new(level).with_context(|| format!("Bad log level {:?}", level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            let builder = builder.with_ansi(false).with_writer(Mutex::new(file));
            match logging.format.as_str() {
                "json" => builder.json().init(),
                "compact" => builder.compact().init(),
                _ => builder.pretty().init(),
            }
        }
        None => match logging.format.as_str() {
            "json" => builder.json().init(),
            "compact" => builder.compact().init(),
            _ => builder.pretty().init(),
        },
    }
    Ok(())
}

fn tls_for(front: &FrontConfig) -> Result<Arc<dyn TlsProvider>> {
    let provider = RustlsProvider::new(front.browser_profile(), front.cert_name.as_deref())
        .with_context(|| format!("Failed to set up TLS for front {}", front.name))?;
    Ok(Arc::new(provider))
}

async fn run(config: Config, forwards: Vec<String>) -> Result<()> {
    let forwards = forwards
        .iter()
        .map(|f| f.parse::<Forward>())
        .collect::<Result<Vec<_>>>()?;
    if forwards.is_empty() {
        warn!("No --forward given; the tunnel will idle");
    }

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();
    let mut fronts: Vec<Arc<dyn FrontRequester>> = Vec::new();
    for front_config in &config.fronts {
        let stack = FrontStack::build(front_config, tls_for(front_config)?)
            .with_context(|| format!("Failed to build front {}", front_config.name))?;
        tasks.extend(stack.start(cancel.clone()));
        fronts.push(stack.front.clone());
    }

    let manager = Arc::new(
        SessionManager::from_config(&config, fronts).context("Failed to set up session manager")?,
    );
    info!(
        "xtunnel {} starting with {} fronts",
        xtunnel::VERSION,
        config.fronts.len()
    );

    for forward in forwards {
        let listener = TcpListener::bind(&forward.listen)
            .await
            .with_context(|| format!("Failed to listen on {}", forward.listen))?;
        info!(
            "Forwarding {} -> {}:{}",
            forward.listen, forward.host, forward.port
        );
        tasks.push(tokio::spawn(accept_loop(
            listener,
            forward,
            manager.clone(),
            cancel.clone(),
        )));
    }

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.tick().await;
    loop {
        tokio::select! {
            _ = status.tick() => {
                info!("Status:\n{}", manager.status().await);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    cancel.cancel();
    manager.stop().await;
    for task in tasks {
        task.abort();
    }
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    forward: Forward,
    manager: Arc<SessionManager>,
    cancel: CancellationToken,
) {
    loop {
        let (socket, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(a) => a,
                Err(e) => {
                    error!("Accept on {} failed: {}", forward.listen, e);
                    continue;
                }
            },
            _ = cancel.cancelled() => break,
        };

        let manager = manager.clone();
        let forward = forward.clone();
        tokio::spawn(async move {
            if let Err(e) = pipe(socket, &forward, &manager).await {
                debug!("Connection from {} ended: {:#}", peer, e);
            }
        });
    }
}

/// Copy bytes both ways between a local socket and a tunnel stream
async fn pipe(mut socket: TcpStream, forward: &Forward, manager: &SessionManager) -> Result<()> {
    let mut handle = match manager.open_stream(&forward.host, forward.port).await {
        Ok(handle) => handle,
        Err(e) => {
            // Dropping the socket refuses the local client.
            warn!("No tunnel stream to {}:{}: {}", forward.host, forward.port, e);
            return Err(e.into());
        }
    };
    debug!("Stream {} -> {}", handle.id(), handle.destination());

    let (mut reader, mut writer) = socket.split();
    let mut buf = vec![0u8; PIPE_BUFFER];
    let mut local_open = true;

    loop {
        tokio::select! {
            n = reader.read(&mut buf), if local_open => {
                let n = n.context("local read")?;
                if n == 0 {
                    local_open = false;
                    manager.close(&handle);
                    continue;
                }
                manager.write(&handle, Bytes::copy_from_slice(&buf[..n])).await?;
            }
            data = manager.read(&mut handle) => match data? {
                Some(data) => writer.write_all(&data).await.context("local write")?,
                None => break,
            },
        }
    }

    manager.close(&handle);
    let _ = writer.shutdown().await;
    Ok(())
}

async fn check_ip(
    config: &Config,
    ip: IpAddr,
    front: Option<&str>,
    sni: Option<&str>,
    host: Option<&str>,
) -> Result<()> {
    let front_config = match front {
        Some(name) => config
            .front(name)
            .ok_or_else(|| anyhow!("No front named {:?}", name))?,
        None => config
            .fronts
            .first()
            .ok_or_else(|| anyhow!("No fronts configured"))?,
    };

    let stack = FrontStack::build(front_config, tls_for(front_config)?)?;
    match stack.prober.check(ip, sni, host, None, Vec::new()).await {
        Ok(result) => {
            println!("{} OK via front {}", ip, front_config.name);
            println!("  protocol:   {}", result.version);
            println!("  status:     {}", result.status);
            println!("  sni:        {}", result.identity.sni);
            println!("  host:       {}", result.identity.host);
            println!("  handshake:  {} ms", result.handshake.as_millis());
            println!("  first byte: {} ms", result.first_byte.as_millis());
            result.connection.close();
            Ok(())
        }
        Err(e) => {
            let kind = if e.is_identity_rejection() {
                "identity rejected"
            } else {
                "unusable"
            };
            println!("{} {} via front {}: {}", ip, kind, front_config.name, e);
            bail!("check failed")
        }
    }
}
