use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use prox_common::{HarnessError, TracingSink};
use prox_connection::{
    decode, encode, CloseReason, ConnectionConfig, ConnectionFrame, ConnectionLifecycle, LoggingObserver,
    ReceivePolicy, TuneParams,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Scripted AMQP peer for harness E2E testing
#[derive(Parser, Debug)]
#[command(name = "testpeer")]
#[command(about = "Stands in for the proxy or the workload in harness tests", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept AMQP connections the way a proxy in front of a broker would
    Proxy(ProxyArgs),
    /// Accept the load test flags and optionally connect through the target
    Workload(WorkloadArgs),
}

#[derive(clap::Args, Debug)]
struct ProxyArgs {
    #[arg(long = "listenPort")]
    listen_port: u16,

    #[arg(long = "destinationPort")]
    destination_port: u16,

    #[arg(long = "destinationDNS")]
    destination_dns: String,

    /// Address to bind the listener on
    #[arg(long, default_value = "127.0.0.1")]
    bind_host: String,

    /// Milliseconds to wait before listening
    #[arg(long, default_value = "0")]
    startup_delay_ms: u64,

    /// Never open the listener (readiness never succeeds)
    #[arg(long)]
    never_listen: bool,

    /// Send blocked(<reason>) then unblocked after open-ok
    #[arg(long)]
    blocked_reason: Option<String>,

    /// Close each connection from the server side once it is open
    #[arg(long)]
    close_after_open: bool,

    /// Heartbeat interval proposed in connection.tune
    #[arg(long, default_value = "60")]
    heartbeat: u16,
}

#[derive(clap::Args, Debug)]
struct WorkloadArgs {
    #[arg(long)]
    address: String,

    #[arg(long)]
    listen_address: String,

    #[arg(long)]
    message_size: u64,

    #[arg(long)]
    num_messages: u64,

    #[arg(long)]
    max_threads: u64,

    #[arg(long)]
    clients: u64,

    /// Open and close one AMQP connection per client through --address
    #[arg(long)]
    connect: bool,

    /// Exit code to return when everything else succeeded
    #[arg(long, default_value = "0")]
    exit_code: i32,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let code = match args.command {
        Command::Proxy(proxy) => match run_proxy(proxy).await {
            Ok(()) => 0,
            Err(e) => {
                error!("testpeer proxy failed: {:#}", e);
                1
            }
        },
        Command::Workload(workload) => match run_workload(workload).await {
            Ok(code) => code,
            Err(e) => {
                error!("testpeer workload failed: {:#}", e);
                2
            }
        },
    };
    std::process::exit(code);
}

async fn run_proxy(args: ProxyArgs) -> Result<()> {
    info!(
        "testpeer proxy: listen {} -> {}:{}",
        args.listen_port, args.destination_dns, args.destination_port
    );

    // Registered before anything else so an early SIGTERM is not lost
    let shutdown = shutdown_signal().context("Failed to install signal handlers")?;
    tokio::pin!(shutdown);

    if args.never_listen {
        info!("Never listening, waiting for shutdown");
        shutdown.await;
        info!("testpeer received signal, shutting down");
        return Ok(());
    }

    if args.startup_delay_ms > 0 {
        info!("Delaying startup by {}ms", args.startup_delay_ms);
        tokio::select! {
            _ = sleep(Duration::from_millis(args.startup_delay_ms)) => {}
            _ = &mut shutdown => return Ok(()),
        }
    }

    let listener = TcpListener::bind((args.bind_host.as_str(), args.listen_port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", args.bind_host, args.listen_port))?;
    info!("Listening on {}", listener.local_addr()?);

    let script = Arc::new(ServerScript {
        blocked_reason: args.blocked_reason,
        close_after_open: args.close_after_open,
        heartbeat: args.heartbeat,
    });

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted.context("accept failed")?;
                let script = Arc::clone(&script);
                tokio::spawn(async move {
                    match serve_connection(socket, &script).await {
                        Ok(()) => debug!("Connection from {} finished", peer),
                        Err(e) => debug!("Connection from {} ended: {:#}", peer, e),
                    }
                });
            }
            _ = &mut shutdown => {
                info!("testpeer received signal, shutting down");
                return Ok(());
            }
        }
    }
}

struct ServerScript {
    blocked_reason: Option<String>,
    close_after_open: bool,
    heartbeat: u16,
}

/// Buffered frame reader/writer over one accepted socket.
struct FrameStream {
    socket: TcpStream,
    buffer: Vec<u8>,
}

impl FrameStream {
    fn new(socket: TcpStream) -> Self {
        Self {
            socket,
            buffer: Vec::with_capacity(4096),
        }
    }

    /// Next frame, or `None` once the peer hung up.
    async fn read_frame(&mut self) -> Result<Option<ConnectionFrame>> {
        loop {
            if let Some((frame, used)) = decode(&self.buffer).map_err(|e| anyhow!(e))? {
                self.buffer.drain(..used);
                return Ok(Some(frame));
            }
            let mut chunk = [0u8; 4096];
            let n = self.socket.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    async fn expect(&mut self, expected: &str) -> Result<ConnectionFrame> {
        loop {
            match self.read_frame().await? {
                Some(ConnectionFrame::Heartbeat) => continue,
                Some(frame) if frame.name() == expected => return Ok(frame),
                Some(other) => bail!("expected {} but received {}", expected, other.name()),
                None => bail!("peer hung up while waiting for {}", expected),
            }
        }
    }

    async fn write_frame(&mut self, frame: &ConnectionFrame) -> Result<()> {
        let bytes = encode(frame).map_err(|e| anyhow!(e))?;
        self.socket.write_all(&bytes).await?;
        Ok(())
    }
}

async fn serve_connection(socket: TcpStream, script: &ServerScript) -> Result<()> {
    let mut stream = FrameStream::new(socket);

    stream.expect("protocol-header").await?;
    let mut server_properties = BTreeMap::new();
    server_properties.insert("product".to_string(), "testpeer".to_string());
    stream
        .write_frame(&ConnectionFrame::Start {
            version_major: 0,
            version_minor: 9,
            server_properties,
            mechanisms: "PLAIN".to_string(),
            locales: "en_US".to_string(),
        })
        .await?;
    stream.expect("connection.start-ok").await?;

    stream
        .write_frame(&ConnectionFrame::Tune(TuneParams {
            channel_max: 2047,
            frame_max: 131072,
            heartbeat: script.heartbeat,
        }))
        .await?;
    stream.expect("connection.tune-ok").await?;
    stream.expect("connection.open").await?;
    stream.write_frame(&ConnectionFrame::OpenOk).await?;

    if let Some(ref reason) = script.blocked_reason {
        stream
            .write_frame(&ConnectionFrame::Blocked {
                reason: reason.clone(),
            })
            .await?;
        sleep(Duration::from_millis(50)).await;
        stream.write_frame(&ConnectionFrame::Unblocked).await?;
    }

    if script.close_after_open {
        stream
            .write_frame(&ConnectionFrame::Close {
                reply_code: 320,
                reply_text: "CONNECTION_FORCED - testpeer closing".to_string(),
                class_id: 0,
                method_id: 0,
            })
            .await?;
        // The client may have sent close itself in the meantime
        loop {
            match stream.read_frame().await? {
                Some(ConnectionFrame::CloseOk) | None => return Ok(()),
                Some(ConnectionFrame::Close { .. }) => {
                    stream.write_frame(&ConnectionFrame::CloseOk).await?;
                }
                Some(_) => continue,
            }
        }
    }

    loop {
        match stream.read_frame().await? {
            Some(ConnectionFrame::Close { .. }) => {
                stream.write_frame(&ConnectionFrame::CloseOk).await?;
                return Ok(());
            }
            Some(ConnectionFrame::Heartbeat) => stream.write_frame(&ConnectionFrame::Heartbeat).await?,
            Some(other) => debug!("Ignoring {}", other.name()),
            None => return Ok(()),
        }
    }
}

async fn run_workload(args: WorkloadArgs) -> Result<i32> {
    info!(
        "testpeer workload: address={} listen_address={} message_size={} num_messages={} max_threads={} clients={}",
        args.address, args.listen_address, args.message_size, args.num_messages, args.max_threads, args.clients
    );

    if args.connect {
        let host = args
            .address
            .strip_prefix("amqp://")
            .unwrap_or(&args.address)
            .trim_end_matches('/')
            .to_string();
        let permits = Arc::new(Semaphore::new(args.max_threads.max(1) as usize));

        let mut clients = Vec::new();
        for client in 0..args.clients {
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .context("client limiter closed")?;
            let host = host.clone();
            clients.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                connect_once(client, host)
            }));
        }

        let mut failures = 0;
        for handle in clients {
            match handle.await.context("client task panicked")? {
                Ok(_) => {}
                Err(e) => {
                    warn!("Client connection failed: {}", e);
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            bail!("{} of {} client connections failed", failures, args.clients);
        }
        info!("All {} clients connected and closed", args.clients);
    }

    Ok(args.exit_code)
}

fn connect_once(client: u64, host: String) -> Result<CloseReason, HarnessError> {
    let sink = TracingSink::shared(format!("client-{}", client));
    let mut lifecycle = ConnectionLifecycle::new(LoggingObserver::new(sink.clone()), sink);
    lifecycle.run(ConnectionConfig::new(host, 0), ReceivePolicy::CloseOnOpen)
}

fn shutdown_signal() -> std::io::Result<impl std::future::Future<Output = ()>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        Ok(async move {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = sigint.recv() => {}
            }
        })
    }

    #[cfg(not(unix))]
    {
        Ok(async {
            let _ = tokio::signal::ctrl_c().await;
        })
    }
}
