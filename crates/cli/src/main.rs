use clap::{Parser, Subcommand};
use doqfwd_domain::CliOverrides;
use doqfwd_infrastructure::dns::transport::{DnsUpstream, DoqUpstream};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod bootstrap;
mod query;
mod server;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "doqfwd")]
#[command(version)]
#[command(about = "doqfwd - DNS forwarder over DNS-over-QUIC upstreams")]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE", global = true)]
    config: Option<String>,

    /// Upstream resolver (doq://host:port)
    #[arg(short = 'u', long, global = true)]
    upstream: Option<String>,

    /// TLS server name for the upstream certificate
    #[arg(long, global = true)]
    server_name: Option<String>,

    /// Skip upstream certificate verification
    #[arg(long, global = true)]
    insecure: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Listen for plain DNS over UDP and forward upstream
    Serve {
        /// DNS server port
        #[arg(short = 'd', long)]
        dns_port: Option<u16>,

        /// Bind address
        #[arg(short = 'b', long)]
        bind: Option<String>,
    },
    /// Resolve a single name and print the answer
    Query {
        domain: String,

        #[arg(default_value = "A")]
        record_type: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (dns_port, bind_address) = match &cli.command {
        Command::Serve { dns_port, bind } => (*dns_port, bind.clone()),
        Command::Query { .. } => (None, None),
    };
    let cli_overrides = CliOverrides {
        dns_port,
        bind_address,
        upstream: cli.upstream.clone(),
        server_name: cli.server_name.clone(),
        insecure_skip_verify: cli.insecure,
        log_level: cli.log_level.clone(),
    };

    let config = bootstrap::load_config(cli.config.as_deref(), cli_overrides)?;
    bootstrap::init_logging(&config);

    match cli.command {
        Command::Query {
            domain,
            record_type,
        } => query::run_query(&config, &domain, &record_type).await,
        Command::Serve { .. } => serve(config).await,
    }
}

async fn serve(config: doqfwd_domain::Config) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        upstream = %config.upstream.endpoint,
        "Starting doqfwd"
    );

    let upstream: Arc<dyn DnsUpstream> = Arc::new(DoqUpstream::from_config(&config.upstream)?);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutdown signal received");
                    shutdown.cancel();
                }
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
        });
    }

    let result = server::start_dns_server(
        config.server.listen_addr(),
        Arc::clone(&upstream),
        config.upstream.query_timeout(),
        shutdown,
    )
    .await;

    upstream.close();
    info!("Server shutdown complete");
    result
}
