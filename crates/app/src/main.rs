use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// A multiplexing HTTP proxy front-end: accepts client connections, authenticates them
/// via an embedder policy callback, and dispatches each request to a direct tunnel, a
/// chained HTTP/SOCKS tunnel, a forwarded-HTTP leg, or a synthetic custom response.
#[derive(Parser, Debug)]
#[command(about, version)]
struct Args {
	/// Port to listen on. 0 binds an OS-assigned ephemeral port.
	#[arg(long, default_value_t = 8000)]
	port: u16,

	/// Realm string sent in the `Server` header and `Proxy-Authenticate: Basic realm="..."` challenges.
	#[arg(long, default_value = "ProxyChain")]
	realm: String,

	/// Enable verbose (debug-level) logging.
	#[arg(short, long)]
	verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	setup_logging(args.verbose);

	let config = proxychain::ServerConfig::new()
		.with_port(args.port)
		.with_auth_realm(args.realm)
		.with_verbose(args.verbose);

	let server = proxychain::Server::listen(config).await?;
	info!(target: "proxychain::app", port = server.port(), "listening");

	tokio::signal::ctrl_c().await?;
	info!(target: "proxychain::app", "shutting down");
	server.close(false).await;
	info!(target: "proxychain::app", "shutdown complete");

	Ok(())
}

fn setup_logging(verbose: bool) {
	let default_directive = if verbose { "debug" } else { "info" };
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
	tracing_subscriber::fmt().with_env_filter(filter).init();
}
