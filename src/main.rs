use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use httpcache::config::{CONFIG_ENV, Config, DEFAULT_CONFIG_PATH, ServerType};
use httpcache::server::Server;
use httpcache::service::HttpCache;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

const MONITOR_PERIOD: Duration = Duration::from_secs(10);

fn init_tracing() {
    // RUST_LOG overrides the default level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}

/// First CLI argument, then `HTTPCACHE_CONFIG`, then the default path.
fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os(CONFIG_ENV))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(unix)]
fn spawn_diagnostics(service: &Arc<HttpCache>, config: &Config) {
    use httpcache::command::CommandServer;

    if config.server.diag_host.is_empty() {
        return;
    }

    let commands = Arc::new(CommandServer::new(
        Arc::clone(service),
        config.dump_file.clone(),
    ));
    let diag_host = config.server.diag_host.clone();
    tokio::spawn(async move {
        if let Err(e) = commands.serve(&diag_host).await {
            error!(error = %e, "diagnostic socket failed");
        }
    });
}

#[cfg(not(unix))]
fn spawn_diagnostics(_service: &Arc<HttpCache>, _config: &Config) {}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = config_path();
    let config = Config::load(&path)?;
    info!(
        config = %path.display(),
        backend = %config.backend_addr(),
        workers = config.proxy.worker_count(),
        "configuration loaded"
    );

    let service = Arc::new(HttpCache::builder(&config).build());

    spawn_diagnostics(&service, &config);
    tokio::spawn(Arc::clone(&service).monitor(MONITOR_PERIOD));

    let server = match config.server.server_type {
        ServerType::Http => {
            Server::bind(format!("{}:{}", config.server.local_host, config.server.port)).await?
        }
        #[cfg(unix)]
        ServerType::Unix => Server::bind_unix(&config.server.local_host).await?,
        #[cfg(not(unix))]
        ServerType::Unix => return Err("unix sockets are not supported on this platform".into()),
    }
    .read_timeout(config.read_timeout())
    .request_timeout(config.request_timeout());

    let router = Arc::new(service.router());
    let handler = move |req| {
        let router = Arc::clone(&router);
        async move { router.route(req).await }
    };

    tokio::select! {
        result = server.run(handler) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    Ok(())
}
