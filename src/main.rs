use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use revp_reconciler::config::Config;
use revp_reconciler::hosts::HostRegistry;
use revp_reconciler::proxy::ProxyDriver;
use revp_reconciler::reconciler::Reconciler;
use revp_reconciler::runtime::{ensure_ssh_config, RemoteRuntimeClient, SshRuntimeClient};
use revp_reconciler::static_routes::StaticRouteStore;
use revp_reconciler::AppState;

#[derive(Parser, Debug)]
#[command(name = "revp-reconciler")]
#[command(author, version, about = "Reconciles container reverse-proxy labels against an external proxy's admin API", long_about = None)]
struct Cli {
    /// Path to the application configuration file
    #[arg(short, long, default_value = "revp.toml", env = "REVP_CONFIG")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(short, long, env = "REVP_LOG_LEVEL")]
    log_level: Option<String>,

    /// Override the configured hosts.yml path
    #[arg(long, env = "REVP_HOSTS_FILE")]
    hosts_file: Option<PathBuf>,

    /// Override the configured static-routes.yml path
    #[arg(long, env = "REVP_STATIC_ROUTES_FILE")]
    static_routes_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

/// Offline validation subcommands, mirroring
/// `original_source/test_hosts_validation.py`'s standalone report: check a
/// config file's shape without starting the reconciler or touching the
/// proxy/runtime.
#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate the hosts configuration file, report DNS
    /// resolution for every enabled host, then exit.
    ValidateHosts,
    /// Load and validate the static routes file, report DNS resolution for
    /// every route's backend, then exit.
    ValidateStaticRoutes,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let hosts_path = cli.hosts_file.clone().unwrap_or_else(|| config.hosts.path.clone());
    let static_routes_path = cli
        .static_routes_file
        .clone()
        .unwrap_or_else(|| config.static_routes.path.clone());

    match cli.command {
        Some(Command::ValidateHosts) => return validate_hosts(&hosts_path),
        Some(Command::ValidateStaticRoutes) => return validate_static_routes(&static_routes_path).await,
        None => {}
    }

    let log_level = cli.log_level.as_ref().unwrap_or(&config.logging.level).clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting revp-reconciler v{}", env!("CARGO_PKG_VERSION"));

    let hosts = HostRegistry::load(&hosts_path)?;
    tracing::info!(
        total = hosts.all_hosts().len(),
        enabled = hosts.enabled_hosts().len(),
        "loaded host registry"
    );

    ensure_ssh_config(&config.ssh.config_path, &hosts)?;

    let resolution = hosts.verify_resolution(true);
    for (alias, result) in &resolution {
        if !result.dns_resolved {
            tracing::warn!(host = %alias, errors = ?result.errors, "host failed DNS resolution at startup");
        }
        for warning in &result.warnings {
            tracing::warn!(host = %alias, "{warning}");
        }
    }

    let static_routes = Arc::new(StaticRouteStore::load(&static_routes_path).await?);

    let runtime: Arc<dyn RemoteRuntimeClient> = Arc::new(SshRuntimeClient::new());

    let proxy = ProxyDriver::new(config.proxy.api_url.clone(), config.proxy.request_timeout_secs)?;

    let reconciler = Reconciler::new(
        hosts,
        Arc::clone(&runtime),
        proxy,
        Arc::clone(&static_routes),
        Duration::from_secs(config.reconcile.interval_secs),
    );

    // Startup sequence, per spec.md §4.6: ensure listeners, apply static
    // routes, begin watching the static-routes file, run startup cleanup
    // against the live runtime state, then spawn the per-host event
    // consumers and the sweep loop.
    reconciler.proxy().ensure_listeners().await?;

    if let Err(e) = reconciler.apply_static_routes().await {
        tracing::error!(error = %e, "failed to apply static routes at startup, will retry on next sweep");
    }

    spawn_static_routes_watch(Arc::clone(&static_routes), Arc::clone(&reconciler));

    if let Err(e) = reconciler.startup_cleanup().await {
        tracing::error!(error = %e, "startup route cleanup failed");
    }

    reconciler.spawn_tasks();

    let metrics_handle = revp_reconciler::api::metrics::init_metrics();
    let state = Arc::new(AppState::new(
        config.clone(),
        Arc::clone(&reconciler),
        Arc::clone(&static_routes),
        metrics_handle,
    ));

    let app = revp_reconciler::api::create_router(state.api_state());

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!("read/query surface listening on http://{}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutdown complete");
    Ok(())
}

/// `revp-reconciler validate-hosts`: load, validate, and DNS-check the
/// hosts file without starting anything else. Exits non-zero (via the
/// propagated error) on a load/parse/validation failure.
fn validate_hosts(path: &PathBuf) -> Result<()> {
    println!("Validating hosts configuration at {}", path.display());
    let registry = HostRegistry::load(path)?;

    println!("  loaded {} host(s):", registry.all_hosts().len());
    for host in registry.all_hosts() {
        println!(
            "    - {} -> {} (enabled: {})",
            host.alias, host.hostname, host.enabled
        );
    }

    println!("  checking DNS resolution for enabled hosts...");
    let resolution = registry.verify_resolution(true);
    let mut any_failed = false;
    for (alias, result) in &resolution {
        if result.dns_resolved {
            println!("    ✓ {alias}: {} -> {}", result.hostname, result.ip_address.as_deref().unwrap_or("?"));
        } else {
            any_failed = true;
            println!("    ✗ {alias}: {} - DNS resolution failed", result.hostname);
            for error in &result.errors {
                println!("        error: {error}");
            }
        }
        for warning in &result.warnings {
            println!("        warning: {warning}");
        }
    }

    if any_failed {
        println!("validation completed with DNS resolution failures (hosts are not disabled automatically)");
    } else {
        println!("validation passed");
    }
    Ok(())
}

/// `revp-reconciler validate-static-routes`: load the static routes file and
/// report DNS resolution for every backend, without touching the proxy.
async fn validate_static_routes(path: &PathBuf) -> Result<()> {
    println!("Validating static routes at {}", path.display());
    let store = StaticRouteStore::load(path).await?;
    store.validate_dns().await;

    let routes = store.list().await;
    println!("  loaded {} static route(s):", routes.len());
    for route in &routes {
        match route.dns_resolved {
            Some(true) => println!(
                "    ✓ {} -> {} ({})",
                route.domain,
                route.backend_url,
                route.backend_ip.as_deref().unwrap_or("?")
            ),
            Some(false) => println!(
                "    ✗ {} -> {}: {}",
                route.domain,
                route.backend_url,
                route.dns_error.as_deref().unwrap_or("unknown error")
            ),
            None => println!("    ? {} -> {} (not checked)", route.domain, route.backend_url),
        }
    }
    Ok(())
}

/// Spawn a task that re-applies the static-route store to the proxy
/// whenever the on-disk file changes, per spec.md §4.6 step 3. The watcher
/// itself lives in `StaticRouteStore::watch`; this just drains its change
/// channel and re-drives the proxy.
fn spawn_static_routes_watch(static_routes: Arc<StaticRouteStore>, reconciler: Arc<Reconciler>) {
    let mut rx = match static_routes.watch() {
        Ok(rx) => rx,
        Err(e) => {
            tracing::error!(error = %e, "failed to start static routes file watcher");
            return;
        }
    };

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            tracing::info!("static routes file changed, re-applying to proxy");
            if let Err(e) = reconciler.apply_static_routes().await {
                tracing::error!(error = %e, "failed to re-apply static routes after file change");
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
