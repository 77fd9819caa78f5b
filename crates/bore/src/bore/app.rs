use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::bore::{admin, config, logging, net, telemetry, tunnel};

/// What the command line asked for, before config-file defaults are applied.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub config_path: Option<PathBuf>,
    pub debug_addr: Option<String>,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub enum Role {
    Server(ServerArgs),
    Local(LocalArgs),
}

#[derive(Debug, Clone, Default)]
pub struct ServerArgs {
    pub min_port: Option<u16>,
    pub secret: Option<String>,
    pub bind_addr: Option<String>,
    pub control_port: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct LocalArgs {
    pub local_port: u16,
    pub to: String,
    pub port: u16,
    pub local_host: Option<String>,
    pub secret: Option<String>,
    pub control_port: Option<u16>,
}

pub async fn run(inv: Invocation) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(inv.config_path.clone())?;
    let cfg = match &resolved {
        Some(r) => config::load_config(&r.path)
            .with_context(|| format!("load config: {}", r.path.display()))?,
        None => config::Config::default(),
    };

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if let Some(r) = &resolved {
        tracing::info!(path = %r.path.display(), source = %r.source, "config: loaded");
    }

    let debug_addr = inv
        .debug_addr
        .clone()
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| cfg.debug_addr.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    // The recorder has to be in place before the tunnel emits any metric.
    let prom = if debug_addr.is_empty() {
        None
    } else {
        Some(Arc::new(telemetry::init_prometheus()?))
    };

    let mut pending = None;
    match inv.role {
        Role::Server(args) => {
            let opts = server_options(&cfg.server, args);
            tracing::info!(
                bind_addr = %opts.bind_addr,
                control_port = opts.control_port,
                min_port = opts.min_port,
                pending_timeout = %humantime::format_duration(opts.pending_timeout),
                "bore: starting server"
            );
            let server = tunnel::server::Server::new(opts);
            pending = Some(server.pending());
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { tunnel::run_server(&server, shutdown).await });
        }
        Role::Local(args) => {
            let opts = client_options(&cfg.client, args);
            tracing::info!(
                server = %opts.server_host,
                remote_port = opts.remote_port,
                local = %net::join_host_port(&opts.local_host, opts.local_port),
                "bore: starting client"
            );
            let client = tunnel::client::Client::new(opts)?;
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { tunnel::run_client(&client, shutdown).await });
        }
    }

    // Diagnostics endpoint.
    if let Some(prom) = prom {
        let addr: SocketAddr = net::normalize_bind_addr(&debug_addr)
            .parse()
            .with_context(|| format!("invalid debug_addr: {debug_addr}"))?;
        let state = admin::AdminState { prom, pending };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or the first task to finish.
    let result = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            Ok(())
        }
        res = tasks.join_next() => match res {
            Some(Ok(res)) => res,
            Some(Err(join_err)) => Err(join_err.into()),
            None => Ok(()),
        },
    };
    let _ = shutdown_tx.send(true);

    // Relays in flight are detached tasks; only the listeners are drained here.
    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    result
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn server_options(cfg: &config::ServerConfig, args: ServerArgs) -> tunnel::server::ServerOptions {
    tunnel::server::ServerOptions {
        bind_addr: non_empty(args.bind_addr).unwrap_or_else(|| cfg.bind_addr.clone()),
        control_port: args.control_port.unwrap_or(cfg.control_port),
        min_port: args.min_port.unwrap_or(cfg.min_port),
        secret: non_empty(args.secret).or_else(|| non_empty(Some(cfg.secret.clone()))),
        heartbeat_interval: cfg.heartbeat_interval,
        pending_timeout: cfg.pending_timeout,
    }
}

fn client_options(cfg: &config::ClientConfig, args: LocalArgs) -> tunnel::client::ClientOptions {
    tunnel::client::ClientOptions {
        server_host: args.to.trim().to_string(),
        control_port: args.control_port.unwrap_or(cfg.control_port),
        remote_port: args.port,
        local_host: non_empty(args.local_host).unwrap_or_else(|| cfg.local_host.clone()),
        local_port: args.local_port,
        secret: non_empty(args.secret).or_else(|| non_empty(Some(cfg.secret.clone()))),
        local_dial_timeout: cfg.local_dial_timeout,
    }
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
