//! shardd — the shardsql daemon.
//!
//! Assembles every subsystem: the backend registry, the dispatcher, and the
//! protocol relay's acceptor, then drives them until `SIGINT`/`SIGTERM`
//! (mirrors `warpd::main`'s standalone-mode wiring).

mod cli;
mod config;

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;

use shardsql_backend::{BackendOptions, BackendRegistry, BackendSource};
use shardsql_dispatch::Dispatcher;
use shardsql_mapper::{QueryMapper, ReadOneWriteAll};
use shardsql_relay::{run_acceptor, AcceptorConfig, SessionConfig};

use cli::Cli;
use config::ShardConfig;

/// Settings fully resolved from CLI flags and an optional config file, CLI
/// taking precedence (matches `warpd`'s flags-override-file convention).
struct Settings {
    bind_addr: String,
    port: u16,
    backend_source: BackendSource,
    username: String,
    password: String,
    database: Option<String>,
    conns_per_backend: usize,
    workers_per_backend: usize,
    client_workers: usize,
    read_timeout_secs: u64,
    mapper: String,
    autocommit: bool,
    two_pc: bool,
    add_ids: bool,
}

impl Settings {
    fn resolve(cli: Cli) -> anyhow::Result<Self> {
        let file_config = match &cli.config {
            Some(path) => Some(ShardConfig::from_file(path).context("reading shardd.toml")?),
            None => None,
        };

        macro_rules! pick {
            ($field:ident, $default:expr) => {
                cli.$field
                    .clone()
                    .or_else(|| file_config.as_ref().and_then(|c| Some(c.$field.clone())))
                    .unwrap_or_else(|| $default)
            };
        }

        let bind_addr = cli
            .bind_addr
            .or_else(|| file_config.as_ref().map(|c| c.bind_addr.clone()))
            .unwrap_or_else(|| "0.0.0.0".to_string());
        let port = cli
            .port
            .or_else(|| file_config.as_ref().map(|c| c.port))
            .unwrap_or(3306);

        let backends = cli
            .backends
            .clone()
            .or_else(|| file_config.as_ref().and_then(|c| c.backends.clone()));
        let backend_file = cli
            .backend_file
            .clone()
            .or_else(|| file_config.as_ref().and_then(|c| c.backend_file.clone()));
        let backend_source = match (backends, backend_file) {
            (Some(_), Some(_)) => bail!("specify either --backends or --backend-file, not both"),
            (Some(literal), None) => BackendSource::Literal(literal),
            (None, Some(path)) => BackendSource::File(path.into()),
            (None, None) => bail!("one of --backends or --backend-file is required"),
        };

        let username = cli
            .username
            .or_else(|| file_config.as_ref().map(|c| c.username.clone()))
            .context("--username (or config `username`) is required")?;
        let password = pick!(password, String::new());
        let database = cli
            .database
            .clone()
            .or_else(|| file_config.as_ref().and_then(|c| c.database.clone()));

        let conns_per_backend = cli
            .conns_per_backend
            .or_else(|| file_config.as_ref().map(|c| c.conns_per_backend))
            .unwrap_or(4);
        let workers_per_backend = cli
            .workers_per_backend
            .or_else(|| file_config.as_ref().map(|c| c.workers_per_backend))
            .unwrap_or(4);
        let client_workers = cli
            .client_workers
            .or_else(|| file_config.as_ref().map(|c| c.client_workers))
            .unwrap_or(64);
        let read_timeout_secs = cli
            .read_timeout_secs
            .or_else(|| file_config.as_ref().map(|c| c.read_timeout_secs))
            .unwrap_or(300);

        let mapper = cli
            .mapper
            .or_else(|| file_config.as_ref().map(|c| c.mapper.clone()))
            .unwrap_or_else(|| "read-one-write-all".to_string());
        let autocommit = cli.autocommit || file_config.as_ref().is_some_and(|c| c.autocommit);
        let two_pc = cli.two_pc || file_config.as_ref().is_some_and(|c| c.two_pc);
        let add_ids = cli.add_ids || file_config.as_ref().is_some_and(|c| c.add_ids);

        Ok(Self {
            bind_addr,
            port,
            backend_source,
            username,
            password,
            database,
            conns_per_backend,
            workers_per_backend,
            client_workers,
            read_timeout_secs,
            mapper,
            autocommit,
            two_pc,
            add_ids,
        })
    }

    fn build_mapper(&self) -> anyhow::Result<Option<Arc<dyn QueryMapper>>> {
        match self.mapper.as_str() {
            "none" => Ok(None),
            "read-one-write-all" => Ok(Some(Arc::new(ReadOneWriteAll) as Arc<dyn QueryMapper>)),
            other => bail!("unknown mapper {other:?}; expected \"none\" or \"read-one-write-all\""),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,shardd=debug,shardsql=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::resolve(cli)?;

    info!(
        bind_addr = %settings.bind_addr,
        port = settings.port,
        "shardd starting"
    );

    let backend_text = settings
        .backend_source
        .resolve()
        .context("reading initial backend list")?;

    let backend_options = BackendOptions {
        user: settings.username.clone(),
        password: settings.password.clone(),
        database: settings.database.clone(),
        autocommit: settings.autocommit,
        two_pc: settings.two_pc,
    };

    let registry = Arc::new(
        BackendRegistry::load_initial(
            &backend_text,
            backend_options,
            settings.conns_per_backend,
            settings.workers_per_backend,
        )
        .await
        .context("initializing backend registry")?,
    );
    info!("backend registry initialized");

    let mapper = settings.build_mapper()?;
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        mapper,
        settings.add_ids,
        settings.two_pc,
    ));

    let bind_addr: std::net::SocketAddr = format!("{}:{}", settings.bind_addr, settings.port)
        .parse()
        .context("parsing bind address")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let shutdown_signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
        let _ = shutdown_signal_tx.send(true);
    });

    let acceptor_config = AcceptorConfig {
        bind_addr,
        client_workers: settings.client_workers,
        session: SessionConfig {
            read_timeout: std::time::Duration::from_secs(settings.read_timeout_secs),
        },
        backend_source: settings.backend_source,
    };

    run_acceptor(acceptor_config, Arc::clone(&registry), dispatcher, shutdown_rx)
        .await
        .context("acceptor failed")?;

    info!("draining backend registry");
    registry.close_all().await;

    info!("shardd stopped");
    Ok(())
}
