//! Command-line surface (spec.md §6's configuration items), mirroring
//! `warpd::Cli`'s flags-with-defaults pattern. Every flag is optional here
//! so that a value can come from either the CLI or `shardd.toml`, with the
//! CLI taking precedence (`warpd`'s flags-override-file convention).

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "shardd", about = "shardsql MySQL dispatch proxy daemon")]
pub struct Cli {
    /// Load configuration from a shardd.toml file; CLI flags below override it.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Interface to bind the listening socket to.
    #[arg(long)]
    pub bind_addr: Option<String>,
    /// Port to listen on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Whitespace-separated `host[:port]` backend list.
    #[arg(long)]
    pub backends: Option<String>,
    /// Path to a file holding the same backend list, re-read on reload.
    #[arg(long)]
    pub backend_file: Option<String>,

    /// Username presented to every backend.
    #[arg(long)]
    pub username: Option<String>,
    /// Password presented to every backend.
    #[arg(long)]
    pub password: Option<String>,
    /// Default database selected on every backend connection.
    #[arg(long)]
    pub database: Option<String>,

    /// Pooled connections per backend (ANY-branch routing).
    #[arg(long)]
    pub conns_per_backend: Option<usize>,
    /// Dispatch workers per backend (ALL-branch fan-out).
    #[arg(long)]
    pub workers_per_backend: Option<usize>,
    /// Client-worker slots (admission control on accepted connections).
    #[arg(long)]
    pub client_workers: Option<usize>,
    /// Client read timeout in seconds.
    #[arg(long)]
    pub read_timeout_secs: Option<u64>,

    /// Query mapper: "none" or "read-one-write-all".
    #[arg(long)]
    pub mapper: Option<String>,
    /// Set SESSION autocommit on every backend connection (ignored when two-phase commit is on).
    #[arg(long)]
    pub autocommit: bool,
    /// Enable two-phase commit across the ALL branch's participants.
    #[arg(long)]
    pub two_pc: bool,
    /// Append a monotonically increasing `-- <id>` comment to fanned-out queries.
    #[arg(long)]
    pub add_ids: bool,
}
