use std::path::PathBuf;

use crate::error::{BackendError, BackendResult};

const DEFAULT_PORT: u16 = 3306;

/// Where the whitespace-separated backend list comes from: a literal string
/// (spec.md §6 "backend address") or a file re-read on every reload (spec.md
/// §6 "backend file"). `resolve` is what both `load_initial` and a SIGUSR1/
/// SIGUSR2-triggered reload call to get the current text.
#[derive(Debug, Clone)]
pub enum BackendSource {
    Literal(String),
    File(PathBuf),
}

impl BackendSource {
    pub fn resolve(&self) -> BackendResult<String> {
        match self {
            BackendSource::Literal(s) => Ok(s.clone()),
            BackendSource::File(path) => std::fs::read_to_string(path).map_err(BackendError::Io),
        }
    }
}

/// Immutable backend identity: `(host, port)`, compared by exact string and
/// port equality for reuse across a reload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Backend {
    pub host: String,
    pub port: u16,
}

impl Backend {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn parse_token(token: &str) -> BackendResult<Self> {
        if token.is_empty() {
            return Err(BackendError::InvalidToken(token.to_string()));
        }
        match token.split_once(':') {
            Some((host, port_str)) => {
                let port: u16 = port_str
                    .parse()
                    .map_err(|_| BackendError::InvalidToken(token.to_string()))?;
                if host.is_empty() {
                    return Err(BackendError::InvalidToken(token.to_string()));
                }
                Ok(Backend::new(host, port))
            }
            None => Ok(Backend::new(token, DEFAULT_PORT)),
        }
    }
}

/// Parse a backend source: whitespace-separated tokens, each `host` or
/// `host:port`. Whitespace is any of space/tab/CR/LF. Empty tokens are
/// ignored; an empty result is rejected (spec.md §4.3/§6).
pub fn parse_backend_source(source: &str) -> BackendResult<Vec<Backend>> {
    let backends: Vec<Backend> = source
        .split(|c: char| c == ' ' || c == '\t' || c == '\r' || c == '\n')
        .filter(|tok| !tok.is_empty())
        .map(Backend::parse_token)
        .collect::<BackendResult<Vec<_>>>()?;

    if backends.is_empty() {
        return Err(BackendError::EmptySource);
    }
    Ok(backends)
}
