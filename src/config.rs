//! Immutable server configuration, built once at startup

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::DaemonOpts;
use crate::protocol::timeouts;

pub const DEFAULT_BIND: &str = "0.0.0.0:514";

/// Keys accepted in the TOML config file. All optional.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub root_dir: Option<PathBuf>,
    pub bind_addr: Option<String>,
    pub io_timeout_secs: Option<u64>,
    pub preamble_timeout_secs: Option<u64>,
    pub transfer_log: Option<PathBuf>,
    pub strict_symlinks: Option<bool>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let cfg: FileConfig = toml::from_str(&data)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub root: PathBuf,
    pub bind_addr: String,
    pub io_timeout: Duration,
    pub preamble_timeout: Duration,
    pub transfer_log: Option<PathBuf>,
    pub strict_symlinks: bool,
}

impl ServerConfig {
    /// Defaults around `root`; call [`ServerConfig::validate`] before use.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            bind_addr: DEFAULT_BIND.to_string(),
            io_timeout: Duration::from_secs(timeouts::IO_SECS),
            preamble_timeout: Duration::from_secs(timeouts::PREAMBLE_SECS),
            transfer_log: None,
            strict_symlinks: true,
        }
    }

    /// Merge command-line options over the config file (if any).
    pub fn from_sources(opts: &DaemonOpts, file: Option<FileConfig>) -> Result<Self> {
        let file = file.unwrap_or_default();
        let root = opts
            .root_dir
            .clone()
            .or(file.root_dir)
            .context("Root directory must be specified using --root-dir or root_dir in the config file")?;

        let mut cfg = Self::new(root);
        if let Some(bind) = opts.bind_addr.clone().or(file.bind_addr) {
            cfg.bind_addr = normalize_bind(&bind);
        }
        if let Some(secs) = opts.io_timeout_secs.or(file.io_timeout_secs) {
            cfg.io_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = opts.preamble_timeout_secs.or(file.preamble_timeout_secs) {
            cfg.preamble_timeout = Duration::from_secs(secs);
        }
        cfg.transfer_log = opts.transfer_log.clone().or(file.transfer_log);
        cfg.strict_symlinks = !opts.lexical_containment && file.strict_symlinks.unwrap_or(true);
        cfg.validate()
    }

    pub fn validate(mut self) -> Result<Self> {
        if !self.root.exists() {
            bail!("Root directory does not exist: {}", self.root.display());
        }
        if !self.root.is_dir() {
            bail!("Root path is not a directory: {}", self.root.display());
        }
        self.root = std::fs::canonicalize(&self.root)
            .with_context(|| format!("Failed to canonicalize root path: {}", self.root.display()))?;
        if self.io_timeout.is_zero() || self.preamble_timeout.is_zero() {
            bail!("Timeouts must be greater than zero");
        }
        Ok(self)
    }
}

/// `:514` means every interface, as with the classic daemon flags.
fn normalize_bind(bind: &str) -> String {
    match bind.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => bind.to_string(),
    }
}
