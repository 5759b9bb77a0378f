//! Command-line options for the rcpd binary

use clap::Parser;
use std::path::PathBuf;

/// Daemon options; anything left unset falls back to the config file, then
/// to built-in defaults.
#[derive(Clone, Debug, Default, Parser)]
#[command(
    name = "rcpd",
    version,
    about = "Serve the legacy rcp remote-copy protocol from a root directory"
)]
pub struct DaemonOpts {
    /// Root directory for file operations
    #[arg(long, alias = "root_dir")]
    pub root_dir: Option<PathBuf>,

    /// Bind address (host:port), 0.0.0.0:514 by default
    #[arg(long, alias = "bind_addr")]
    pub bind_addr: Option<String>,

    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Per-operation I/O timeout in seconds
    #[arg(long)]
    pub io_timeout_secs: Option<u64>,

    /// Total time allowed for a client to send its command, in seconds
    #[arg(long)]
    pub preamble_timeout_secs: Option<u64>,

    /// Append an audit line per transfer to this file
    #[arg(long)]
    pub transfer_log: Option<PathBuf>,

    /// Only check containment lexically; do not resolve symlinks
    #[arg(long)]
    pub lexical_containment: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_legacy_underscore_flags() {
        let opts =
            DaemonOpts::try_parse_from(["rcpd", "--root_dir", "/srv", "--bind_addr", ":1514"]).unwrap();
        assert_eq!(opts.root_dir, Some(PathBuf::from("/srv")));
        assert_eq!(opts.bind_addr.as_deref(), Some(":1514"));
        assert!(!opts.lexical_containment);
    }

    #[test]
    fn parses_tuning_flags() {
        let opts = DaemonOpts::try_parse_from([
            "rcpd",
            "--root-dir",
            "/srv",
            "--io-timeout-secs",
            "5",
            "--preamble-timeout-secs",
            "7",
            "--lexical-containment",
        ])
        .unwrap();
        assert_eq!(opts.io_timeout_secs, Some(5));
        assert_eq!(opts.preamble_timeout_secs, Some(7));
        assert!(opts.lexical_containment);
    }
}
