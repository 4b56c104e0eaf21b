use clap::Parser;
use std::path::PathBuf;

/// Command-line surface.
///
/// Later flags override earlier ones, and `-c` merges its file at the
/// position it appears; that ordering is resolved in `settings.rs` from the
/// raw argv indices. `-V` is a historical alias for the controller URL flag,
/// so clap's automatic version flag is disabled.
#[derive(Parser, Debug)]
#[command(
    name = "sockproxyd",
    disable_version_flag = true,
    about = "Pass-through TCP proxy for a single-threaded automation controller"
)]
pub struct Cli {
    /// Bind address; `*` means all interfaces.
    #[arg(short = 'a', value_name = "ADDR")]
    pub addr: Option<String>,

    /// Command listener port.
    #[arg(short = 'p', value_name = "PORT")]
    pub port: Option<u16>,

    /// Log file path; `-` or unset logs to stderr.
    #[arg(short = 'L', value_name = "FILE")]
    pub log: Option<PathBuf>,

    /// Controller base URL for notifications.
    #[arg(short = 'N', short_alias = 'V', value_name = "URL")]
    pub controller: Option<String>,

    /// Enable debug logging.
    #[arg(short = 'D')]
    pub debug: bool,

    /// INI configuration file.
    #[arg(short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,
}
