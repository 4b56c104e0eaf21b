use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::error::ErrorKind;
use clap::{ArgMatches, CommandFactory, FromArgMatches};

use crate::cli::Cli;

pub const DEFAULT_PORT: u16 = 2504;
pub const DEFAULT_CONTROLLER: &str = "http://127.0.0.1:3480";

/// A listener port preconfigured with an implicit `CONN` line. Connections
/// accepted on it skip setup entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectPort {
    pub port: u16,
    pub conn_line: String,
}

/// Fully merged runtime settings: defaults, then INI file and argv flags in
/// their argv order (whichever of the two appears later wins per field).
#[derive(Debug, Clone)]
pub struct Settings {
    /// Bind address for all listeners; `*` binds every interface.
    pub bind_addr: String,
    pub port: u16,
    /// `None` logs to stderr.
    pub log_file: Option<PathBuf>,
    /// Controller base URL notifications are sent to.
    pub controller: String,
    pub debug: bool,
    pub direct: Vec<DirectPort>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "*".to_string(),
            port: DEFAULT_PORT,
            log_file: None,
            controller: DEFAULT_CONTROLLER.to_string(),
            debug: false,
            direct: Vec::new(),
        }
    }
}

impl Settings {
    /// Parse argv (including the program name) and merge with the `-c` file
    /// if one is given.
    pub fn from_argv<I, T>(argv: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = match Cli::command().try_get_matches_from(argv) {
            Ok(m) => m,
            Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
                e.exit()
            }
            Err(e) => return Err(e).context("invalid arguments"),
        };
        Self::from_matches(&matches)
    }

    fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let cli = Cli::from_arg_matches(matches).context("invalid arguments")?;
        let config_idx = last_index(matches, "config");
        let ini = match &cli.config {
            Some(path) => IniFile::load(path)?,
            None => IniFile::default(),
        };

        let defaults = Settings::default();

        let bind_addr = pick(
            cli.addr.zip(last_index(matches, "addr")),
            ini.host.get("ip").cloned(),
            config_idx,
            defaults.bind_addr,
        );

        let port_file = match ini.host.get("port") {
            Some(v) => Some(
                v.parse::<u16>()
                    .with_context(|| format!("config [host] port: invalid value {v:?}"))?,
            ),
            None => None,
        };
        let port = pick(
            cli.port.zip(last_index(matches, "port")),
            port_file,
            config_idx,
            defaults.port,
        );

        let log_file = pick(
            cli.log.map(Some).zip(last_index(matches, "log")),
            ini.host.get("log").map(|v| Some(PathBuf::from(v))),
            config_idx,
            None,
        )
        .filter(|p| p.as_os_str() != "-");

        let controller = pick(
            cli.controller.zip(last_index(matches, "controller")),
            ini.host.get("vera").cloned(),
            config_idx,
            defaults.controller,
        );

        let debug_flag = cli
            .debug
            .then(|| last_index(matches, "debug").map(|i| (true, i)))
            .flatten();
        let debug = pick(
            debug_flag,
            ini.host.get("debug").map(|v| parse_bool(v)),
            config_idx,
            false,
        );

        Ok(Settings {
            bind_addr,
            port,
            log_file,
            controller,
            debug,
            direct: ini.direct,
        })
    }
}

/// Argv index of the last occurrence of a flag's value.
fn last_index(matches: &ArgMatches, id: &str) -> Option<usize> {
    matches.indices_of(id).and_then(|ix| ix.last())
}

/// Per-field precedence: a flag that appears after `-c` beats the file, a
/// flag before `-c` is overridden by it, and the file beats the default.
fn pick<T>(flag: Option<(T, usize)>, file: Option<T>, config_idx: Option<usize>, default: T) -> T {
    match (flag, file) {
        (Some((v, i)), Some(f)) => {
            if config_idx.is_none_or(|ci| i > ci) {
                v
            } else {
                f
            }
        }
        (Some((v, _)), None) => v,
        (None, Some(f)) => f,
        (None, None) => default,
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Parsed INI config: a `[host]` key/value section and `[direct]` port
/// mappings. Section names and keys are lower-cased; values keep their case
/// because `[direct]` values are whole CONN lines.
#[derive(Debug, Default)]
struct IniFile {
    host: BTreeMap<String, String>,
    direct: Vec<DirectPort>,
}

impl IniFile {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&text)
    }

    fn parse(text: &str) -> Result<Self> {
        let mut ini = IniFile::default();
        let mut section = String::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
                section = name.trim().to_ascii_lowercase();
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                bail!("config line {}: expected key=value, got {raw:?}", lineno + 1);
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            match section.as_str() {
                "host" => {
                    ini.host.insert(key, value.to_string());
                }
                "direct" => {
                    let port: u16 = key.parse().with_context(|| {
                        format!("config line {}: [direct] key must be a port number", lineno + 1)
                    })?;
                    ini.direct.push(DirectPort {
                        port,
                        conn_line: value.to_string(),
                    });
                }
                // Unknown sections are skipped so configs can carry extra
                // material for other tools.
                _ => {}
            }
        }
        Ok(ini)
    }
}
