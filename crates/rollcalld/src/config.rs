use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(BusKind::Session),
            "system" => Ok(BusKind::System),
            other => anyhow::bail!("unknown bus {other:?} (expected session or system)"),
        }
    }
}

/// Daemon configuration, loaded from environment variables.
pub struct DaemonConfig {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    pub bus: BusKind,
    /// Matching and ledger settings handed to the core.
    pub core: rollcall_core::Config,
}

impl DaemonConfig {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    ///
    /// `ROLLCALL_CONFIG` may name a TOML file holding the core settings;
    /// individual variables override it.
    pub fn from_env() -> Result<Self> {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("rollcall.db"));

        let bus = match std::env::var("ROLLCALL_BUS") {
            Ok(v) => v.parse()?,
            Err(_) => BusKind::Session,
        };

        let mut core = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => load_core_config(Path::new(&path))?,
            Err(_) => rollcall_core::Config::default(),
        };
        core.tolerance = env_parse("ROLLCALL_TOLERANCE", core.tolerance);
        core.max_references = env_parse("ROLLCALL_MAX_REFERENCES", core.max_references);
        if let Ok(v) = std::env::var("ROLLCALL_DIMENSION") {
            core.dimension = match v.trim() {
                "" | "auto" => None,
                n => Some(n.parse().with_context(|| format!("ROLLCALL_DIMENSION={n}"))?),
            };
        }
        core.validate()?;

        Ok(Self { db_path, bus, core })
    }
}

fn load_core_config(path: &Path) -> Result<rollcall_core::Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_core_config(&text).with_context(|| format!("parsing {}", path.display()))
}

fn parse_core_config(text: &str) -> Result<rollcall_core::Config> {
    Ok(toml::from_str(text)?)
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
