use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Read;
use std::path::{Path, PathBuf};

// Generates `RollcallProxy` (async) and `RollcallProxyBlocking`.
#[zbus::proxy(
    interface = "org.rollcall.Rollcall1",
    default_service = "org.rollcall.Rollcall1",
    default_path = "/org/rollcall/Rollcall1"
)]
trait Rollcall {
    async fn enroll(
        &self,
        display_name: &str,
        external_ref: &str,
        references: Vec<Vec<f64>>,
    ) -> zbus::Result<String>;
    async fn add_reference(&self, id: &str, vector: Vec<f64>) -> zbus::Result<()>;
    async fn remove_identity(&self, id: &str) -> zbus::Result<()>;
    async fn compact(&self, id: &str) -> zbus::Result<()>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn get_identity(&self, id: &str) -> zbus::Result<String>;
    async fn observe(&self, probe: Vec<f64>) -> zbus::Result<String>;
    async fn query(&self, start: &str, end: &str) -> zbus::Result<String>;
    async fn history(&self, id: &str, start: &str, end: &str) -> zbus::Result<String>;
    async fn export(&self, start: &str, end: &str) -> zbus::Result<String>;
    async fn correct(&self, id: &str, day: &str, time: &str) -> zbus::Result<String>;
    async fn stats(&self, start: &str, end: &str) -> zbus::Result<String>;
    async fn backup(&self, path: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Bus {
    Session,
    System,
}

#[derive(Parser)]
#[command(name = "rollcall", about = "rollcall attendance CLI")]
struct Cli {
    /// Message bus the daemon is registered on
    #[arg(long, value_enum, default_value = "session", global = true)]
    bus: Bus,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a person from a JSON file of reference vectors (array of arrays)
    Enroll {
        /// Display name
        name: String,
        /// JSON file with the reference vectors ("-" for stdin)
        #[arg(short, long)]
        vectors: PathBuf,
        /// External reference code (e.g., employee number)
        #[arg(short, long)]
        external_ref: Option<String>,
    },
    /// Add one reference vector (JSON array) to an enrolled person
    AddReference {
        id: String,
        #[arg(short, long)]
        vector: PathBuf,
    },
    /// Remove an enrolled person (attendance history is kept)
    Remove { id: String },
    /// Collapse a person's reference vectors into their centroid
    Compact { id: String },
    /// List enrolled people
    List,
    /// Show one enrolled person
    Get { id: String },
    /// Resolve a probe vector (JSON array) and mark attendance on a match
    Observe {
        #[arg(short, long)]
        vector: PathBuf,
    },
    /// Attendance events between two days (YYYY-MM-DD, end defaults to start)
    Query { start: String, end: Option<String> },
    /// One person's attendance between two days (end defaults to today)
    History {
        id: String,
        start: String,
        end: Option<String>,
    },
    /// Export rows between two days
    Export { start: String, end: Option<String> },
    /// Correct one person's attendance for a day
    Correct {
        id: String,
        day: String,
        /// Mark present at this time (HH:MM or HH:MM:SS)
        #[arg(long, conflicts_with = "delete", required_unless_present = "delete")]
        time: Option<String>,
        /// Delete the day's entry
        #[arg(long)]
        delete: bool,
    },
    /// Recognition and attendance statistics (defaults to today)
    Stats {
        start: Option<String>,
        end: Option<String>,
    },
    /// Copy the daemon's database to a new file
    Backup { path: PathBuf },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::debug!(bus = ?cli.bus, "connecting to rollcalld");

    let conn = match cli.bus {
        Bus::Session => zbus::Connection::session().await,
        Bus::System => zbus::Connection::system().await,
    }
    .context("connecting to D-Bus")?;
    let proxy = RollcallProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;
    tracing::debug!(unique_name = ?conn.unique_name(), "connected");

    match cli.command {
        Commands::Enroll {
            name,
            vectors,
            external_ref,
        } => {
            let references = read_vectors(&vectors)?;
            let id = proxy
                .enroll(&name, external_ref.as_deref().unwrap_or(""), references)
                .await?;
            println!("{id}");
        }
        Commands::AddReference { id, vector } => {
            proxy.add_reference(&id, read_vector(&vector)?).await?;
            println!("reference added to {id}");
        }
        Commands::Remove { id } => {
            proxy.remove_identity(&id).await?;
            println!("removed {id}");
        }
        Commands::Compact { id } => {
            proxy.compact(&id).await?;
            println!("compacted {id}");
        }
        Commands::List => print_json(&proxy.list_identities().await?)?,
        Commands::Get { id } => print_json(&proxy.get_identity(&id).await?)?,
        Commands::Observe { vector } => print_json(&proxy.observe(read_vector(&vector)?).await?)?,
        Commands::Query { start, end } => {
            let end = end.unwrap_or_else(|| start.clone());
            print_json(&proxy.query(&start, &end).await?)?;
        }
        Commands::History { id, start, end } => {
            let end = end.unwrap_or_else(today);
            print_json(&proxy.history(&id, &start, &end).await?)?;
        }
        Commands::Export { start, end } => {
            let end = end.unwrap_or_else(|| start.clone());
            print_json(&proxy.export(&start, &end).await?)?;
        }
        Commands::Correct {
            id,
            day,
            time,
            delete,
        } => {
            let time = if delete { String::new() } else { time.unwrap_or_default() };
            print_json(&proxy.correct(&id, &day, &time).await?)?;
        }
        Commands::Stats { start, end } => {
            let start = start.unwrap_or_else(today);
            let end = end.unwrap_or_else(|| start.clone());
            print_json(&proxy.stats(&start, &end).await?)?;
        }
        Commands::Backup { path } => {
            let dest = absolute(&path)?;
            let written = proxy.backup(&dest.to_string_lossy()).await?;
            println!("backup written to {written}");
        }
        Commands::Status => print_json(&proxy.status().await?)?,
    }

    Ok(())
}

fn today() -> String {
    chrono::Local::now().date_naive().format("%Y-%m-%d").to_string()
}

// The daemon resolves paths against its own working directory.
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()
        .context("resolving current directory")?
        .join(path))
}

fn read_source(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn read_vector(path: &Path) -> Result<Vec<f64>> {
    parse_vector(&read_source(path)?)
}

fn read_vectors(path: &Path) -> Result<Vec<Vec<f64>>> {
    parse_vectors(&read_source(path)?)
}

fn parse_vector(text: &str) -> Result<Vec<f64>> {
    let v: Vec<f64> = serde_json::from_str(text).context("expected a JSON array of numbers")?;
    if v.is_empty() {
        bail!("vector is empty");
    }
    Ok(v)
}

fn parse_vectors(text: &str) -> Result<Vec<Vec<f64>>> {
    let v: Vec<Vec<f64>> =
        serde_json::from_str(text).context("expected a JSON array of number arrays")?;
    if v.is_empty() {
        bail!("no reference vectors given");
    }
    Ok(v)
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
