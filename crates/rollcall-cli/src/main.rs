use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn register(&self, label: &str, embedding: &str) -> zbus::Result<()>;
    async fn remove(&self, label: &str) -> zbus::Result<bool>;
    async fn list_labels(&self) -> zbus::Result<String>;
    async fn match_face(&self, embedding: &str, tolerance: f64) -> zbus::Result<String>;
    async fn admit(&self, labels: Vec<String>, kind: &str) -> zbus::Result<String>;
    async fn recognize(&self, embeddings: &str) -> zbus::Result<String>;
    async fn stats(&self, days: u32) -> zbus::Result<String>;
    async fn report(&self) -> zbus::Result<String>;
    async fn users(&self) -> zbus::Result<String>;
    async fn export(&self) -> zbus::Result<(u64, String)>;
    async fn reload(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face from a JSON file holding a 128-number array
    Register {
        #[arg(short, long)]
        label: String,
        #[arg(short, long)]
        embedding: PathBuf,
    },
    /// Find the enrolled person closest to an embedding
    Match {
        #[arg(short, long)]
        embedding: PathBuf,
        /// Override the daemon's tolerance
        #[arg(short, long)]
        tolerance: Option<f64>,
    },
    /// Mark attendance for named people
    Admit {
        #[arg(required = true)]
        labels: Vec<String>,
        /// auto, manual or api
        #[arg(short, long, default_value = "manual")]
        kind: String,
    },
    /// Match a batch of embeddings (JSON array of arrays) and mark everyone found
    Recognize {
        #[arg(short, long)]
        embeddings: PathBuf,
    },
    /// List enrolled faces
    List,
    /// Remove an enrolled face
    Remove { label: String },
    /// Attendance statistics
    Stats {
        #[arg(short, long, default_value_t = 30)]
        days: u32,
    },
    /// Print the attendance report
    Report,
    /// List registered people
    Users,
    /// Export the ledger as CSV
    Export {
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Re-read enrolled faces from disk
    Reload,
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::debug!(system_bus = cli.system, "connecting to rollcalld");

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("cannot connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Register { label, embedding } => {
            let body = read_json(&embedding)?;
            proxy.register(&label, &body).await?;
            println!("Face registered for {label}");
        }
        Commands::Match {
            embedding,
            tolerance,
        } => {
            let body = read_json(&embedding)?;
            let reply = proxy.match_face(&body, tolerance.unwrap_or(0.0)).await?;
            print_json(&reply)?;
        }
        Commands::Admit { labels, kind } => {
            let reply = proxy.admit(labels, &kind).await?;
            print_outcomes(&reply)?;
        }
        Commands::Recognize { embeddings } => {
            let body = read_json(&embeddings)?;
            let reply = proxy.recognize(&body).await?;
            let value: serde_json::Value = serde_json::from_str(&reply)?;
            print_outcomes(&value["outcomes"].to_string())?;
            println!(
                "unknown faces: {}, discarded encodings: {}",
                value["unknown_faces"], value["discarded_encodings"]
            );
        }
        Commands::List => {
            let labels: Vec<String> = serde_json::from_str(&proxy.list_labels().await?)?;
            if labels.is_empty() {
                println!("No faces enrolled");
            }
            for label in labels {
                println!("{label}");
            }
        }
        Commands::Remove { label } => {
            if proxy.remove(&label).await? {
                println!("Removed {label}");
            } else {
                println!("{label} was not enrolled");
            }
        }
        Commands::Stats { days } => print_json(&proxy.stats(days).await?)?,
        Commands::Report => print!("{}", proxy.report().await?),
        Commands::Users => print_json(&proxy.users().await?)?,
        Commands::Export { output } => {
            let (rows, csv) = proxy.export().await?;
            std::fs::write(&output, csv)
                .with_context(|| format!("cannot write {}", output.display()))?;
            println!("Exported {rows} records to {}", output.display());
        }
        Commands::Reload => print_json(&proxy.reload().await?)?,
        Commands::Status => print_json(&proxy.status().await?)?,
    }

    Ok(())
}

fn read_json(path: &Path) -> Result<String> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    // Fail locally on malformed input instead of round-tripping to the daemon.
    serde_json::from_str::<serde_json::Value>(&body)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    Ok(body)
}

fn print_json(reply: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(reply)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_outcomes(reply: &str) -> Result<()> {
    let outcomes: serde_json::Map<String, serde_json::Value> = serde_json::from_str(reply)?;
    for (label, outcome) in outcomes {
        match outcome.as_str() {
            Some("admitted") => println!("Attendance marked for {label}"),
            Some("already_marked_today") => {
                println!("Attendance already marked for {label} today")
            }
            _ => println!("{label}: {outcome}"),
        }
    }
    Ok(())
}
