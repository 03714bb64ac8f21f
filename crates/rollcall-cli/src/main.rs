use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn add_identity(
        &self,
        id: &str,
        name: &str,
        role: &str,
        section: &str,
    ) -> zbus::Result<()>;
    async fn enroll(&self, identity_id: &str, descriptor: Vec<f64>) -> zbus::Result<()>;
    async fn recognize(&self, descriptors: Vec<Vec<f64>>) -> zbus::Result<String>;
    async fn mark_automatic(&self, descriptors: Vec<Vec<f64>>) -> zbus::Result<String>;
    async fn mark_roll_call(&self, entries: Vec<(String, bool)>) -> zbus::Result<String>;
    async fn history(&self, identity_id: &str, from: &str, to: &str) -> zbus::Result<String>;
    async fn report(&self, filter: &str) -> zbus::Result<String>;
    async fn stats(&self, from: &str, to: &str) -> zbus::Result<String>;
    async fn notifications(&self, identity_id: &str, mark_read: bool) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update an identity
    AddIdentity {
        id: String,
        name: String,
        /// student, teacher, parent or admin
        #[arg(short, long, default_value = "student")]
        role: String,
        #[arg(short, long)]
        section: Option<String>,
    },
    /// Enroll (or replace) the face descriptor of an identity
    Enroll {
        #[arg(long)]
        id: String,
        /// JSON file holding one descriptor array
        #[arg(short, long)]
        descriptor: PathBuf,
    },
    /// Match descriptors against enrolled identities without recording
    Recognize {
        /// JSON file holding one descriptor or an array of descriptors
        file: PathBuf,
    },
    /// Match descriptors and record today's attendance
    Mark {
        /// JSON file holding one descriptor or an array of descriptors
        file: PathBuf,
    },
    /// Submit a manual roll call for today
    RollCall {
        #[arg(long, num_args = 1..)]
        present: Vec<String>,
        #[arg(long, num_args = 1..)]
        absent: Vec<String>,
    },
    /// Attendance history of one identity, newest first
    History {
        id: String,
        /// First day, YYYY-MM-DD
        #[arg(long)]
        from: Option<String>,
        /// Last day, YYYY-MM-DD
        #[arg(long)]
        to: Option<String>,
    },
    /// Filtered attendance report
    Report {
        #[arg(long)]
        identity: Option<String>,
        /// present, late or absent
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },
    /// Counts by status and by day
    Stats {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },
    /// Attendance notifications of one identity
    Notifications {
        id: String,
        /// Mark the listed notifications as read
        #[arg(long)]
        mark_read: bool,
    },
    /// Show daemon status
    Status,
}

/// A descriptor file holds either a single vector or a list of them.
/// `[]` is an empty list: the extractor found no faces.
#[derive(Deserialize)]
#[serde(untagged)]
enum DescriptorFile {
    Many(Vec<Vec<f64>>),
    One(Vec<f64>),
}

impl DescriptorFile {
    fn into_vec(self) -> Vec<Vec<f64>> {
        match self {
            DescriptorFile::One(values) => vec![values],
            DescriptorFile::Many(list) => list,
        }
    }
}

fn parse_descriptors(raw: &str) -> Result<Vec<Vec<f64>>> {
    let file: DescriptorFile =
        serde_json::from_str(raw).context("expected a JSON array of numbers or of arrays")?;
    Ok(file.into_vec())
}

fn read_descriptors(path: &Path) -> Result<Vec<Vec<f64>>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    parse_descriptors(&raw).with_context(|| format!("invalid descriptor file {}", path.display()))
}

fn read_single_descriptor(path: &Path) -> Result<Vec<f64>> {
    let mut list = read_descriptors(path)?;
    if list.len() != 1 {
        bail!(
            "{} holds {} descriptors; enrollment takes exactly one",
            path.display(),
            list.len()
        );
    }
    Ok(list.remove(0))
}

fn roll_call_entries(present: Vec<String>, absent: Vec<String>) -> Vec<(String, bool)> {
    present
        .into_iter()
        .map(|id| (id, true))
        .chain(absent.into_iter().map(|id| (id, false)))
        .collect()
}

fn report_filter(
    identity: Option<String>,
    status: Option<String>,
    from: Option<String>,
    to: Option<String>,
) -> String {
    let mut filter = serde_json::Map::new();
    let fields = [
        ("identity_id", identity),
        ("status", status.map(|s| s.to_ascii_lowercase())),
        ("from", from),
        ("to", to),
    ];
    for (key, value) in fields {
        if let Some(value) = value {
            filter.insert(key.to_string(), serde_json::Value::String(value));
        }
    }
    serde_json::Value::Object(filter).to_string()
}

/// Replies are JSON strings; pretty-print them, or echo verbatim if they do not parse.
fn print_json(reply: &str) {
    match serde_json::from_str::<serde_json::Value>(reply) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{reply}"),
        },
        Err(_) => println!("{reply}"),
    }
}

async fn connect(system: bool) -> Result<zbus::Connection> {
    let builder = if system {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    builder
        .method_timeout(Duration::from_secs(10))
        .build()
        .await
        .context("cannot connect to D-Bus; is rollcalld running?")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let conn = connect(cli.system).await?;
    let proxy = AttendanceProxy::new(&conn).await?;

    match cli.command {
        Commands::AddIdentity {
            id,
            name,
            role,
            section,
        } => {
            proxy
                .add_identity(&id, &name, &role, section.as_deref().unwrap_or(""))
                .await?;
            println!("Identity {id} saved");
        }
        Commands::Enroll { id, descriptor } => {
            let descriptor = read_single_descriptor(&descriptor)?;
            tracing::debug!(dim = descriptor.len(), "enrolling descriptor");
            proxy.enroll(&id, descriptor).await?;
            println!("Enrolled face descriptor for {id}");
        }
        Commands::Recognize { file } => {
            let reply = proxy.recognize(read_descriptors(&file)?).await?;
            print_json(&reply);
        }
        Commands::Mark { file } => {
            let reply = proxy.mark_automatic(read_descriptors(&file)?).await?;
            print_json(&reply);
        }
        Commands::RollCall { present, absent } => {
            let entries = roll_call_entries(present, absent);
            if entries.is_empty() {
                bail!("roll call needs at least one --present or --absent identity");
            }
            let reply = proxy.mark_roll_call(entries).await?;
            print_json(&reply);
        }
        Commands::History { id, from, to } => {
            let reply = proxy
                .history(&id, from.as_deref().unwrap_or(""), to.as_deref().unwrap_or(""))
                .await?;
            print_json(&reply);
        }
        Commands::Report {
            identity,
            status,
            from,
            to,
        } => {
            let reply = proxy.report(&report_filter(identity, status, from, to)).await?;
            print_json(&reply);
        }
        Commands::Stats { from, to } => {
            let reply = proxy
                .stats(from.as_deref().unwrap_or(""), to.as_deref().unwrap_or(""))
                .await?;
            print_json(&reply);
        }
        Commands::Notifications { id, mark_read } => {
            let reply = proxy.notifications(&id, mark_read).await?;
            print_json(&reply);
        }
        Commands::Status => {
            let reply = proxy.status().await?;
            print_json(&reply);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_and_batched_descriptors() {
        assert_eq!(parse_descriptors("[0.5, 1, -2]").unwrap(), vec![vec![0.5, 1.0, -2.0]]);
        assert_eq!(
            parse_descriptors("[[0.1, 0.2], [0.3, 0.4]]").unwrap(),
            vec![vec![0.1, 0.2], vec![0.3, 0.4]]
        );
        assert!(parse_descriptors("{\"values\": [1]}").is_err());
        assert!(parse_descriptors("[\"a\"]").is_err());
    }

    #[test]
    fn test_empty_file_means_no_faces() {
        assert!(parse_descriptors("[]").unwrap().is_empty());
        assert!(parse_descriptors("  [ ]\n").unwrap().is_empty());
    }

    #[test]
    fn test_roll_call_entries() {
        let entries = roll_call_entries(vec!["a".into(), "b".into()], vec!["c".into()]);
        assert_eq!(
            entries,
            vec![("a".into(), true), ("b".into(), true), ("c".into(), false)]
        );
    }

    #[test]
    fn test_report_filter_omits_unset_fields() {
        let filter = report_filter(None, Some("LATE".into()), Some("2024-09-01".into()), None);
        let value: serde_json::Value = serde_json::from_str(&filter).unwrap();
        assert_eq!(value, serde_json::json!({"status": "late", "from": "2024-09-01"}));
        assert_eq!(report_filter(None, None, None, None), "{}");
    }

    #[test]
    fn test_cli_parses_roll_call() {
        let cli = Cli::try_parse_from([
            "rollcall", "--system", "roll-call", "--present", "s1", "s2", "--absent", "s3",
        ])
        .unwrap();
        assert!(cli.system);
        match cli.command {
            Commands::RollCall { present, absent } => {
                assert_eq!(present, vec!["s1", "s2"]);
                assert_eq!(absent, vec!["s3"]);
            }
            _ => panic!("expected roll-call"),
        }
    }
}
