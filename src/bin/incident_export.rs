//! incident_export - write recorded incidents out as JPEG files

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};

use tripwire_inspector::{Incident, IncidentStore, SqliteIncidentStore};

const PAGE_SIZE: usize = 100;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the incident database.
    #[arg(long, env = "TRIPWIRE_DB_PATH", default_value = "tripwire.db")]
    db_path: String,
    /// Only export incidents with an id greater than this.
    #[arg(long, default_value_t = 0)]
    after: i64,
    /// Directory for the exported images. Without it, incidents are only listed.
    #[arg(long)]
    out_dir: Option<PathBuf>,
    /// Stop after this many incidents.
    #[arg(long)]
    limit: Option<usize>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut store = SqliteIncidentStore::open(&args.db_path)?;
    if let Some(dir) = &args.out_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create output directory {}", dir.display()))?;
    }

    let mut cursor = args.after;
    let mut exported = 0usize;
    'pages: loop {
        let page = store.incidents_after(cursor, PAGE_SIZE)?;
        if page.is_empty() {
            break;
        }
        for incident in page {
            if args.limit.is_some_and(|limit| exported >= limit) {
                break 'pages;
            }
            cursor = incident.id;
            println!(
                "incident {:>6}  capture {:>6}  {} {}  [{}]",
                incident.id,
                incident.capture_id,
                incident.date,
                incident.time,
                incident.labels.join(", ")
            );
            if let Some(dir) = &args.out_dir {
                let path = write_incident(dir, &incident)?;
                log::debug!("wrote {}", path.display());
            }
            exported += 1;
        }
    }

    let summary = store.inspection_summary()?;
    let parts: Vec<String> = summary
        .iter()
        .map(|(status, count)| format!("{}={}", status.as_str(), count))
        .collect();
    println!(
        "{} incidents after id {}; inspections: {}",
        exported,
        args.after,
        if parts.is_empty() {
            "none".to_string()
        } else {
            parts.join(" ")
        }
    );
    Ok(())
}

fn incident_file_name(incident: &Incident) -> String {
    format!(
        "incident_{}_{}_{}.jpg",
        incident.id,
        incident.date,
        incident.time.replace(':', "-")
    )
}

fn write_incident(dir: &Path, incident: &Incident) -> Result<PathBuf> {
    let path = dir.join(incident_file_name(incident));
    std::fs::write(&path, &incident.image)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}
