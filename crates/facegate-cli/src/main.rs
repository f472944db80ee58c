use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

#[derive(Parser)]
#[command(name = "facegate", about = "Face capture and simulated access control")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a face and check it against registered users
    Scan {
        /// Capture immediately instead of waiting for a face
        #[arg(long)]
        manual: bool,
        /// Smart-capture attempts before giving up
        #[arg(long, default_value_t = 3)]
        attempts: u32,
    },
    /// Register a new user
    Enroll {
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Employee ID (not required to be unique)
        #[arg(short, long)]
        employee_id: String,
        /// Use an image file instead of the camera
        #[arg(long, conflicts_with = "smart")]
        photo: Option<PathBuf>,
        /// Wait for a face and count down before capturing
        #[arg(long)]
        smart: bool,
    },
    /// List registered users
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Remove a registered user
    Remove {
        /// User ID to remove
        id: String,
    },
    /// Run camera diagnostics
    Test,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::Config::load()?;
    tracing::debug!(?cfg, "configuration loaded");

    match cli.command {
        Commands::Scan { manual, attempts } => commands::scan(&cfg, manual, attempts).await,
        Commands::Enroll {
            name,
            employee_id,
            photo,
            smart,
        } => commands::enroll(&cfg, &name, &employee_id, photo.as_deref(), smart).await,
        Commands::List { json } => commands::list(&cfg, json).await,
        Commands::Remove { id } => commands::remove(&cfg, &id).await,
        Commands::Test => commands::test(&cfg).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_enroll() {
        let cli = Cli::try_parse_from([
            "facegate", "enroll", "--name", "Ana", "--employee-id", "E1", "--smart",
        ])
        .unwrap();
        match cli.command {
            Commands::Enroll {
                name,
                employee_id,
                photo,
                smart,
            } => {
                assert_eq!(name, "Ana");
                assert_eq!(employee_id, "E1");
                assert!(photo.is_none());
                assert!(smart);
            }
            _ => panic!("expected enroll"),
        }
    }

    #[test]
    fn test_photo_conflicts_with_smart() {
        assert!(Cli::try_parse_from([
            "facegate", "enroll", "-n", "Ana", "-e", "E1", "--photo", "a.jpg", "--smart",
        ])
        .is_err());
    }

    #[test]
    fn test_scan_defaults() {
        let cli = Cli::try_parse_from(["facegate", "scan"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Scan {
                manual: false,
                attempts: 3
            }
        ));
    }
}
