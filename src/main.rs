use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use goatdb_core::config::Config;
use goatdb_core::crypto::Session;
use goatdb_core::database::Database;
use goatdb_core::error::GoatError;
use goatdb_core::sessions::SessionStore;

#[derive(Parser, Debug)]
#[command(name = "goatdb", about = "local-first, signed, multi-peer document store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser, Debug)]
enum Command {
    /// Bootstraps a fresh node: generates a root session settings file in
    /// `path`, then exits.
    Init {
        #[arg(long, default_value = "./data")]
        path: PathBuf,
        #[arg(long)]
        org_id: String,
    },
    /// Opens one repository and idles until interrupted — a smoke test
    /// for the storage and repository layers without any transport
    /// wired in (peer transports are supplied by the embedding
    /// application, not this CLI).
    Serve {
        #[arg(long, default_value = "./data")]
        path: PathBuf,
        #[arg(long)]
        org_id: String,
        #[arg(long)]
        repo: String,
    },
}

fn ensure_data_dir(path: &std::path::Path) -> Result<(), GoatError> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

fn init_tracing() {
    let default_filter = if goatdb_core::config::is_test_mode() { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string()),
        ))
        .try_init();
}

fn run() -> Result<(), GoatError> {
    init_tracing();
    let _suite = goatdb_core::config::test_suite_selector();
    let args = Cli::parse();

    match args.command {
        Command::Init { path, org_id } => {
            ensure_data_dir(&path)?;
            let root = Session::generate("root", None, i64::MAX);
            let settings = serde_json::json!({
                "currentSession": root,
                "roots": [root],
                "trustedSessions": [],
            });
            let settings_path = path.join(format!("sys-sessions-{org_id}.json"));
            std::fs::write(&settings_path, serde_json::to_vec_pretty(&settings)?)?;
            println!("wrote root session settings to {}", settings_path.display());
            Ok(())
        }
        Command::Serve { path, org_id, repo } => {
            ensure_data_dir(&path)?;
            let settings_path = path.join(format!("sys-sessions-{org_id}.json"));
            let store = if settings_path.exists() {
                Arc::new(SessionStore::bootstrap(&settings_path, org_id.clone())?)
            } else {
                tracing::warn!(path = %settings_path.display(), "no settings file found; generating an ephemeral root");
                Arc::new(SessionStore::from_root(Session::generate("root", None, i64::MAX)))
            };

            let config = Config::new(path, org_id).with_trusted(true);
            let db = Database::new(config, store.clone(), store.clone());
            db.open(&repo)?;
            tracing::info!(repo, "repository open; waiting for Ctrl-C");

            let (tx, rx) = std::sync::mpsc::channel();
            ctrlc::set_handler(move || {
                let _ = tx.send(());
            })
            .map_err(|e| GoatError::ConfigurationInvalid(e.to_string()))?;
            let _ = rx.recv();

            db.close(&repo)?;
            Ok(())
        }
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
