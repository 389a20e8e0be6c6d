#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Forbid unwrap() in production code to prevent panics from corrupt data.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
use std::sync::Arc;

use contrail::config::StorageConfig;
use contrail::storage::{FileStorage, StorageError, StorageSystem};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Administrative commands, selected by the first argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// List the revisions new sessions can see.
    Revisions,
    /// Run one cleanup sweep.
    Cleanup,
    /// Report committed revisions with missing metadata.
    Check,
}

impl Command {
    fn parse(arg: Option<&str>) -> Option<Self> {
        match arg {
            None | Some("revisions") => Some(Self::Revisions),
            Some("cleanup") => Some(Self::Cleanup),
            Some("check") => Some(Self::Check),
            Some(_) => None,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "contrail=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let arg = std::env::args().nth(1);
    let Some(command) = Command::parse(arg.as_deref()) else {
        eprintln!("usage: contrail [revisions|cleanup|check]");
        std::process::exit(2);
    };

    // Load configuration from environment variables
    let config = match StorageConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(
        "Loaded configuration: data_directory={}, root_path={}",
        config.data_directory.display(),
        config.root_path
    );

    let raw = match FileStorage::open(&config.data_directory) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::error!("Failed to open data directory: {e}");
            std::process::exit(1);
        }
    };
    let system = match StorageSystem::open(Arc::new(raw), config) {
        Ok(system) => system,
        Err(e) => {
            tracing::error!("Failed to open storage: {e}");
            std::process::exit(1);
        }
    };

    // Storage calls block on file I/O.
    #[allow(clippy::disallowed_methods)] // Arc::clone is safe and expected
    let worker = Arc::clone(&system);
    let result = tokio::task::spawn_blocking(move || run(&worker, command)).await;

    let code = match result {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            tracing::error!("{command:?} failed: {e}");
            1
        }
        Err(e) => {
            tracing::error!("{command:?} panicked: {e}");
            1
        }
    };
    if let Err(e) = system.close() {
        tracing::error!("Failed to close storage: {e}");
        std::process::exit(1);
    }
    std::process::exit(code);
}

fn run(system: &StorageSystem, command: Command) -> Result<(), StorageError> {
    match command {
        Command::Revisions => print_revisions(system),
        Command::Cleanup => {
            let removed = system.cleanup()?;
            println!("removed {removed} revision(s)");
            print_revisions(system)
        }
        Command::Check => {
            let damaged = system.check()?;
            if damaged.is_empty() {
                println!("ok");
                return Ok(());
            }
            for revision in &damaged {
                println!("revision {revision}: committed without a journal");
            }
            Err(StorageError::corruption(format!(
                "{} committed revision(s) without a journal",
                damaged.len()
            )))
        }
    }
}

fn print_revisions(system: &StorageSystem) -> Result<(), StorageError> {
    for info in system.available_revisions()? {
        let status = match info.final_commit_number {
            Some(commit) => format!("committed #{commit}"),
            None => "uncommitted".to_string(),
        };
        println!(
            "{:>8}  {status:<16}  sessions={}",
            info.revision_number, info.sessions
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(Command::parse(None), Some(Command::Revisions));
        assert_eq!(Command::parse(Some("cleanup")), Some(Command::Cleanup));
        assert_eq!(Command::parse(Some("check")), Some(Command::Check));
        assert_eq!(Command::parse(Some("serve")), None);
    }
}
