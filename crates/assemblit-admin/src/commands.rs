use std::sync::Arc;

use anyhow::{Context, Result};
use assemblit_db::{
    integrity, Catalog, StoreConfig, StoreRegistry, Value, DATASETS_LEVEL, SESSIONS_LEVEL,
    USERS_LEVEL,
};
use assemblit_vault::{CredentialStore, DnsProbe};
use clap::{Parser, Subcommand};
use serde_json::{json, Value as JsonValue};
use tracing::info;

/// Maintenance commands for the assemblit stores.
#[derive(Debug, Parser)]
#[command(name = "assemblit-admin", version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Verify the ownership hierarchy
    Check,

    /// List the tables of a database
    Tables {
        /// Database name, with or without extension
        db: String,
    },

    /// List the sessions of a user
    Sessions { user_id: String },

    /// Delete a user and everything it owns
    DeleteAccount {
        user_id: String,

        /// Print the deletion plan without deleting anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete a session and its datasets
    DeleteSession {
        session_id: String,

        /// Print the deletion plan without deleting anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete one dataset and its rows
    DeleteDataset {
        dataset_id: String,

        /// Print the deletion plan without deleting anything
        #[arg(long)]
        dry_run: bool,
    },
}

/// Runs `command` against the stores described by `config`.
pub async fn run(command: Command, config: StoreConfig) -> Result<JsonValue> {
    let registry = StoreRegistry::new(config);
    let output = execute(command, &registry).await;
    registry.close_all().await;
    output
}

async fn execute(command: Command, registry: &StoreRegistry) -> Result<JsonValue> {
    let output = match command {
        Command::Check => {
            let catalog = open_catalog(registry).await?;
            let violations = integrity::check(catalog.hierarchy())
                .await
                .context("integrity check failed")?;
            json!({ "consistent": violations.is_empty(), "violations": violations })
        }
        Command::Tables { db } => {
            let handler = registry
                .handler(&db)
                .await
                .with_context(|| format!("failed to open database {db}"))?;
            json!({ "database": handler.name(), "tables": handler.table_names().await? })
        }
        Command::Sessions { user_id } => {
            let catalog = open_catalog(registry).await?;
            json!({ "user_id": user_id, "sessions": catalog.list_sessions(&user_id).await? })
        }
        Command::DeleteAccount { user_id, dry_run } => {
            if dry_run {
                plan(registry, USERS_LEVEL, &user_id).await?
            } else {
                let store = CredentialStore::open(registry, Arc::new(DnsProbe::default()))
                    .await
                    .context("failed to open credential store")?;
                serde_json::to_value(store.delete_account(&user_id).await?)?
            }
        }
        Command::DeleteSession {
            session_id,
            dry_run,
        } => {
            if dry_run {
                plan(registry, SESSIONS_LEVEL, &session_id).await?
            } else {
                let catalog = open_catalog(registry).await?;
                serde_json::to_value(catalog.delete_session(&session_id).await?)?
            }
        }
        Command::DeleteDataset {
            dataset_id,
            dry_run,
        } => {
            if dry_run {
                plan(registry, DATASETS_LEVEL, &dataset_id).await?
            } else {
                let catalog = open_catalog(registry).await?;
                serde_json::to_value(catalog.delete_dataset(&dataset_id).await?)?
            }
        }
    };
    Ok(output)
}

async fn open_catalog(registry: &StoreRegistry) -> Result<Catalog> {
    Catalog::open(registry)
        .await
        .context("failed to open catalog stores")
}

async fn plan(registry: &StoreRegistry, level: usize, key: &str) -> Result<JsonValue> {
    let catalog = open_catalog(registry).await?;
    let plan = catalog
        .hierarchy()
        .plan_level(level, &[Value::from(key)])
        .await
        .with_context(|| format!("failed to plan deletion of {key}"))?;
    info!(key, steps = plan.steps.len(), "dry run; nothing deleted");
    Ok(serde_json::to_value(plan)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Command, clap::Error> {
        Cli::try_parse_from(std::iter::once("assemblit-admin").chain(args.iter().copied()))
            .map(|cli| cli.command)
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_commands_and_flags() {
        assert_eq!(parse(&["check"]).unwrap(), Command::Check);
        assert_eq!(
            parse(&["tables", "users"]).unwrap(),
            Command::Tables { db: "users".into() }
        );
        assert_eq!(
            parse(&["delete-session", "--dry-run", "s1"]).unwrap(),
            Command::DeleteSession {
                session_id: "s1".into(),
                dry_run: true
            }
        );
        assert_eq!(
            parse(&["delete-account", "u1"]).unwrap(),
            Command::DeleteAccount {
                user_id: "u1".into(),
                dry_run: false
            }
        );
        assert!(parse(&[]).is_err());
        assert!(parse(&["delete-account"]).is_err());
        assert!(parse(&["delete-account", "u1", "--force"]).is_err());
        assert!(parse(&["frobnicate"]).is_err());
    }

    #[tokio::test]
    async fn dry_run_leaves_data_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::with_root(dir.path());

        let registry = StoreRegistry::new(config.clone());
        let catalog = Catalog::open(&registry).await.unwrap();
        let session = catalog.create_session("u1", "Trial").await.unwrap();
        registry.close_all().await;

        let planned = run(
            Command::DeleteAccount {
                user_id: "u1".into(),
                dry_run: true,
            },
            config.clone(),
        )
        .await
        .unwrap();
        assert_eq!(planned["steps"][1]["keys"][0], json!(session));

        let listed = run(
            Command::Sessions {
                user_id: "u1".into(),
            },
            config.clone(),
        )
        .await
        .unwrap();
        assert_eq!(listed["sessions"], json!([session]));

        let checked = run(Command::Check, config).await.unwrap();
        assert_eq!(checked["consistent"], json!(true));
    }
}
