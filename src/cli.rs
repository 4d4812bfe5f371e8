//! Command-line front end over a SQLite-backed queue.

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use crate::{
    config::Config,
    queue::LeaseQueue,
    store::sqlite::{SqliteCollection, SqliteStore},
};

#[derive(Debug, Parser)]
#[command(name = "leaseq", version, about = "Lease-based work queue")]
pub struct Cli {
    /// Collection to operate on (overrides LEASEQ_COLLECTION)
    #[arg(long, global = true)]
    pub collection: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Enqueue one or more JSON payloads
    Add {
        #[arg(required = true)]
        payloads: Vec<String>,
    },
    /// Claim up to N messages
    Get {
        #[arg(short = 'n', long, default_value_t = 1)]
        quantity: usize,
    },
    /// Finalize a claimed message
    Ack { token: String },
    /// Extend a lease
    Ping { token: String },
    /// Print occupancy counters
    Stats,
    /// Remove finalized messages
    Clean,
}

#[derive(Debug, Serialize)]
pub struct Stats {
    pub total: u64,
    pub size: u64,
    pub in_flight: u64,
    pub done: u64,
}

#[derive(Debug, Serialize)]
struct AddReport {
    inserted: usize,
    existing: usize,
}

/// Opens the queue described by `config` and runs one command against it.
pub async fn run(cli: Cli, mut config: Config) -> eyre::Result<()> {
    if let Some(collection) = cli.collection {
        config.collection = Some(collection);
    }

    let store = SqliteStore::connect_with(&config).await?;
    let queue = open_queue(&store, &config)?;

    let output = match cli.command {
        Command::Add { payloads } => {
            let payloads = payloads
                .iter()
                .map(|raw| serde_json::from_str::<Value>(raw))
                .collect::<Result<Vec<_>, _>>()?;
            let outcome = queue.add(payloads).await?;
            serde_json::to_value(AddReport {
                inserted: outcome.inserted_count(),
                existing: outcome.existing_count(),
            })?
        }
        Command::Get { quantity } => serde_json::to_value(queue.get(quantity).await?)?,
        Command::Ack { token } => serde_json::to_value(queue.ack(&token).await?)?,
        Command::Ping { token } => serde_json::to_value(queue.ping(&token).await?)?,
        Command::Stats => serde_json::to_value(stats(&queue).await?)?,
        Command::Clean => serde_json::json!({ "removed": queue.clean().await? }),
    };

    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

pub fn open_queue(
    store: &SqliteStore,
    config: &Config,
) -> eyre::Result<LeaseQueue<SqliteCollection>> {
    let opts = config.queue_options()?;

    let queue = LeaseQueue::builder()
        .collection(store.collection(config.collection()))
        .visibility(opts.visibility)
        .delay(opts.delay)
        .maybe_max_retries(opts.max_retries)
        .maybe_dead_letter(config.dead_letter().map(|name| store.collection(name)))
        .build()?;

    Ok(queue)
}

pub async fn stats(queue: &LeaseQueue<SqliteCollection>) -> Result<Stats, crate::Error> {
    Ok(Stats {
        total: queue.total().await?,
        size: queue.size().await?,
        in_flight: queue.in_flight().await?,
        done: queue.done().await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands() {
        let cli = Cli::parse_from(["leaseq", "--collection", "jobs", "get", "-n", "3"]);
        assert_eq!(cli.collection.as_deref(), Some("jobs"));
        assert!(matches!(cli.command, Command::Get { quantity: 3 }));

        let cli = Cli::parse_from(["leaseq", "add", r#"{"key":"a"}"#, r#"{"key":"b"}"#]);
        match cli.command {
            Command::Add { payloads } => assert_eq!(payloads.len(), 2),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn add_requires_a_payload() {
        assert!(Cli::try_parse_from(["leaseq", "add"]).is_err());
    }

    #[tokio::test]
    async fn open_queue_rejects_self_dead_letter() {
        let store = SqliteStore::connect_in_memory().await.unwrap();
        let config = Config {
            collection: Some("jobs".to_owned()),
            dead_letter: Some("jobs".to_owned()),
            ..Default::default()
        };

        assert!(open_queue(&store, &config).is_err());
    }

    #[tokio::test]
    async fn stats_over_in_memory_store() {
        let store = SqliteStore::connect_in_memory().await.unwrap();
        let queue = open_queue(&store, &Config::default()).unwrap();

        queue
            .add(vec![serde_json::json!({"key": 1}), serde_json::json!({"key": 2})])
            .await
            .unwrap();
        queue.get(1).await.unwrap();

        let stats = stats(&queue).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.size, 1);
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.done, 0);
    }
}
