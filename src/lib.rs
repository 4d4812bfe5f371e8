use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod ids;
pub mod message;
pub mod queue;
pub mod store;

pub use error::Error;
pub use message::{Delay, Message, MessageState};
pub use queue::LeaseQueue;
pub use store::{memory::MemoryCollection, sqlite::SqliteStore, Collection};

/// Installs the global tracing subscriber.
///
/// Filtering is read from `LEASEQ_LOG`. Output goes to stderr so that command
/// output on stdout stays machine-readable.
pub fn init_tracing() -> eyre::Result<()> {
    let filter = EnvFilter::builder()
        .with_env_var("LEASEQ_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    Ok(())
}
