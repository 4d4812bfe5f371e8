use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;

use crate::{error::Error, message::Delay};

/// Process configuration, read from `LEASEQ_*` environment variables.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,
    /// Collection the queue operates on
    pub collection: Option<String>,
    /// Visibility timeout in seconds
    pub visibility: Option<u64>,
    /// Delay in seconds applied to newly added messages
    pub delay: Option<u64>,
    /// Absolute visibility instant for new messages; overrides `delay`
    pub delay_until: Option<DateTime<Utc>>,
    pub max_retries: Option<u64>,
    /// Collection receiving messages that exhausted their retries
    pub dead_letter: Option<String>,
}

/// Validated queue settings derived from a [`Config`].
#[derive(Clone, Debug, PartialEq)]
pub struct QueueOptions {
    pub visibility: TimeDelta,
    pub delay: Delay,
    pub max_retries: Option<u64>,
}

impl Config {
    pub const DEFAULT_VISIBILITY_SECS: u64 = 30;
    /// Upper bound for `visibility` and `delay`, one hundred years
    pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("LEASEQ_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        self.db_path.as_deref().unwrap_or("leaseq.db")
    }

    pub fn collection(&self) -> &str {
        self.collection.as_deref().unwrap_or("queue")
    }

    pub fn dead_letter(&self) -> Option<&str> {
        self.dead_letter.as_deref()
    }

    pub fn queue_options(&self) -> Result<QueueOptions, Error> {
        let visibility = self.visibility.unwrap_or(Self::DEFAULT_VISIBILITY_SECS);
        if visibility == 0 {
            return Err(Error::invalid_argument("visibility must be at least one second"));
        }

        if self.dead_letter() == Some(self.collection()) {
            return Err(Error::invalid_argument(
                "dead_letter must name a different collection",
            ));
        }

        let delay = match (self.delay_until, self.delay) {
            (Some(at), _) => Delay::Until(at),
            (None, Some(secs)) => Delay::After(seconds(secs, "delay")?),
            (None, None) => Delay::none(),
        };

        Ok(QueueOptions {
            visibility: seconds(visibility, "visibility")?,
            delay,
            max_retries: self.max_retries,
        })
    }
}

fn seconds(secs: u64, what: &str) -> Result<TimeDelta, Error> {
    Some(secs)
        .filter(|secs| *secs <= Config::MAX_DURATION_SECS)
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(TimeDelta::try_seconds)
        .ok_or_else(|| Error::invalid_argument(format!("{what} out of range: {secs}")))
}
