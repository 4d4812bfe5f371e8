//! The lease-based delivery protocol.
//!
//! [`LeaseQueue`] is a stateless façade over a [`Collection`]. Every state
//! transition is a single atomic conditional update issued to the store:
//!
//! - `add`: insert-if-absent keyed on the dedup key
//! - `get`: `Claimable` -> `Claim` (new token, `tries += 1`, `visible` pushed out)
//! - `ping`: `Lease` -> `Extend`
//! - `ack`: `Lease` -> `Finalize`
//!
//! A claim moves `visible` past "now" in the same step that selects the
//! document, so no later conditional update (from this call or any other)
//! can see it as claimable until the lease expires.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;

use crate::{
    clock::{Clock, SystemClock},
    error::Error,
    ids::{IdGenerator, RandomTokens},
    message::{Delay, Message},
    store::{BulkOutcome, Collection, Filter, Update, Write, WriteOutcome},
};

#[derive(Clone)]
pub struct LeaseQueue<C: Collection> {
    collection: C,
    visibility: TimeDelta,
    delay: Delay,
    max_retries: Option<u64>,
    dead_letter: Option<C>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

#[bon::bon]
impl<C: Collection> LeaseQueue<C> {
    /// Builds a queue over `collection`.
    ///
    /// `visibility` is the lease length handed out by `get` and `ping`.
    /// `delay` decides when added messages first become claimable.
    ///
    /// With `max_retries` set, a message is delivered at most
    /// `max_retries + 1` times; the claim that would exceed that moves it to
    /// `dead_letter` (or drops it, if no dead-letter collection is given).
    #[builder]
    pub fn new(
        collection: C,
        visibility: TimeDelta,
        #[builder(default)] delay: Delay,
        max_retries: Option<u64>,
        dead_letter: Option<C>,
        #[builder(default = Arc::new(RandomTokens) as Arc<dyn IdGenerator>)] ids: Arc<dyn IdGenerator>,
        #[builder(default = Arc::new(SystemClock) as Arc<dyn Clock>)] clock: Arc<dyn Clock>,
    ) -> Result<Self, Error> {
        if visibility <= TimeDelta::zero() {
            return Err(Error::invalid_argument("visibility must be positive"));
        }

        Ok(Self {
            collection,
            visibility,
            delay,
            max_retries,
            dead_letter,
            ids,
            clock,
        })
    }
}

impl<C: Collection> LeaseQueue<C> {
    pub fn collection(&self) -> &C {
        &self.collection
    }

    pub fn visibility(&self) -> TimeDelta {
        self.visibility
    }

    /// Enqueues `payloads`, skipping any whose dedup key is already present.
    ///
    /// The key is the payload's own `key` field when it holds a non-empty
    /// string or a number; otherwise a fresh token is generated. A single
    /// payload is one store write; several are one bulk submission whose
    /// items apply independently, in order, so the first payload for a
    /// repeated key wins.
    #[tracing::instrument(skip_all, fields(count))]
    pub async fn add<I>(&self, payloads: I) -> Result<BulkOutcome, Error>
    where
        I: IntoIterator<Item = Value>,
    {
        let visible = self.delay.visible_from(self.clock.now())?;

        let mut messages: Vec<Message> = payloads
            .into_iter()
            .map(|payload| Message::new(self.dedup_key(&payload), payload, visible))
            .collect();

        tracing::Span::current().record("count", messages.len());

        let outcome: BulkOutcome = match messages.len() {
            0 => return Err(Error::invalid_argument("add requires at least one payload")),
            1 => {
                let message = messages.remove(0);
                match self.collection.insert_if_absent(message).await? {
                    true => WriteOutcome::Inserted.into(),
                    false => WriteOutcome::Existing.into(),
                }
            }
            _ => {
                let writes = messages.into_iter().map(Write::InsertIfAbsent).collect();
                self.collection.bulk_apply(writes).await?
            }
        };

        tracing::debug!(
            inserted = outcome.inserted_count(),
            existing = outcome.existing_count(),
            "Added messages"
        );

        Ok(outcome)
    }

    pub async fn add_one(&self, payload: Value) -> Result<BulkOutcome, Error> {
        self.add([payload]).await
    }

    /// Claims up to `quantity` claimable messages.
    ///
    /// Each returned message carries a fresh lease token in `ack`, valid until
    /// its `visible` instant. Fewer than `quantity` messages come back when
    /// fewer are claimable.
    #[tracing::instrument(skip(self))]
    pub async fn get(&self, quantity: usize) -> Result<Vec<Message>, Error> {
        if quantity == 0 {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let visible = self.lease_until(now)?;

        let tokens: Vec<String> = (0..quantity).map(|_| self.ids.generate()).collect();

        let writes = tokens
            .iter()
            .map(|ack| {
                Write::update_one(
                    Filter::Claimable { now },
                    Update::Claim {
                        ack: ack.clone(),
                        visible,
                    },
                )
            })
            .collect();

        self.collection.bulk_apply(writes).await?;

        // Tokens are unique to this call, so this is exactly what it claimed.
        let claimed = self.collection.find(Filter::AckIn(tokens)).await?;

        let Some(max_retries) = self.max_retries else {
            tracing::debug!(claimed = claimed.len(), "Claimed messages");
            return Ok(claimed);
        };

        let (live, exhausted): (Vec<_>, Vec<_>) = claimed
            .into_iter()
            .partition(|msg| msg.tries <= max_retries.saturating_add(1));

        for message in exhausted {
            self.retire(message, now).await?;
        }

        tracing::debug!(claimed = live.len(), "Claimed messages");

        Ok(live)
    }

    /// Finalizes the message held under `token`.
    ///
    /// Fails with [`Error::NotFound`] if the lease has expired, was already
    /// acknowledged, or never existed; the message is left untouched.
    #[tracing::instrument(skip(self))]
    pub async fn ack(&self, token: &str) -> Result<Message, Error> {
        let now = self.clock.now();

        self.collection
            .update_if_match(
                Filter::Lease {
                    ack: token.to_owned(),
                    now,
                },
                Update::Finalize { deleted: now },
            )
            .await?
            .ok_or_else(|| {
                tracing::debug!("Ack on lost lease");
                Error::lease_not_found(token)
            })
    }

    /// Extends the lease held under `token` by a full visibility timeout,
    /// measured from now.
    ///
    /// Fails with [`Error::NotFound`] once ownership has been lost.
    #[tracing::instrument(skip(self))]
    pub async fn ping(&self, token: &str) -> Result<Message, Error> {
        let now = self.clock.now();

        self.collection
            .update_if_match(
                Filter::Lease {
                    ack: token.to_owned(),
                    now,
                },
                Update::Extend {
                    visible: self.lease_until(now)?,
                },
            )
            .await?
            .ok_or_else(|| {
                tracing::debug!("Ping on lost lease");
                Error::lease_not_found(token)
            })
    }

    /// Count of all documents, live and done.
    pub async fn total(&self) -> Result<u64, Error> {
        self.collection.count(Filter::All).await
    }

    /// Count of currently claimable documents.
    pub async fn size(&self) -> Result<u64, Error> {
        self.collection
            .count(Filter::Claimable {
                now: self.clock.now(),
            })
            .await
    }

    pub async fn in_flight(&self) -> Result<u64, Error> {
        self.collection
            .count(Filter::InFlight {
                now: self.clock.now(),
            })
            .await
    }

    pub async fn done(&self) -> Result<u64, Error> {
        self.collection.count(Filter::Done).await
    }

    /// Removes finalized documents. Returns how many were removed.
    #[tracing::instrument(skip(self))]
    pub async fn clean(&self) -> Result<u64, Error> {
        let removed = self.collection.delete_many(Filter::Done).await?;
        tracing::debug!(removed, "Cleaned done messages");
        Ok(removed)
    }

    fn lease_until(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, Error> {
        now.checked_add_signed(self.visibility).ok_or_else(|| {
            Error::invalid_argument(format!("visibility out of range: {}", self.visibility))
        })
    }

    fn dedup_key(&self, payload: &Value) -> String {
        match payload.get("key") {
            Some(Value::String(key)) if !key.is_empty() => key.clone(),
            Some(Value::Number(key)) => key.to_string(),
            _ => self.ids.generate(),
        }
    }

    /// Moves a message that exhausted its retries out of the queue.
    ///
    /// The copy into the dead-letter collection happens before the source is
    /// finalized, so a failure in between leaves the message deliverable
    /// rather than lost. If the dead-letter collection already holds the key,
    /// the source is left in flight under the claim's lease instead of being
    /// finalized.
    async fn retire(&self, message: Message, now: DateTime<Utc>) -> Result<(), Error> {
        let Some(ack) = message.ack.clone() else {
            tracing::debug!(key = %message.key, "Skipping retire of unleased message");
            return Ok(());
        };

        match &self.dead_letter {
            Some(dead_letter) => {
                let letter = Message {
                    tries: message.tries,
                    ..Message::new(message.key.clone(), message.payload.clone(), now)
                };

                if !dead_letter.insert_if_absent(letter).await? {
                    tracing::warn!(
                        key = %message.key,
                        tries = message.tries,
                        "Dead letter already holds key, keeping message"
                    );
                    return Ok(());
                }

                tracing::debug!(key = %message.key, tries = message.tries, "Moved to dead letter");
            }
            None => {
                tracing::warn!(
                    key = %message.key,
                    tries = message.tries,
                    "Dropping message after exhausting retries"
                );
            }
        }

        self.collection
            .update_if_match(Filter::Lease { ack, now }, Update::Finalize { deleted: now })
            .await?;

        Ok(())
    }
}
