//! Document store contract required by the queue.
//!
//! The queue never reads-then-writes. Every mutation it performs is expressed
//! as a single [`Write`]: either an insert-if-absent keyed on the dedup key,
//! or a conditional update that atomically selects one document matching a
//! [`Filter`] and applies an [`Update`] to it. Backends must guarantee that a
//! single conditional update is indivisible; that guarantee is the only
//! consistency primitive the lease protocol relies on.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;

use crate::{error::Error, message::Message};

pub mod memory;
pub mod sqlite;

/// Document selection predicates understood by every backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Every document, live or done
    All,
    /// The document with this dedup key
    Key(String),
    /// `deleted` unset and `visible <= now`
    Claimable { now: DateTime<Utc> },
    /// `deleted` unset, `ack` set and `visible > now`
    InFlight { now: DateTime<Utc> },
    /// `deleted` set
    Done,
    /// The unexpired, unfinished lease identified by `ack`
    Lease { ack: String, now: DateTime<Utc> },
    /// Live documents whose `ack` is any of these tokens
    AckIn(Vec<String>),
}

impl Filter {
    pub fn matches(&self, message: &Message) -> bool {
        match self {
            Filter::All => true,
            Filter::Key(key) => &message.key == key,
            Filter::Claimable { now } => message.is_claimable(*now),
            Filter::InFlight { now } => message.is_in_flight(*now),
            Filter::Done => message.is_done(),
            Filter::Lease { ack, now } => {
                message.deleted.is_none()
                    && message.visible > *now
                    && message.ack.as_deref() == Some(ack.as_str())
            }
            Filter::AckIn(tokens) => {
                message.deleted.is_none()
                    && message
                        .ack
                        .as_ref()
                        .is_some_and(|ack| tokens.iter().any(|t| t == ack))
            }
        }
    }
}

/// Mutations applied to a single matched document.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// Take a new lease: `tries += 1`, replace `ack`, push `visible` forward
    Claim {
        ack: String,
        visible: DateTime<Utc>,
    },
    /// Renew the current lease
    Extend { visible: DateTime<Utc> },
    /// Mark the document done
    Finalize { deleted: DateTime<Utc> },
}

impl Update {
    pub fn apply(&self, message: &mut Message) {
        match self {
            Update::Claim { ack, visible } => {
                message.tries += 1;
                message.ack = Some(ack.clone());
                message.visible = *visible;
            }
            Update::Extend { visible } => message.visible = *visible,
            Update::Finalize { deleted } => message.deleted = Some(*deleted),
        }
    }
}

/// One entry of a bulk submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    UpdateOne { filter: Filter, update: Update },
    InsertIfAbsent(Message),
}

impl Write {
    pub fn update_one(filter: Filter, update: Update) -> Self {
        Self::UpdateOne { filter, update }
    }
}

/// Result of a single [`Write`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// A conditional update matched and was applied; carries the new image
    Modified(Message),
    /// A conditional update found nothing to match
    Unmatched,
    /// The document was inserted
    Inserted,
    /// A document with the same key already existed and was left untouched
    Existing,
}

/// Write acknowledgment for a bulk submission, one outcome per write in
/// submission order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkOutcome {
    pub outcomes: Vec<WriteOutcome>,
}

impl BulkOutcome {
    pub fn inserted_count(&self) -> usize {
        self.count(|o| matches!(o, WriteOutcome::Inserted))
    }

    pub fn existing_count(&self) -> usize {
        self.count(|o| matches!(o, WriteOutcome::Existing))
    }

    pub fn modified_count(&self) -> usize {
        self.count(|o| matches!(o, WriteOutcome::Modified(_)))
    }

    fn count(&self, pred: impl Fn(&WriteOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }
}

impl From<WriteOutcome> for BulkOutcome {
    fn from(outcome: WriteOutcome) -> Self {
        Self {
            outcomes: vec![outcome],
        }
    }
}

/// A handle to one collection of [`Message`] documents.
///
/// Handles are cheap to clone and hold no coordination state of their own;
/// any number of them, in any number of processes, may point at the same
/// underlying collection.
pub trait Collection: Clone + Send + Sync + 'static {
    /// Applies `update` to at most one document matching `filter`, chosen in
    /// the collection's natural order. Selection and mutation happen in one
    /// indivisible step. Returns the updated document, or `None` if nothing
    /// matched.
    fn update_if_match(
        &self,
        filter: Filter,
        update: Update,
    ) -> BoxFuture<'_, Result<Option<Message>, Error>>;

    /// Inserts `message` unless a document with the same key already exists.
    /// Returns whether the insert happened.
    fn insert_if_absent(&self, message: Message) -> BoxFuture<'_, Result<bool, Error>>;

    /// Snapshot read of all matching documents, in natural order.
    fn find(&self, filter: Filter) -> BoxFuture<'_, Result<Vec<Message>, Error>>;

    /// Snapshot count of matching documents.
    fn count(&self, filter: Filter) -> BoxFuture<'_, Result<u64, Error>>;

    /// Removes every matching document. Returns how many were removed.
    fn delete_many(&self, filter: Filter) -> BoxFuture<'_, Result<u64, Error>>;

    /// Applies each write independently, in submission order.
    ///
    /// A write that matches nothing, or an insert whose key already exists, is
    /// recorded in the outcome and does not stop the batch. A store error
    /// aborts the remaining writes; those already applied stay applied.
    fn bulk_apply(&self, writes: Vec<Write>) -> BoxFuture<'_, Result<BulkOutcome, Error>> {
        Box::pin(async move {
            let mut outcomes = Vec::with_capacity(writes.len());

            for write in writes {
                let outcome = match write {
                    Write::UpdateOne { filter, update } => {
                        match self.update_if_match(filter, update).await? {
                            Some(message) => WriteOutcome::Modified(message),
                            None => WriteOutcome::Unmatched,
                        }
                    }
                    Write::InsertIfAbsent(message) => {
                        if self.insert_if_absent(message).await? {
                            WriteOutcome::Inserted
                        } else {
                            WriteOutcome::Existing
                        }
                    }
                };
                outcomes.push(outcome);
            }

            Ok(BulkOutcome { outcomes })
        })
    }
}
