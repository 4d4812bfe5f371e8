//! In-memory implementation of the document store.
//!
//! Documents live in a lock-free concurrent hash map keyed by dedup key.
//! Primarily used for testing and for single-process deployments.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use futures_util::future::BoxFuture;
use papaya::{Compute, Operation};

use crate::{error::Error, message::Message};

use super::{Collection, Filter, Update};

#[derive(Debug, Clone)]
struct Document {
    /// Insertion order; defines the collection's natural order
    seq: u64,
    message: Message,
}

/// Thread-safe in-memory collection.
///
/// Clones share the same documents.
#[derive(Clone, Default)]
pub struct MemoryCollection {
    docs: Arc<papaya::HashMap<String, Document>>,
    next_seq: Arc<AtomicU64>,
}

impl MemoryCollection {
    /// Creates a new empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys of matching documents, in natural order.
    fn scan(&self, filter: &Filter) -> Vec<String> {
        let docs = self.docs.pin();
        let mut hits: Vec<(u64, String)> = docs
            .iter()
            .filter(|(_, doc)| filter.matches(&doc.message))
            .map(|(key, doc)| (doc.seq, key.clone()))
            .collect();
        hits.sort_unstable_by_key(|(seq, _)| *seq);
        hits.into_iter().map(|(_, key)| key).collect()
    }

    fn update_first(&self, filter: &Filter, update: &Update) -> Option<Message> {
        let docs = self.docs.pin();

        // The scan is only a candidate list. `compute` re-checks the filter
        // against the current value and commits atomically, so a document
        // taken by a concurrent update in between is skipped.
        for key in self.scan(filter) {
            let result = docs.compute(key, |entry| match entry {
                Some((_, doc)) if filter.matches(&doc.message) => {
                    let mut next = doc.clone();
                    update.apply(&mut next.message);
                    Operation::Insert(next)
                }
                _ => Operation::Abort(()),
            });

            if let Compute::Updated { new: (_, doc), .. } = result {
                return Some(doc.message.clone());
            }
        }

        None
    }

    fn remove_matching(&self, filter: &Filter) -> u64 {
        let docs = self.docs.pin();
        let mut removed = 0;

        for key in self.scan(filter) {
            let result = docs.compute(key, |entry| match entry {
                Some((_, doc)) if filter.matches(&doc.message) => Operation::Remove,
                _ => Operation::Abort(()),
            });

            if let Compute::Removed(..) = result {
                removed += 1;
            }
        }

        removed
    }
}

impl Collection for MemoryCollection {
    fn update_if_match(
        &self,
        filter: Filter,
        update: Update,
    ) -> BoxFuture<'_, Result<Option<Message>, Error>> {
        Box::pin(async move { Ok(self.update_first(&filter, &update)) })
    }

    fn insert_if_absent(&self, message: Message) -> BoxFuture<'_, Result<bool, Error>> {
        Box::pin(async move {
            let doc = Document {
                seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
                message,
            };
            let docs = self.docs.pin();
            Ok(docs.try_insert(doc.message.key.clone(), doc).is_ok())
        })
    }

    fn find(&self, filter: Filter) -> BoxFuture<'_, Result<Vec<Message>, Error>> {
        Box::pin(async move {
            let docs = self.docs.pin();
            Ok(self
                .scan(&filter)
                .iter()
                .filter_map(|key| docs.get(key))
                .map(|doc| doc.message.clone())
                .collect())
        })
    }

    fn count(&self, filter: Filter) -> BoxFuture<'_, Result<u64, Error>> {
        Box::pin(async move {
            let docs = self.docs.pin();
            Ok(docs
                .iter()
                .filter(|(_, doc)| filter.matches(&doc.message))
                .count() as u64)
        })
    }

    fn delete_many(&self, filter: Filter) -> BoxFuture<'_, Result<u64, Error>> {
        Box::pin(async move { Ok(self.remove_matching(&filter)) })
    }
}
