use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{Attachment, Message, MessageFilter};

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// No message with the identifier, or no attachment at the index.
    #[error("Message not found")]
    NotFound,
}

/// Default number of messages kept before the oldest is evicted.
pub const DEFAULT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(100) {
    Some(capacity) => capacity,
    None => unreachable!(),
};

/// Per-message side data, keyed by message identifier.
#[derive(Debug)]
struct Envelope {
    raw: Arc<[u8]>,
    attachments: Arc<[Attachment]>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Newest first.
    listing: VecDeque<Arc<Message>>,

    /// One entry per message in `listing`, keyed by identifier.
    envelopes: HashMap<String, Envelope>,
}

impl Inner {
    fn remove(&mut self, message_id: &str) -> bool {
        let removed = self.envelopes.remove(message_id).is_some();
        self.listing.retain(|message| message.message_id != message_id);
        removed
    }
}

/// Bounded in-memory mailbox.
///
/// Holds the captured messages in delivery order together with their raw
/// bytes and attachment payloads. A single lock covers the listing and the
/// per-identifier side data, so every mutation is applied as a whole and
/// readers always see a message together with its raw bytes and attachments.
#[derive(Debug)]
pub struct MemoryStore {
    capacity: NonZeroUsize,
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Creates an empty store keeping at most `capacity` messages.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn capacity(&self) -> NonZeroUsize {
        self.capacity
    }

    /// Inserts a message with its raw bytes and attachment payloads at the
    /// front of the listing, evicting the oldest messages until the store is
    /// back within capacity.
    ///
    /// A message whose identifier is already stored replaces the previous one.
    /// Returns the identifiers of the evicted messages, oldest last.
    pub fn insert(
        &self,
        message: Message,
        raw: impl Into<Arc<[u8]>>,
        attachments: Vec<Attachment>,
    ) -> Vec<String> {
        let message_id = message.message_id.clone();
        let envelope = Envelope {
            raw: raw.into(),
            attachments: attachments.into(),
        };

        let mut inner = self.write();
        if inner.remove(&message_id) {
            warn!(message_id = %message_id, "Replacing message with duplicate identifier");
        }
        inner.listing.push_front(Arc::new(message));
        inner.envelopes.insert(message_id, envelope);

        let mut evicted = Vec::new();
        while inner.listing.len() > self.capacity.get() {
            let Some(oldest) = inner.listing.pop_back() else {
                break;
            };
            inner.envelopes.remove(&oldest.message_id);
            debug!(message_id = %oldest.message_id, "Evicted oldest message");
            evicted.push(oldest.message_id.clone());
        }
        evicted
    }

    /// Returns the message with the given identifier.
    pub fn get(&self, message_id: &str) -> StorageResult<Arc<Message>> {
        self.read()
            .listing
            .iter()
            .find(|message| message.message_id == message_id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    /// Returns the raw bytes of the message, exactly as delivered.
    pub fn get_raw(&self, message_id: &str) -> StorageResult<Arc<[u8]>> {
        self.read()
            .envelopes
            .get(message_id)
            .map(|envelope| envelope.raw.clone())
            .ok_or(StorageError::NotFound)
    }

    /// Returns the attachment at `index` of the message, with its content.
    ///
    /// Unknown identifiers and out of range indexes are both reported as
    /// [`StorageError::NotFound`].
    pub fn get_attachment(&self, message_id: &str, index: usize) -> StorageResult<Attachment> {
        self.read()
            .envelopes
            .get(message_id)
            .and_then(|envelope| envelope.attachments.get(index))
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    /// Returns the messages matching `filter`, newest first.
    pub fn list(&self, filter: &MessageFilter) -> Vec<Arc<Message>> {
        self.read()
            .listing
            .iter()
            .filter(|message| filter.matches(message))
            .cloned()
            .collect()
    }

    /// Removes a single message, a missing identifier is not an error.
    pub fn delete(&self, message_id: &str) {
        if self.write().remove(message_id) {
            debug!(message_id = %message_id, "Deleted message");
        }
    }

    /// Removes every message, raw body and attachment.
    pub fn clear(&self) {
        let mut inner = self.write();
        inner.listing.clear();
        inner.envelopes.clear();
    }

    pub fn len(&self) -> usize {
        self.read().listing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // The guarded data is only ever replaced as a whole, so a poisoned lock
    // still holds a consistent state.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use chrono::{DateTime, Duration, Utc};

    use super::*;
    use crate::{AddressList, EmailAddress};

    fn capacity(value: usize) -> NonZeroUsize {
        NonZeroUsize::new(value).unwrap()
    }

    fn message(id: &str) -> Message {
        message_at(id, DateTime::from_timestamp(1_700_000_000, 0).unwrap())
    }

    fn message_at(id: &str, date: DateTime<Utc>) -> Message {
        Message {
            message_id: id.to_string(),
            from: AddressList::new(vec![EmailAddress::new("sender@example.com", "")]),
            to: AddressList::new(vec![EmailAddress::new("rcpt@example.com", "")]),
            cc: None,
            subject: format!("Subject {id}"),
            date,
            text: "Body".to_string(),
            html: None,
            attachments: Vec::new(),
            headers: None,
        }
    }

    fn attachment(name: &str) -> Attachment {
        Attachment::new(name.to_string(), "text/plain".to_string(), name.as_bytes())
    }

    fn ids(store: &MemoryStore) -> Vec<String> {
        store
            .list(&MessageFilter::default())
            .iter()
            .map(|m| m.message_id.clone())
            .collect()
    }

    #[test]
    fn test_memory_store_new() {
        let store = MemoryStore::default();
        assert!(store.is_empty());
        assert_eq!(store.capacity().get(), 100);
    }

    #[test]
    fn test_memory_store_insert_and_get() {
        let store = MemoryStore::default();
        store.insert(message("a@x"), b"raw a".to_vec(), vec![attachment("one")]);

        assert_eq!(store.get("a@x").unwrap().subject, "Subject a@x");
        assert_eq!(&store.get_raw("a@x").unwrap()[..], b"raw a");
        assert_eq!(&store.get_attachment("a@x", 0).unwrap().content[..], b"one");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_memory_store_newest_first() {
        let store = MemoryStore::default();
        for id in ["1", "2", "3"] {
            store.insert(message(id), id.as_bytes().to_vec(), Vec::new());
        }

        assert_eq!(ids(&store), vec!["3", "2", "1"]);
    }

    #[test]
    fn test_memory_store_evicts_oldest() {
        let store = MemoryStore::new(capacity(3));
        let mut evicted = Vec::new();
        for index in 0..5 {
            let id = index.to_string();
            let attachments = vec![attachment(&id)];
            evicted.extend(store.insert(message(&id), id.as_bytes().to_vec(), attachments));
            assert!(store.len() <= 3);
        }

        assert_eq!(evicted, vec!["0", "1"]);
        assert_eq!(ids(&store), vec!["4", "3", "2"]);
        for id in ["0", "1"] {
            assert_eq!(store.get(id), Err(StorageError::NotFound));
            assert_eq!(store.get_raw(id), Err(StorageError::NotFound));
            assert_eq!(store.get_attachment(id, 0), Err(StorageError::NotFound));
        }
        for id in ["2", "3", "4"] {
            assert!(store.get_raw(id).is_ok());
            assert!(store.get_attachment(id, 0).is_ok());
        }
    }

    #[test]
    fn test_memory_store_capacity_one() {
        let store = MemoryStore::new(capacity(1));
        store.insert(message("a"), b"a".to_vec(), Vec::new());
        let evicted = store.insert(message("b"), b"b".to_vec(), Vec::new());

        assert_eq!(evicted, vec!["a"]);
        assert_eq!(ids(&store), vec!["b"]);
    }

    #[test]
    fn test_memory_store_attachment_index_out_of_range() {
        let store = MemoryStore::default();
        store.insert(message("a"), b"a".to_vec(), vec![attachment("one")]);

        assert!(store.get_attachment("a", 0).is_ok());
        assert_eq!(store.get_attachment("a", 1), Err(StorageError::NotFound));
        assert_eq!(store.get_attachment("b", 0), Err(StorageError::NotFound));
    }

    #[test]
    fn test_memory_store_duplicate_id_replaces() {
        let store = MemoryStore::default();
        store.insert(message("dup"), b"first".to_vec(), vec![attachment("first")]);
        store.insert(message("other"), b"other".to_vec(), Vec::new());
        store.insert(message("dup"), b"second".to_vec(), Vec::new());

        assert_eq!(ids(&store), vec!["dup", "other"]);
        assert_eq!(&store.get_raw("dup").unwrap()[..], b"second");
        assert_eq!(store.get_attachment("dup", 0), Err(StorageError::NotFound));
    }

    #[test]
    fn test_memory_store_delete() {
        let store = MemoryStore::default();
        store.insert(message("a"), b"a".to_vec(), vec![attachment("one")]);
        store.insert(message("b"), b"b".to_vec(), Vec::new());

        store.delete("a");

        assert_eq!(ids(&store), vec!["b"]);
        assert_eq!(store.get("a"), Err(StorageError::NotFound));
        assert_eq!(store.get_raw("a"), Err(StorageError::NotFound));
        assert_eq!(store.get_attachment("a", 0), Err(StorageError::NotFound));
    }

    #[test]
    fn test_memory_store_delete_nonexistent() {
        let store = MemoryStore::default();
        store.insert(message("a"), b"a".to_vec(), Vec::new());

        store.delete("missing");

        assert_eq!(ids(&store), vec!["a"]);
    }

    #[test]
    fn test_memory_store_clear() {
        let store = MemoryStore::default();
        store.insert(message("a"), b"a".to_vec(), vec![attachment("one")]);
        store.insert(message("b"), b"b".to_vec(), Vec::new());

        store.clear();

        assert!(store.list(&MessageFilter::default()).is_empty());
        assert_eq!(store.get("a"), Err(StorageError::NotFound));
        assert_eq!(store.get_raw("b"), Err(StorageError::NotFound));
        assert_eq!(store.get_attachment("a", 0), Err(StorageError::NotFound));
    }

    #[test]
    fn test_memory_store_list_filter_keeps_order() {
        let store = MemoryStore::default();
        let base = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        for offset in 0..4 {
            let id = offset.to_string();
            store.insert(
                message_at(&id, base + Duration::hours(offset)),
                id.as_bytes().to_vec(),
                Vec::new(),
            );
        }

        let filter = MessageFilter {
            since: Some(base + Duration::hours(1)),
            until: Some(base + Duration::hours(3)),
            ..Default::default()
        };
        let listed = store
            .list(&filter)
            .iter()
            .map(|m| m.message_id.clone())
            .collect::<Vec<_>>();

        assert_eq!(listed, vec!["2", "1"]);
    }

    #[test]
    fn test_memory_store_concurrent_inserts() {
        let store = Arc::new(MemoryStore::new(capacity(10)));
        let handles = (0..8)
            .map(|worker| {
                let store = store.clone();
                thread::spawn(move || {
                    for index in 0..50 {
                        let id = format!("{worker}-{index}");
                        store.insert(message(&id), id.as_bytes().to_vec(), vec![attachment(&id)]);
                        assert!(store.len() <= 10);
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        let listed = store.list(&MessageFilter::default());
        assert_eq!(listed.len(), 10);
        for message in listed {
            assert!(store.get_raw(&message.message_id).is_ok());
            assert!(store.get_attachment(&message.message_id, 0).is_ok());
        }
    }
}
