//! Typed adapter over an ordered byte-key store. Backends implement the
//! trait triple; callers treat batches as single-writer units that commit
//! atomically on `write`.

pub mod util;

/// A pending set of writes and deletes, committed atomically.
pub trait Batch: Send {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), anyhow::Error>;
    fn delete(&mut self, key: &[u8]) -> Result<(), anyhow::Error>;
    fn write(self: Box<Self>) -> Result<(), anyhow::Error>;
}

/// Ordered iteration over the keys sharing a prefix, starting at a given
/// suffix.
pub trait Iterator {
    fn next(&mut self) -> bool;
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
    fn release(self: Box<Self>);
    fn error(&self) -> Option<anyhow::Error>;
}

pub trait Database: Send + Sync {
    fn has(&self, key: &[u8]) -> Result<bool, anyhow::Error>;
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, anyhow::Error>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), anyhow::Error>;
    fn new_batch(&self) -> Box<dyn Batch>;
    fn new_iterator(&self, prefix: &[u8], start: &[u8]) -> Box<dyn Iterator>;
}

/// Returned by `Database::get` when the key has no entry. Many callers
/// treat this as "no entry yet" rather than a failure.
#[derive(Debug, thiserror::Error)]
#[error("not found")]
pub struct NotFound;

pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<NotFound>().is_some()
}
