use rollup_db::{Batch, Database, Iterator, NotFound};

/// Sled-backed implementation of the ordered key-value store.
pub struct SledDb {
    inner: sled::Db,
}

impl SledDb {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        Ok(Self { inner: sled::open(path)? })
    }
}

/// Writes stage directly into a [`sled::Batch`], which sled applies
/// atomically on commit.
struct SledBatch {
    tree: sled::Db,
    pending: sled::Batch,
}

impl Batch for SledBatch {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), anyhow::Error> {
        self.pending.insert(key, value);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), anyhow::Error> {
        self.pending.remove(key);
        Ok(())
    }

    fn write(self: Box<Self>) -> Result<(), anyhow::Error> {
        self.tree.apply_batch(self.pending)?;
        self.tree.flush()?;
        Ok(())
    }
}

/// Smallest key lexically above every key sharing `prefix`, if any key at
/// all can follow the prefix range.
fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < u8::MAX {
            *last += 1;
            return Some(end);
        }
        end.pop();
    }
    None
}

/// Range iteration bounded to the prefix up front, so stepping never has
/// to inspect keys itself. A `prefix_end` of `None` means no key outside
/// the prefix can sort after it, and the range is left open.
struct SledIter {
    inner: sled::Iter,
    entry: Option<(sled::IVec, sled::IVec)>,
    failed: Option<anyhow::Error>,
}

impl SledIter {
    fn over_prefix(tree: &sled::Db, prefix: &[u8], start: &[u8]) -> Self {
        let mut from = Vec::with_capacity(prefix.len() + start.len());
        from.extend_from_slice(prefix);
        from.extend_from_slice(start);
        let inner = match prefix_end(prefix) {
            Some(end) => tree.range(from..end),
            None => tree.range(from..),
        };
        Self { inner, entry: None, failed: None }
    }
}

impl Iterator for SledIter {
    fn next(&mut self) -> bool {
        self.entry = match self.inner.next() {
            Some(Ok(kv)) => Some(kv),
            Some(Err(e)) => {
                self.failed = Some(e.into());
                None
            }
            None => None,
        };
        self.entry.is_some()
    }

    fn key(&self) -> &[u8] {
        self.entry.as_ref().map_or(&[], |(k, _)| k.as_ref())
    }

    fn value(&self) -> &[u8] {
        self.entry.as_ref().map_or(&[], |(_, v)| v.as_ref())
    }

    fn release(self: Box<Self>) {}

    fn error(&self) -> Option<anyhow::Error> {
        self.failed.as_ref().map(|e| anyhow::anyhow!("{e}"))
    }
}

impl Database for SledDb {
    fn has(&self, key: &[u8]) -> Result<bool, anyhow::Error> {
        Ok(self.inner.contains_key(key)?)
    }

    fn get(&self, key: &[u8]) -> Result<Vec<u8>, anyhow::Error> {
        self.inner.get(key)?.map(|v| v.to_vec()).ok_or_else(|| NotFound.into())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), anyhow::Error> {
        self.inner.insert(key, value)?;
        Ok(())
    }

    fn new_batch(&self) -> Box<dyn Batch> {
        Box::new(SledBatch { tree: self.inner.clone(), pending: sled::Batch::default() })
    }

    fn new_iterator(&self, prefix: &[u8], start: &[u8]) -> Box<dyn Iterator> {
        Box::new(SledIter::over_prefix(&self.inner, prefix, start))
    }
}
