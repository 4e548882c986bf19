use crate::{Batch, Database};

/// Flush threshold for deleters that own their batches.
pub const IDEAL_BATCH_SIZE: usize = 100 * 1024;

/// Stages deletes for every key under `prefix` at or after `start` into the
/// caller's batch. The caller commits the batch; nothing is written here.
pub fn delete_starting_at<D: Database + ?Sized>(
    db: &D,
    batch: &mut dyn Batch,
    prefix: &[u8],
    start: &[u8],
) -> anyhow::Result<()> {
    let mut it = db.new_iterator(prefix, start);
    while it.next() {
        batch.delete(it.key())?;
    }
    if let Some(err) = it.error() {
        return Err(err);
    }
    it.release();
    Ok(())
}

/// Deletes keys with index suffixes in `[start_min_key, end_min_key)` under
/// `prefix`, flushing intermediate batches once they reach
/// [`IDEAL_BATCH_SIZE`] to bound memory. Returns the `[first, last]` pruned
/// index range, empty if nothing matched. Some keys may already be deleted
/// when an error is returned.
pub fn delete_from_range<D: Database + ?Sized>(
    db: &D,
    prefix: &[u8],
    start_min_key: u64,
    end_min_key: u64,
) -> anyhow::Result<Vec<u64>> {
    let mut batch = db.new_batch();
    let mut staged = 0usize;
    let mut pruned: Vec<u64> = Vec::new();
    let mut it = db.new_iterator(prefix, &start_min_key.to_be_bytes());
    while it.next() {
        let key = it.key();
        if key.len() < prefix.len() + 8 {
            continue;
        }
        let mut suffix = [0u8; 8];
        suffix.copy_from_slice(&key[prefix.len()..prefix.len() + 8]);
        let current = u64::from_be_bytes(suffix);
        if current >= end_min_key {
            break;
        }
        if pruned.len() < 2 {
            pruned.push(current);
        } else {
            pruned[1] = current;
        }
        batch.delete(key)?;
        staged += key.len();
        if staged >= IDEAL_BATCH_SIZE {
            let full = std::mem::replace(&mut batch, db.new_batch());
            full.write()?;
            staged = 0;
        }
    }
    if let Some(err) = it.error() {
        return Err(err);
    }
    it.release();
    if staged > 0 {
        batch.write()?;
    }
    Ok(pruned)
}
