//! Fixed-size chunking for outbound messages.
//!
//! Boundaries depend only on the input order and the batch size, so identical
//! reports always produce identical batches.

/// Splits `items` into consecutive batches of at most `max_items` (zero is treated as one).
#[must_use]
pub fn chunk_batches<T: Clone>(items: &[T], max_items: usize) -> Vec<Vec<T>> {
    items.chunks(max_items.max(1)).map(<[T]>::to_vec).collect()
}

/// Number of batches `chunk_batches` yields for `len` items
#[must_use]
pub const fn batch_count(len: usize, max_items: usize) -> usize {
    let size = if max_items == 0 { 1 } else { max_items };
    len.div_ceil(size)
}
