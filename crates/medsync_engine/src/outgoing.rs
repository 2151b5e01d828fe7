//! Paged reads of a planned snapshot.

use medsync_protocol::{OutgoingChange, PagingOptions};

/// Serves a planned snapshot in bounded pages.
///
/// Pages are addressed by cursor, so asking for the same page twice
/// returns the same changes.
#[derive(Debug, Clone, Copy)]
pub struct OutgoingChangeReader {
    max_records_per_chunk: usize,
}

impl OutgoingChangeReader {
    /// Creates a reader returning at most `max_records_per_chunk` changes
    /// per page.
    pub fn new(max_records_per_chunk: usize) -> Self {
        Self {
            max_records_per_chunk: max_records_per_chunk.max(1),
        }
    }

    /// Effective page size for a request.
    pub fn page_size(&self, paging: PagingOptions) -> usize {
        paging
            .limit
            .map_or(self.max_records_per_chunk, |limit| {
                limit.clamp(1, self.max_records_per_chunk)
            })
    }

    /// Returns the changes after `paging.from_id`, up to the page size.
    pub fn page(&self, snapshot: &[OutgoingChange], paging: PagingOptions) -> Vec<OutgoingChange> {
        let from_id = paging.from_id.unwrap_or(0);
        let start = snapshot.partition_point(|change| change.id <= from_id);
        snapshot
            .iter()
            .skip(start)
            .take(self.page_size(paging))
            .cloned()
            .collect()
    }
}
