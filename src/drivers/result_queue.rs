use std::collections::VecDeque;

use crate::error::NativeError;
use crate::traits::{NativeResult, StoredResult};
use crate::types::RawQueryResult;

/// One result of a multi-statement batch, as buffered by a native handle.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchResult {
    Rows(RawQueryResult),
    Affected { rows: u64, insert_id: u64 },
    /// Fields were announced but the result could not be stored.
    Unstorable(NativeError),
}

impl BatchResult {
    fn insert_id(&self) -> u64 {
        match self {
            BatchResult::Affected { insert_id, .. } => *insert_id,
            _ => 0,
        }
    }
}

/// Walks the results of the last submitted batch in order.
#[derive(Debug, Default)]
pub(crate) struct ResultQueue {
    current: Option<BatchResult>,
    pending: VecDeque<BatchResult>,
    /// Error raised by a statement after the buffered results.
    trailing_error: Option<NativeError>,
    insert_id: u64,
}

impl ResultQueue {
    pub(crate) fn load(&mut self, results: Vec<BatchResult>, trailing_error: Option<NativeError>) {
        self.pending = results.into();
        self.trailing_error = trailing_error;
        self.current = self.pending.pop_front();
        self.insert_id = self.current.as_ref().map_or(0, BatchResult::insert_id);
    }

    pub(crate) fn clear(&mut self) {
        self.load(Vec::new(), None);
    }

    pub(crate) fn store_result(&mut self) -> StoredResult {
        match self.current.take() {
            Some(BatchResult::Rows(result)) => StoredResult::Rows(result),
            Some(BatchResult::Affected { rows, .. }) => StoredResult::NoFields {
                affected_rows: rows,
            },
            Some(BatchResult::Unstorable(err)) => StoredResult::Unavailable(err),
            None => StoredResult::NoFields { affected_rows: 0 },
        }
    }

    pub(crate) fn next_result(&mut self) -> NativeResult<bool> {
        self.current = None;
        if let Some(next) = self.pending.pop_front() {
            self.insert_id = next.insert_id();
            self.current = Some(next);
            return Ok(true);
        }
        match self.trailing_error.take() {
            Some(err) => Err(err),
            None => Ok(false),
        }
    }

    pub(crate) fn insert_id(&self) -> u64 {
        self.insert_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walks_batch_in_order() {
        let mut queue = ResultQueue::default();
        queue.load(
            vec![
                BatchResult::Affected { rows: 2, insert_id: 7 },
                BatchResult::Rows(RawQueryResult::empty()),
            ],
            None,
        );

        assert_eq!(queue.insert_id(), 7);
        assert_eq!(
            queue.store_result(),
            StoredResult::NoFields { affected_rows: 2 }
        );
        assert_eq!(queue.next_result(), Ok(true));
        assert_eq!(
            queue.store_result(),
            StoredResult::Rows(RawQueryResult::empty())
        );
        assert_eq!(queue.next_result(), Ok(false));
    }

    #[test]
    fn test_trailing_error_surfaces_after_results() {
        let mut queue = ResultQueue::default();
        let err = NativeError::new(1146, "Table 'x' doesn't exist");
        queue.load(
            vec![BatchResult::Affected { rows: 1, insert_id: 0 }],
            Some(err.clone()),
        );

        assert_eq!(queue.next_result(), Err(err));
        assert_eq!(queue.next_result(), Ok(false));
    }

    #[test]
    fn test_clear_resets_insert_id() {
        let mut queue = ResultQueue::default();
        queue.load(vec![BatchResult::Affected { rows: 1, insert_id: 3 }], None);
        queue.clear();
        assert_eq!(queue.insert_id(), 0);
        assert_eq!(
            queue.store_result(),
            StoredResult::NoFields { affected_rows: 0 }
        );
    }
}
