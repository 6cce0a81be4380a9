mod external;

pub use external::{ExternalSort, ExternalSortFactory, SORT_EXTERNAL_FORMAT, SORT_EXTERNAL_IMPLEMENTATION};

use crate::catalog::types::{ColumnOrdering, ColumnType, Row};
use crate::error::AccessError;
use crate::registry::MethodFactory;

pub trait SortFactory: MethodFactory {
    /// `unique` drops every row whose ordering columns equal those of a row
    /// already returned.
    fn create_sort(
        &self,
        template: &[ColumnType],
        ordering: &[ColumnOrdering],
        unique: bool,
    ) -> Result<Box<dyn Sort>, AccessError>;
}

/// A sort in progress. Rows go in until `complete_inserts`, then any number
/// of scans read them back in order.
pub trait Sort: Send {
    fn template(&self) -> &[ColumnType];

    fn insert(&mut self, row: Row) -> Result<(), AccessError>;

    fn complete_inserts(&mut self) -> Result<(), AccessError>;

    fn inserts_complete(&self) -> bool;

    fn rows_inserted(&self) -> usize;

    fn open_scan(&self) -> Result<Box<dyn SortScan>, AccessError>;

    /// Releases spilled runs. The sort is unusable afterwards.
    fn drop_sort(&mut self) -> Result<(), AccessError>;
}

pub trait SortScan: Send {
    fn next_row(&mut self) -> Result<Option<Row>, AccessError>;

    fn rows_returned(&self) -> usize;
}

/// Sorted rows as a plain iterator, for callers that feed them straight
/// into a load.
pub struct SortRowSource {
    scan: Box<dyn SortScan>,
    done: bool,
}

impl SortRowSource {
    pub fn new(scan: Box<dyn SortScan>) -> Self {
        Self { scan, done: false }
    }

    pub fn rows_returned(&self) -> usize {
        self.scan.rows_returned()
    }
}

impl Iterator for SortRowSource {
    type Item = Result<Row, AccessError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.scan.next_row() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
