use super::{Sort, SortFactory, SortScan};
use crate::catalog::types::{ColumnOrdering, ColumnType, Row};
use crate::error::AccessError;
use crate::registry::MethodFactory;
use crate::storage::encoded_key::EncodedKey;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use tempfile::NamedTempFile;
use tracing::debug;
use uuid::Uuid;

pub const SORT_EXTERNAL_IMPLEMENTATION: &str = "sort external";
pub const SORT_EXTERNAL_FORMAT: Uuid = Uuid::from_u128(0x51c7_20d9_6a4e_4e83_b5f1_9e2a_04c8_7d55);

type SortEntry = (EncodedKey, Row);

#[derive(Debug, Clone, Copy)]
pub struct ExternalSortFactory {
    buffer_rows: usize,
}

impl ExternalSortFactory {
    /// `buffer_rows` rows are kept in memory before a sorted run is spilled.
    pub fn new(buffer_rows: usize) -> Self {
        Self {
            buffer_rows: buffer_rows.max(1),
        }
    }
}

impl MethodFactory for ExternalSortFactory {
    fn primary_implementation_type(&self) -> &str {
        SORT_EXTERNAL_IMPLEMENTATION
    }

    fn primary_format(&self) -> Uuid {
        SORT_EXTERNAL_FORMAT
    }
}

impl SortFactory for ExternalSortFactory {
    fn create_sort(
        &self,
        template: &[ColumnType],
        ordering: &[ColumnOrdering],
        unique: bool,
    ) -> Result<Box<dyn Sort>, AccessError> {
        if let Some(col) = ordering.iter().find(|c| c.column >= template.len()) {
            return Err(AccessError::Validation(format!(
                "sort column {} outside a {}-column template",
                col.column,
                template.len()
            )));
        }
        Ok(Box::new(ExternalSort {
            template: template.to_vec(),
            ordering: ordering.to_vec(),
            unique,
            buffer_rows: self.buffer_rows,
            buffer: Vec::new(),
            runs: Vec::new(),
            inserted: 0,
            complete: false,
            dropped: false,
        }))
    }
}

struct Run {
    file: NamedTempFile,
    len: usize,
}

pub struct ExternalSort {
    template: Vec<ColumnType>,
    ordering: Vec<ColumnOrdering>,
    unique: bool,
    buffer_rows: usize,
    buffer: Vec<SortEntry>,
    runs: Vec<Run>,
    inserted: usize,
    complete: bool,
    dropped: bool,
}

impl ExternalSort {
    fn ensure_live(&self) -> Result<(), AccessError> {
        if self.dropped {
            return Err(AccessError::IllegalState("sort has been dropped".into()));
        }
        Ok(())
    }

    /// Stable sort keeps insertion order among equal keys.
    fn sort_buffer(&mut self) {
        self.buffer.sort_by(|a, b| a.0.cmp(&b.0));
        if self.unique {
            self.buffer.dedup_by(|later, earlier| later.0 == earlier.0);
        }
    }

    fn spill(&mut self) -> Result<(), AccessError> {
        self.sort_buffer();
        let mut file = NamedTempFile::new()?;
        let len = self.buffer.len();
        {
            let mut writer = BufWriter::new(file.as_file_mut());
            for entry in self.buffer.drain(..) {
                rmp_serde::encode::write(&mut writer, &entry)
                    .map_err(|e| AccessError::Encode(e.to_string()))?;
            }
            writer.flush()?;
        }
        debug!(rows = len, run = self.runs.len(), "sort run spilled");
        self.runs.push(Run { file, len });
        Ok(())
    }
}

impl Sort for ExternalSort {
    fn template(&self) -> &[ColumnType] {
        &self.template
    }

    fn insert(&mut self, row: Row) -> Result<(), AccessError> {
        self.ensure_live()?;
        if self.complete {
            return Err(AccessError::ProtocolViolation(
                "insert into a sort after its inserts were completed".into(),
            ));
        }
        if row.len() != self.template.len() {
            return Err(AccessError::Validation(format!(
                "sort expects {} columns, got {}",
                self.template.len(),
                row.len()
            )));
        }
        let key = EncodedKey::from_ordering(&row, &self.ordering);
        self.buffer.push((key, row));
        self.inserted += 1;
        if self.buffer.len() >= self.buffer_rows {
            self.spill()?;
        }
        Ok(())
    }

    fn complete_inserts(&mut self) -> Result<(), AccessError> {
        self.ensure_live()?;
        if !self.complete {
            self.sort_buffer();
            self.complete = true;
        }
        Ok(())
    }

    fn inserts_complete(&self) -> bool {
        self.complete
    }

    fn rows_inserted(&self) -> usize {
        self.inserted
    }

    fn open_scan(&self) -> Result<Box<dyn SortScan>, AccessError> {
        self.ensure_live()?;
        if !self.complete {
            return Err(AccessError::ProtocolViolation(
                "sort scanned before its inserts were completed".into(),
            ));
        }
        let mut sources = Vec::with_capacity(self.runs.len() + 1);
        for run in &self.runs {
            sources.push(Source::Run {
                reader: BufReader::new(run.file.reopen()?),
                remaining: run.len,
            });
        }
        sources.push(Source::Memory(self.buffer.clone().into_iter()));
        MergeScan::new(sources, self.unique).map(|scan| Box::new(scan) as Box<dyn SortScan>)
    }

    fn drop_sort(&mut self) -> Result<(), AccessError> {
        self.dropped = true;
        self.buffer.clear();
        for run in self.runs.drain(..) {
            run.file.close()?;
        }
        Ok(())
    }
}

enum Source {
    Memory(std::vec::IntoIter<SortEntry>),
    Run {
        reader: BufReader<File>,
        remaining: usize,
    },
}

impl Source {
    fn next_entry(&mut self) -> Result<Option<SortEntry>, AccessError> {
        match self {
            Source::Memory(entries) => Ok(entries.next()),
            Source::Run { reader, remaining } => {
                if *remaining == 0 {
                    return Ok(None);
                }
                *remaining -= 1;
                rmp_serde::decode::from_read(reader)
                    .map(Some)
                    .map_err(|e| AccessError::Decode(e.to_string()))
            }
        }
    }
}

struct HeapEntry {
    key: EncodedKey,
    row: Row,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap: the smallest key, then the earliest source, must
// compare greatest.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.source.cmp(&self.source))
    }
}

struct MergeScan {
    sources: Vec<Source>,
    heap: BinaryHeap<HeapEntry>,
    unique: bool,
    last_key: Option<EncodedKey>,
    returned: usize,
}

impl MergeScan {
    fn new(mut sources: Vec<Source>, unique: bool) -> Result<Self, AccessError> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (source, input) in sources.iter_mut().enumerate() {
            if let Some((key, row)) = input.next_entry()? {
                heap.push(HeapEntry { key, row, source });
            }
        }
        Ok(Self {
            sources,
            heap,
            unique,
            last_key: None,
            returned: 0,
        })
    }
}

impl SortScan for MergeScan {
    fn next_row(&mut self) -> Result<Option<Row>, AccessError> {
        while let Some(HeapEntry { key, row, source }) = self.heap.pop() {
            if let Some((next_key, next_row)) = self.sources[source].next_entry()? {
                self.heap.push(HeapEntry {
                    key: next_key,
                    row: next_row,
                    source,
                });
            }
            if self.unique && self.last_key.as_ref() == Some(&key) {
                continue;
            }
            if self.unique {
                self.last_key = Some(key);
            }
            self.returned += 1;
            return Ok(Some(row));
        }
        Ok(None)
    }

    fn rows_returned(&self) -> usize {
        self.returned
    }
}

#[cfg(test)]
mod tests {
    use super::ExternalSortFactory;
    use crate::catalog::types::{ColumnOrdering, ColumnType, Row, Value};
    use crate::error::AccessError;
    use crate::sort::{Sort, SortFactory, SortRowSource};

    fn drain(sort: &dyn Sort) -> Vec<(i64, String)> {
        SortRowSource::new(sort.open_scan().expect("scan"))
            .map(|row| {
                let row = row.expect("row");
                (
                    row.values[0].as_integer().expect("int"),
                    row.values[1].as_text().expect("text").to_string(),
                )
            })
            .collect()
    }

    fn row(k: i64, tag: &str) -> Row {
        Row::from([Value::Integer(k), Value::text(tag)])
    }

    #[test]
    fn spilled_runs_merge_in_order_and_keep_ties_stable() {
        let factory = ExternalSortFactory::new(3);
        let mut sort = factory
            .create_sort(
                &[ColumnType::Integer, ColumnType::Text],
                &[ColumnOrdering::desc(0)],
                false,
            )
            .expect("sort");
        for (k, tag) in [(2, "a"), (9, "b"), (2, "c"), (5, "d"), (7, "e"), (2, "f"), (1, "g")] {
            sort.insert(row(k, tag)).expect("insert");
        }
        sort.complete_inserts().expect("complete");
        assert_eq!(sort.rows_inserted(), 7);
        let keys: Vec<(i64, String)> = drain(sort.as_ref());
        assert_eq!(
            keys,
            vec![
                (9, "b".into()),
                (7, "e".into()),
                (5, "d".into()),
                (2, "a".into()),
                (2, "c".into()),
                (2, "f".into()),
                (1, "g".into()),
            ]
        );
        // A second scan sees the same rows.
        assert_eq!(drain(sort.as_ref()).len(), 7);
    }

    #[test]
    fn unique_sorts_drop_duplicates_across_runs() {
        let factory = ExternalSortFactory::new(2);
        let mut sort = factory
            .create_sort(&[ColumnType::Integer, ColumnType::Text], &[ColumnOrdering::asc(0)], true)
            .expect("sort");
        for (k, tag) in [(3, "x"), (1, "y"), (3, "z"), (1, "w"), (2, "v")] {
            sort.insert(row(k, tag)).expect("insert");
        }
        sort.complete_inserts().expect("complete");
        let keys: Vec<i64> = drain(sort.as_ref()).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn scans_require_completed_inserts() {
        let factory = ExternalSortFactory::new(10);
        let mut sort = factory
            .create_sort(&[ColumnType::Integer, ColumnType::Text], &[ColumnOrdering::asc(0)], false)
            .expect("sort");
        sort.insert(row(1, "a")).expect("insert");
        assert!(matches!(sort.open_scan(), Err(AccessError::ProtocolViolation(_))));
        sort.complete_inserts().expect("complete");
        assert!(matches!(sort.insert(row(2, "b")), Err(AccessError::ProtocolViolation(_))));
        sort.drop_sort().expect("drop");
        assert!(matches!(sort.open_scan(), Err(AccessError::IllegalState(_))));
    }

    #[test]
    fn spill_threshold_creates_runs() {
        let factory = ExternalSortFactory::new(4);
        let mut sort = factory
            .create_sort(&[ColumnType::Integer, ColumnType::Text], &[ColumnOrdering::asc(0)], false)
            .expect("sort");
        for k in 0..10 {
            sort.insert(row(10 - k, "r")).expect("insert");
        }
        sort.complete_inserts().expect("complete");
        let keys: Vec<i64> = drain(sort.as_ref()).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, (1..=10).collect::<Vec<_>>());
    }
}
