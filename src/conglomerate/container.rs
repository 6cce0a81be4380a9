use super::{
    ConglomerateController, OpenContext, OpenMode, ScanBound, ScanController, ScanOperator, ScanSpec,
    validate_row,
};
use crate::catalog::types::{ColumnOrdering, ColumnType, Row, RowLocation, Value};
use crate::catalog::{ConglomerateId, ContainerKey};
use crate::error::AccessError;
use crate::raw::{KeyRange, RawTransaction};
use crate::storage::encoded_key::{EncodedKey, prefix_successor};
use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::Arc;
use tracing::trace;

/// How rows are keyed inside their container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum KeyLayout {
    /// Keys are record ids handed out by the container.
    Heap,
    /// Keys encode the ordering columns; non-unique layouts append a record id.
    Ordered {
        ordering: Arc<[ColumnOrdering]>,
        unique: bool,
    },
}

/// What a controller or scan needs to know about the conglomerate it opened.
#[derive(Debug, Clone)]
pub(crate) struct ContainerAccess {
    pub id: ConglomerateId,
    pub container: ContainerKey,
    pub template: Arc<[ColumnType]>,
    pub layout: KeyLayout,
    pub implementation: &'static str,
    /// Whether rows can be fetched, replaced and deleted by location.
    pub row_access: bool,
}

impl ContainerAccess {
    /// Checks the container still exists and takes the open's container lock.
    fn attach(&self, raw: &mut dyn RawTransaction, ctx: &OpenContext) -> Result<(), AccessError> {
        raw.container_metadata(self.container)?;
        ctx.policy.lock_container(
            raw,
            self.container,
            ctx.mode.for_update(),
            ctx.lock_group,
            ctx.mode.wait_policy(),
        )
    }

    fn lock_record(
        &self,
        raw: &mut dyn RawTransaction,
        ctx: &OpenContext,
        record: &EncodedKey,
        for_update: bool,
    ) -> Result<(), AccessError> {
        ctx.policy.lock_record(
            raw,
            self.container,
            record,
            for_update,
            ctx.lock_group,
            ctx.mode.wait_policy(),
        )
    }

    /// Stored rows may predate added columns.
    fn widen(&self, mut row: Row) -> Row {
        while row.values.len() < self.template.len() {
            row.values.push(Value::Null);
        }
        row
    }

    fn location(&self, record: EncodedKey) -> RowLocation {
        RowLocation {
            container: self.container,
            record,
        }
    }

    fn check_location(&self, location: &RowLocation) -> Result<(), AccessError> {
        if location.container != self.container {
            return Err(AccessError::Validation(format!(
                "row location in {} does not belong to conglomerate {}",
                location.container, self.id
            )));
        }
        Ok(())
    }

    fn require_row_access(&self, operation: &str) -> Result<(), AccessError> {
        if !self.row_access {
            return Err(AccessError::unsupported(operation, self.implementation));
        }
        Ok(())
    }

    fn record_key(&self, raw: &mut dyn RawTransaction, row: &Row) -> Result<EncodedKey, AccessError> {
        match &self.layout {
            KeyLayout::Heap => Ok(EncodedKey::from_record_id(raw.next_record_id(self.container)?)),
            KeyLayout::Ordered { ordering, unique } => {
                let key = EncodedKey::from_ordering(row, ordering);
                if *unique {
                    Ok(key)
                } else {
                    let suffix = EncodedKey::from_record_id(raw.next_record_id(self.container)?);
                    Ok(key.concat(&suffix))
                }
            }
        }
    }

    fn duplicate(&self, row: &Row) -> AccessError {
        let key = match &self.layout {
            KeyLayout::Ordered { ordering, .. } => ordering
                .iter()
                .map(|col| row.get(col.column).unwrap_or(&Value::Null).to_string())
                .collect::<Vec<_>>()
                .join(", "),
            KeyLayout::Heap => String::new(),
        };
        AccessError::DuplicateKey {
            conglomerate: self.id.0,
            key,
        }
    }

    fn key_range(&self, spec: &ScanSpec) -> Result<Option<KeyRange>, AccessError> {
        let ordering = match &self.layout {
            KeyLayout::Heap => {
                if spec.start.is_some() || spec.stop.is_some() {
                    return Err(AccessError::unsupported(
                        "positioned scan",
                        self.implementation,
                    ));
                }
                return Ok(Some((Bound::Unbounded, Bound::Unbounded)));
            }
            KeyLayout::Ordered { ordering, .. } => ordering,
        };
        let prefix = |bound: &ScanBound| -> Result<Option<EncodedKey>, AccessError> {
            if bound.key.len() > ordering.len() {
                return Err(AccessError::Validation(format!(
                    "scan bound has {} columns but the key has {}",
                    bound.key.len(),
                    ordering.len()
                )));
            }
            if bound.key.is_empty() {
                return Ok(None);
            }
            Ok(Some(EncodedKey::from_prefix(&bound.key, ordering)))
        };

        let lower = match &spec.start {
            None => Bound::Unbounded,
            Some(bound) => match (prefix(bound)?, bound.operator) {
                (None, _) => Bound::Unbounded,
                (Some(p), ScanOperator::Ge) => Bound::Included(p),
                (Some(p), ScanOperator::Gt) => match prefix_successor(&p) {
                    Some(next) => Bound::Included(next),
                    None => return Ok(None),
                },
            },
        };
        let upper = match &spec.stop {
            None => Bound::Unbounded,
            Some(bound) => match (prefix(bound)?, bound.operator) {
                (None, _) => Bound::Unbounded,
                (Some(p), ScanOperator::Ge) => Bound::Excluded(p),
                (Some(p), ScanOperator::Gt) => match prefix_successor(&p) {
                    Some(next) => Bound::Excluded(next),
                    None => Bound::Unbounded,
                },
            },
        };
        Ok(Some((lower, upper)))
    }
}

fn require_update(mode: OpenMode, id: ConglomerateId, operation: &str) -> Result<(), AccessError> {
    if mode.contains(OpenMode::FOR_LOCK_ONLY) {
        return Err(AccessError::ProtocolViolation(format!(
            "{operation} on conglomerate {id} opened for locking only"
        )));
    }
    if !mode.for_update() {
        return Err(AccessError::ProtocolViolation(format!(
            "{operation} on conglomerate {id} not opened for update"
        )));
    }
    Ok(())
}

fn require_data(mode: OpenMode, id: ConglomerateId) -> Result<(), AccessError> {
    if mode.contains(OpenMode::FOR_LOCK_ONLY) {
        return Err(AccessError::ProtocolViolation(format!(
            "conglomerate {id} opened for locking only"
        )));
    }
    Ok(())
}

pub(crate) struct ContainerController {
    access: ContainerAccess,
    ctx: OpenContext,
    closed: bool,
}

impl ContainerController {
    pub(crate) fn open(
        access: ContainerAccess,
        raw: &mut dyn RawTransaction,
        ctx: OpenContext,
    ) -> Result<Self, AccessError> {
        access.attach(raw, &ctx)?;
        trace!(conglomerate = %access.id, mode = ?ctx.mode, "conglomerate opened");
        Ok(Self {
            access,
            ctx,
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<(), AccessError> {
        if self.closed {
            return Err(AccessError::IllegalState(format!(
                "controller for conglomerate {} is closed",
                self.access.id
            )));
        }
        Ok(())
    }
}

impl ConglomerateController for ContainerController {
    fn conglomerate_id(&self) -> ConglomerateId {
        self.access.id
    }

    fn is_held(&self) -> bool {
        self.ctx.hold
    }

    fn insert(&mut self, raw: &mut dyn RawTransaction, row: Row) -> Result<RowLocation, AccessError> {
        self.ensure_open()?;
        require_update(self.ctx.mode, self.access.id, "insert")?;
        validate_row(self.access.id, &self.access.template, &row)?;
        let record = self.access.record_key(raw, &row)?;
        self.access.lock_record(raw, &self.ctx, &record, true)?;
        if !raw.insert_record(self.access.container, record.clone(), row.clone())? {
            return Err(match self.access.layout {
                KeyLayout::Heap => AccessError::Corrupt(format!(
                    "record id {record} reused in {}",
                    self.access.container
                )),
                KeyLayout::Ordered { .. } => self.access.duplicate(&row),
            });
        }
        Ok(self.access.location(record))
    }

    fn fetch(
        &mut self,
        raw: &mut dyn RawTransaction,
        location: &RowLocation,
        projection: Option<&[usize]>,
    ) -> Result<Option<Row>, AccessError> {
        self.ensure_open()?;
        self.access.require_row_access("fetch")?;
        require_data(self.ctx.mode, self.access.id)?;
        self.access.check_location(location)?;
        self.access.lock_record(
            raw,
            &self.ctx,
            &location.record,
            self.ctx.mode.reads_for_update(),
        )?;
        let Some(row) = raw.fetch_record(self.access.container, &location.record)? else {
            return Ok(None);
        };
        let row = self.access.widen(row);
        Ok(Some(match projection {
            Some(columns) => row.project(columns),
            None => row,
        }))
    }

    fn replace(
        &mut self,
        raw: &mut dyn RawTransaction,
        location: &RowLocation,
        row: Row,
    ) -> Result<bool, AccessError> {
        self.ensure_open()?;
        self.access.require_row_access("replace")?;
        require_update(self.ctx.mode, self.access.id, "replace")?;
        self.access.check_location(location)?;
        validate_row(self.access.id, &self.access.template, &row)?;
        self.access.lock_record(raw, &self.ctx, &location.record, true)?;
        raw.replace_record(self.access.container, &location.record, row)
    }

    fn delete(&mut self, raw: &mut dyn RawTransaction, location: &RowLocation) -> Result<bool, AccessError> {
        self.ensure_open()?;
        self.access.require_row_access("delete")?;
        require_update(self.ctx.mode, self.access.id, "delete")?;
        self.access.check_location(location)?;
        self.access.lock_record(raw, &self.ctx, &location.record, true)?;
        raw.delete_record(self.access.container, &location.record)
    }

    fn lock_row(
        &mut self,
        raw: &mut dyn RawTransaction,
        location: &RowLocation,
        for_update: bool,
    ) -> Result<(), AccessError> {
        self.ensure_open()?;
        self.access.check_location(location)?;
        self.access.lock_record(raw, &self.ctx, &location.record, for_update)
    }

    fn close(&mut self, raw: &mut dyn RawTransaction) -> Result<(), AccessError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        raw.release_lock_group(self.ctx.lock_group)
    }
}

/// Scan over the keys present when it was opened. Each row is locked and
/// re-read as the scan reaches it, so rows deleted in the meantime are
/// skipped.
pub(crate) struct ContainerScan {
    access: ContainerAccess,
    ctx: OpenContext,
    spec: ScanSpec,
    pending: VecDeque<EncodedKey>,
    current: Option<EncodedKey>,
    visited: usize,
    closed: bool,
}

impl ContainerScan {
    pub(crate) fn open(
        access: ContainerAccess,
        raw: &mut dyn RawTransaction,
        ctx: OpenContext,
        spec: ScanSpec,
    ) -> Result<Self, AccessError> {
        require_data(ctx.mode, access.id)?;
        let range = access.key_range(&spec)?;
        access.attach(raw, &ctx)?;
        let pending: VecDeque<EncodedKey> = match range {
            Some(range) => raw.scan_keys(access.container, range)?.into(),
            None => VecDeque::new(),
        };
        trace!(conglomerate = %access.id, keys = pending.len(), "scan opened");
        Ok(Self {
            access,
            ctx,
            spec,
            pending,
            current: None,
            visited: 0,
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<(), AccessError> {
        if self.closed {
            return Err(AccessError::IllegalState(format!(
                "scan on conglomerate {} is closed",
                self.access.id
            )));
        }
        Ok(())
    }

    fn current(&self, operation: &str) -> Result<EncodedKey, AccessError> {
        self.current.clone().ok_or_else(|| {
            AccessError::ProtocolViolation(format!(
                "{operation} on conglomerate {} without a current row",
                self.access.id
            ))
        })
    }
}

impl ScanController for ContainerScan {
    fn conglomerate_id(&self) -> ConglomerateId {
        self.access.id
    }

    fn is_held(&self) -> bool {
        self.ctx.hold
    }

    fn next(&mut self, raw: &mut dyn RawTransaction) -> Result<Option<(RowLocation, Row)>, AccessError> {
        self.ensure_open()?;
        self.current = None;
        while let Some(record) = self.pending.pop_front() {
            self.access.lock_record(
                raw,
                &self.ctx,
                &record,
                self.ctx.mode.reads_for_update(),
            )?;
            let Some(row) = raw.fetch_record(self.access.container, &record)? else {
                continue;
            };
            self.visited += 1;
            let row = self.access.widen(row);
            if !self.spec.qualifies(&row) {
                continue;
            }
            self.current = Some(record.clone());
            return Ok(Some((self.access.location(record), self.spec.project(row))));
        }
        Ok(None)
    }

    fn delete_current(&mut self, raw: &mut dyn RawTransaction) -> Result<bool, AccessError> {
        self.ensure_open()?;
        require_update(self.ctx.mode, self.access.id, "delete_current")?;
        let record = self.current("delete_current")?;
        self.access.lock_record(raw, &self.ctx, &record, true)?;
        let deleted = raw.delete_record(self.access.container, &record)?;
        self.current = None;
        Ok(deleted)
    }

    fn replace_current(&mut self, raw: &mut dyn RawTransaction, row: Row) -> Result<bool, AccessError> {
        self.ensure_open()?;
        self.access.require_row_access("replace_current")?;
        require_update(self.ctx.mode, self.access.id, "replace_current")?;
        let record = self.current("replace_current")?;
        validate_row(self.access.id, &self.access.template, &row)?;
        self.access.lock_record(raw, &self.ctx, &record, true)?;
        raw.replace_record(self.access.container, &record, row)
    }

    fn rows_visited(&self) -> usize {
        self.visited
    }

    fn close(&mut self, raw: &mut dyn RawTransaction) -> Result<(), AccessError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pending.clear();
        self.current = None;
        raw.release_lock_group(self.ctx.lock_group)
    }
}
