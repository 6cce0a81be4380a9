pub mod btree;
mod container;
pub mod heap;

use crate::catalog::types::{ColumnOrdering, ColumnType, Row, RowLocation, Value};
use crate::catalog::{ConglomerateId, ConglomerateProperties, ContainerKey};
use crate::error::AccessError;
use crate::locking::LockingPolicy;
use crate::locking::lock_manager::{LockGroup, WaitPolicy};
use crate::raw::RawTransaction;
use crate::registry::MethodFactory;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use uuid::Uuid;

bitflags::bitflags! {
    /// How a conglomerate or scan is opened.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenMode: u32 {
        const FOR_UPDATE = 0x0004;
        /// Take only the container lock; row operations are refused.
        const FOR_LOCK_ONLY = 0x0040;
        /// Fail with a lock timeout instead of waiting.
        const LOCK_NOWAIT = 0x0080;
        /// Rows read through an update open are locked exclusively up front.
        const USE_UPDATE_LOCKS = 0x1000;
    }
}

impl OpenMode {
    pub fn for_update(self) -> bool {
        self.contains(OpenMode::FOR_UPDATE)
    }

    pub fn wait_policy(self) -> WaitPolicy {
        if self.contains(OpenMode::LOCK_NOWAIT) {
            WaitPolicy::NoWait
        } else {
            WaitPolicy::Timed
        }
    }

    /// Whether reads through this open take write locks on rows.
    pub fn reads_for_update(self) -> bool {
        self.contains(OpenMode::FOR_UPDATE | OpenMode::USE_UPDATE_LOCKS)
    }
}

/// Everything a factory needs to open a controller inside a transaction.
#[derive(Debug, Clone, Copy)]
pub struct OpenContext {
    /// Survives commit; closed only on abort or explicit close.
    pub hold: bool,
    pub mode: OpenMode,
    pub policy: LockingPolicy,
    /// Group for locks released when the controller closes.
    pub lock_group: LockGroup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
    IsNull,
}

/// Single column predicate. Comparisons against NULL are never true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Qualifier {
    pub column: usize,
    pub op: CompareOp,
    pub value: Value,
    pub negate: bool,
}

impl Qualifier {
    pub fn new(column: usize, op: CompareOp, value: impl Into<Value>) -> Self {
        Self {
            column,
            op,
            value: value.into(),
            negate: false,
        }
    }

    pub fn is_null(column: usize) -> Self {
        Self::new(column, CompareOp::IsNull, Value::Null)
    }

    pub fn negated(mut self) -> Self {
        self.negate = !self.negate;
        self
    }

    pub fn matches(&self, row: &Row) -> bool {
        let actual = row.get(self.column).unwrap_or(&Value::Null);
        if self.op == CompareOp::IsNull {
            return actual.is_null() != self.negate;
        }
        if actual.is_null() || self.value.is_null() {
            return false;
        }
        let ord = actual.cmp(&self.value);
        let hit = match self.op {
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
            CompareOp::IsNull => unreachable!("handled above"),
        };
        hit != self.negate
    }
}

/// For a start bound: `Ge` includes rows equal to the key, `Gt` skips them.
/// For a stop bound: `Gt` stops after rows equal to the key, `Ge` stops
/// before them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanOperator {
    Ge,
    Gt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanBound {
    /// Values of the leading key columns, in ordering position.
    pub key: Vec<Value>,
    pub operator: ScanOperator,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanSpec {
    pub start: Option<ScanBound>,
    pub stop: Option<ScanBound>,
    /// Conjunctive normal form: every entry of the first list must hold, and
    /// at least one entry of each later list.
    pub qualifiers: Vec<Vec<Qualifier>>,
    pub projection: Option<Vec<usize>>,
}

impl ScanSpec {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn with_start(mut self, key: Vec<Value>, operator: ScanOperator) -> Self {
        self.start = Some(ScanBound { key, operator });
        self
    }

    pub fn with_stop(mut self, key: Vec<Value>, operator: ScanOperator) -> Self {
        self.stop = Some(ScanBound { key, operator });
        self
    }

    pub fn with_and(mut self, qualifiers: Vec<Qualifier>) -> Self {
        if self.qualifiers.is_empty() {
            self.qualifiers.push(qualifiers);
        } else {
            self.qualifiers[0].extend(qualifiers);
        }
        self
    }

    pub fn with_or(mut self, qualifiers: Vec<Qualifier>) -> Self {
        if self.qualifiers.is_empty() {
            self.qualifiers.push(Vec::new());
        }
        self.qualifiers.push(qualifiers);
        self
    }

    pub fn with_projection(mut self, columns: Vec<usize>) -> Self {
        self.projection = Some(columns);
        self
    }

    pub fn qualifies(&self, row: &Row) -> bool {
        let mut lists = self.qualifiers.iter();
        let Some(conjuncts) = lists.next() else {
            return true;
        };
        conjuncts.iter().all(|q| q.matches(row))
            && lists.all(|disjuncts| disjuncts.iter().any(|q| q.matches(row)))
    }

    pub fn project(&self, row: Row) -> Row {
        match &self.projection {
            Some(columns) => row.project(columns),
            None => row,
        }
    }
}

/// Immutable descriptor of one conglomerate. Successors replace it rather
/// than mutate it.
pub trait Conglomerate: Send + Sync + std::fmt::Debug {
    fn id(&self) -> ConglomerateId;

    fn container(&self) -> ContainerKey;

    fn implementation_type(&self) -> &'static str;

    fn template(&self) -> &[ColumnType];

    fn ordering(&self) -> &[ColumnOrdering] {
        &[]
    }

    fn is_temporary(&self) -> bool {
        self.id().is_temporary()
    }

    /// Bytes stored as the container's metadata.
    fn encode(&self) -> Result<Vec<u8>, AccessError>;

    fn open(
        &self,
        raw: &mut dyn RawTransaction,
        ctx: OpenContext,
    ) -> Result<Box<dyn ConglomerateController>, AccessError>;

    fn open_scan(
        &self,
        raw: &mut dyn RawTransaction,
        ctx: OpenContext,
        spec: ScanSpec,
    ) -> Result<Box<dyn ScanController>, AccessError>;

    fn drop_conglomerate(&self, raw: &mut dyn RawTransaction) -> Result<(), AccessError> {
        raw.drop_container(self.container())
    }

    /// Returns the successor descriptor with one more column.
    fn add_column(
        &self,
        _raw: &mut dyn RawTransaction,
        _column: usize,
        _column_type: ColumnType,
    ) -> Result<Arc<dyn Conglomerate>, AccessError> {
        Err(AccessError::unsupported(
            "add_column",
            self.implementation_type(),
        ))
    }
}

pub trait ConglomerateFactory: MethodFactory {
    /// Value stored in the low bits of every id this factory owns.
    fn kind_tag(&self) -> u8;

    fn create(
        &self,
        raw: &mut dyn RawTransaction,
        id: ConglomerateId,
        container: ContainerKey,
        template: &[ColumnType],
        ordering: &[ColumnOrdering],
        properties: &ConglomerateProperties,
    ) -> Result<Arc<dyn Conglomerate>, AccessError>;

    /// Rebuilds a descriptor from the body of its container metadata.
    fn read_descriptor(&self, body: &[u8]) -> Result<Arc<dyn Conglomerate>, AccessError>;
}

pub trait ConglomerateController: Send {
    fn conglomerate_id(&self) -> ConglomerateId;

    fn is_held(&self) -> bool;

    fn insert(&mut self, raw: &mut dyn RawTransaction, row: Row) -> Result<RowLocation, AccessError>;

    fn fetch(
        &mut self,
        raw: &mut dyn RawTransaction,
        location: &RowLocation,
        projection: Option<&[usize]>,
    ) -> Result<Option<Row>, AccessError>;

    fn replace(
        &mut self,
        raw: &mut dyn RawTransaction,
        location: &RowLocation,
        row: Row,
    ) -> Result<bool, AccessError>;

    fn delete(&mut self, raw: &mut dyn RawTransaction, location: &RowLocation) -> Result<bool, AccessError>;

    fn lock_row(
        &mut self,
        raw: &mut dyn RawTransaction,
        location: &RowLocation,
        for_update: bool,
    ) -> Result<(), AccessError>;

    fn close(&mut self, raw: &mut dyn RawTransaction) -> Result<(), AccessError>;

    /// Closes unless the controller is held and `closing_held` is false.
    /// Returns whether it closed.
    fn close_for_end_transaction(
        &mut self,
        raw: &mut dyn RawTransaction,
        closing_held: bool,
    ) -> Result<bool, AccessError> {
        if self.is_held() && !closing_held {
            return Ok(false);
        }
        self.close(raw)?;
        Ok(true)
    }
}

pub trait ScanController: Send {
    fn conglomerate_id(&self) -> ConglomerateId;

    fn is_held(&self) -> bool;

    /// Next qualifying row, projected, with its location.
    fn next(&mut self, raw: &mut dyn RawTransaction) -> Result<Option<(RowLocation, Row)>, AccessError>;

    fn fetch_next_group(
        &mut self,
        raw: &mut dyn RawTransaction,
        max_rows: usize,
    ) -> Result<Vec<Row>, AccessError> {
        let mut out = Vec::with_capacity(max_rows.min(64));
        while out.len() < max_rows {
            match self.next(raw)? {
                Some((_, row)) => out.push(row),
                None => break,
            }
        }
        Ok(out)
    }

    fn delete_current(&mut self, raw: &mut dyn RawTransaction) -> Result<bool, AccessError>;

    fn replace_current(&mut self, raw: &mut dyn RawTransaction, row: Row) -> Result<bool, AccessError>;

    fn rows_visited(&self) -> usize;

    fn close(&mut self, raw: &mut dyn RawTransaction) -> Result<(), AccessError>;

    fn close_for_end_transaction(
        &mut self,
        raw: &mut dyn RawTransaction,
        closing_held: bool,
    ) -> Result<bool, AccessError> {
        if self.is_held() && !closing_held {
            return Ok(false);
        }
        self.close(raw)?;
        Ok(true)
    }
}

#[derive(Serialize, Deserialize)]
struct DescriptorEnvelope {
    format: Uuid,
    #[serde(with = "serde_bytes")]
    body: Vec<u8>,
}

/// Wraps a descriptor body with the format id used to find its factory.
pub fn encode_descriptor<T: Serialize>(format: Uuid, descriptor: &T) -> Result<Vec<u8>, AccessError> {
    let body = rmp_serde::to_vec(descriptor).map_err(|e| AccessError::Encode(e.to_string()))?;
    rmp_serde::to_vec(&DescriptorEnvelope { format, body })
        .map_err(|e| AccessError::Encode(e.to_string()))
}

pub fn decode_envelope(bytes: &[u8]) -> Result<(Uuid, Vec<u8>), AccessError> {
    let envelope: DescriptorEnvelope =
        rmp_serde::from_slice(bytes).map_err(|e| AccessError::Decode(e.to_string()))?;
    Ok((envelope.format, envelope.body))
}

pub(crate) fn decode_body<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, AccessError> {
    rmp_serde::from_slice(body).map_err(|e| AccessError::Decode(e.to_string()))
}

/// Row shape check shared by every kind.
pub(crate) fn validate_row(
    id: ConglomerateId,
    template: &[ColumnType],
    row: &Row,
) -> Result<(), AccessError> {
    if row.len() != template.len() {
        return Err(AccessError::InvalidRow {
            conglomerate: id.0,
            message: format!("expected {} columns, got {}", template.len(), row.len()),
        });
    }
    for (i, (ty, value)) in template.iter().zip(&row.values).enumerate() {
        if !ty.accepts(value) {
            return Err(AccessError::InvalidRow {
                conglomerate: id.0,
                message: format!("column {i} expects {ty:?}, got {value}"),
            });
        }
    }
    Ok(())
}
