use super::container::{ContainerAccess, ContainerController, ContainerScan, KeyLayout};
use super::{
    Conglomerate, ConglomerateController, ConglomerateFactory, OpenContext, ScanController,
    ScanSpec, decode_body, encode_descriptor,
};
use crate::catalog::types::{ColumnOrdering, ColumnType};
use crate::catalog::{ConglomerateId, ConglomerateProperties, ContainerKey, HEAP_KIND};
use crate::error::AccessError;
use crate::raw::RawTransaction;
use crate::registry::MethodFactory;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub const HEAP_IMPLEMENTATION: &str = "heap";
pub const HEAP_FORMAT: Uuid = Uuid::from_u128(0x6c0f_95e2_1d3a_4b7e_9a41_0c52_e8d7_a301);
/// Descriptors written before properties were recorded.
pub const HEAP_FORMAT_V0: Uuid = Uuid::from_u128(0x6c0f_95e2_1d3a_4b7e_9a41_0c52_e8d7_a300);

/// Unordered conglomerate addressed by record id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heap {
    id: ConglomerateId,
    container: ContainerKey,
    template: Arc<[ColumnType]>,
    #[serde(default)]
    properties: ConglomerateProperties,
}

impl Heap {
    pub fn properties(&self) -> &ConglomerateProperties {
        &self.properties
    }

    fn access(&self) -> ContainerAccess {
        ContainerAccess {
            id: self.id,
            container: self.container,
            template: Arc::clone(&self.template),
            layout: KeyLayout::Heap,
            implementation: HEAP_IMPLEMENTATION,
            row_access: true,
        }
    }
}

impl Conglomerate for Heap {
    fn id(&self) -> ConglomerateId {
        self.id
    }

    fn container(&self) -> ContainerKey {
        self.container
    }

    fn implementation_type(&self) -> &'static str {
        HEAP_IMPLEMENTATION
    }

    fn template(&self) -> &[ColumnType] {
        &self.template
    }

    fn encode(&self) -> Result<Vec<u8>, AccessError> {
        encode_descriptor(HEAP_FORMAT, self)
    }

    fn open(
        &self,
        raw: &mut dyn RawTransaction,
        ctx: OpenContext,
    ) -> Result<Box<dyn ConglomerateController>, AccessError> {
        Ok(Box::new(ContainerController::open(self.access(), raw, ctx)?))
    }

    fn open_scan(
        &self,
        raw: &mut dyn RawTransaction,
        ctx: OpenContext,
        spec: ScanSpec,
    ) -> Result<Box<dyn ScanController>, AccessError> {
        Ok(Box::new(ContainerScan::open(self.access(), raw, ctx, spec)?))
    }

    /// Columns can only be appended. Existing rows read the new column as
    /// NULL.
    fn add_column(
        &self,
        raw: &mut dyn RawTransaction,
        column: usize,
        column_type: ColumnType,
    ) -> Result<Arc<dyn Conglomerate>, AccessError> {
        if column != self.template.len() {
            return Err(AccessError::Validation(format!(
                "heap {} has {} columns; cannot add column at position {column}",
                self.id,
                self.template.len()
            )));
        }
        let mut template = self.template.to_vec();
        template.push(column_type);
        let successor = Heap {
            template: template.into(),
            ..self.clone()
        };
        raw.update_container_metadata(self.container, successor.encode()?)?;
        debug!(conglomerate = %self.id, column, "heap column added");
        Ok(Arc::new(successor))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HeapFactory;

impl MethodFactory for HeapFactory {
    fn primary_implementation_type(&self) -> &str {
        HEAP_IMPLEMENTATION
    }

    fn primary_format(&self) -> Uuid {
        HEAP_FORMAT
    }

    fn supports_implementation(&self, implementation: &str) -> bool {
        matches!(implementation, HEAP_IMPLEMENTATION | "table")
    }

    fn supports_format(&self, format: &Uuid) -> bool {
        *format == HEAP_FORMAT || *format == HEAP_FORMAT_V0
    }
}

impl ConglomerateFactory for HeapFactory {
    fn kind_tag(&self) -> u8 {
        HEAP_KIND
    }

    /// Heaps keep rows in insertion order; `ordering` is ignored.
    fn create(
        &self,
        raw: &mut dyn RawTransaction,
        id: ConglomerateId,
        container: ContainerKey,
        template: &[ColumnType],
        _ordering: &[ColumnOrdering],
        properties: &ConglomerateProperties,
    ) -> Result<Arc<dyn Conglomerate>, AccessError> {
        if template.is_empty() {
            return Err(AccessError::Validation(
                "heap template needs at least one column".into(),
            ));
        }
        let heap = Heap {
            id,
            container,
            template: template.into(),
            properties: properties.clone(),
        };
        raw.create_container(container, heap.encode()?)?;
        Ok(Arc::new(heap))
    }

    fn read_descriptor(&self, body: &[u8]) -> Result<Arc<dyn Conglomerate>, AccessError> {
        let heap: Heap = decode_body(body)?;
        Ok(Arc::new(heap))
    }
}

#[cfg(test)]
mod tests {
    use super::{HEAP_FORMAT, HeapFactory};
    use crate::catalog::types::{ColumnType, Row, Value};
    use crate::catalog::{ConglomerateId, ConglomerateProperties, HEAP_KIND};
    use crate::conglomerate::{
        ConglomerateFactory, OpenContext, OpenMode, ScanSpec, decode_envelope,
    };
    use crate::error::AccessError;
    use crate::locking::{Granularity, IsolationLevel, LockingPolicy};
    use crate::raw::memory::MemoryRawStore;
    use crate::raw::{CommitFlags, RawStore};
    use std::time::Duration;

    fn ctx(raw: &dyn crate::raw::RawTransaction, mode: OpenMode) -> OpenContext {
        OpenContext {
            hold: false,
            mode,
            policy: LockingPolicy::new(Granularity::Record, IsolationLevel::Serializable),
            lock_group: raw.new_lock_group(),
        }
    }

    #[test]
    fn rows_are_inserted_fetched_and_widened_after_add_column() {
        let store = MemoryRawStore::in_memory(Duration::from_millis(200));
        let mut raw = store.start_user_transaction(false).expect("txn");
        let id = ConglomerateId::encode(HEAP_KIND, 1).expect("id");
        let heap = HeapFactory
            .create(
                raw.as_mut(),
                id,
                id.persistent_container(),
                &[ColumnType::Integer, ColumnType::Text],
                &[],
                &ConglomerateProperties::new(),
            )
            .expect("create");

        let c = ctx(raw.as_ref(), OpenMode::FOR_UPDATE);
        let mut cc = heap.open(raw.as_mut(), c).expect("open");
        let loc = cc
            .insert(raw.as_mut(), Row::from([Value::Integer(1), Value::text("one")]))
            .expect("insert");
        cc.close(raw.as_mut()).expect("close");

        let widened = heap
            .add_column(raw.as_mut(), 2, ColumnType::Boolean)
            .expect("add column");
        assert_eq!(widened.template().len(), 3);
        let c = ctx(raw.as_ref(), OpenMode::empty());
        let mut cc = widened.open(raw.as_mut(), c).expect("reopen");
        let row = cc.fetch(raw.as_mut(), &loc, None).expect("fetch").expect("row");
        assert_eq!(row.values[2], Value::Null);
        assert!(matches!(
            cc.insert(raw.as_mut(), Row::from([Value::Integer(2), Value::Null, Value::Null])),
            Err(AccessError::ProtocolViolation(_))
        ));
        assert!(matches!(
            widened.add_column(raw.as_mut(), 7, ColumnType::Text),
            Err(AccessError::Validation(_))
        ));

        let metadata = raw.container_metadata(id.persistent_container()).expect("meta");
        let (format, _) = decode_envelope(&metadata).expect("envelope");
        assert_eq!(format, HEAP_FORMAT);
        raw.commit(CommitFlags::empty()).expect("commit");
    }

    #[test]
    fn heap_scans_refuse_key_bounds() {
        let store = MemoryRawStore::in_memory(Duration::from_millis(200));
        let mut raw = store.start_user_transaction(false).expect("txn");
        let id = ConglomerateId::encode(HEAP_KIND, 2).expect("id");
        let heap = HeapFactory
            .create(
                raw.as_mut(),
                id,
                id.persistent_container(),
                &[ColumnType::Integer],
                &[],
                &ConglomerateProperties::new(),
            )
            .expect("create");
        let c = ctx(raw.as_ref(), OpenMode::empty());
        let spec = ScanSpec::full().with_start(vec![Value::Integer(1)], crate::conglomerate::ScanOperator::Ge);
        assert!(matches!(
            heap.open_scan(raw.as_mut(), c, spec),
            Err(AccessError::Unsupported { .. })
        ));
    }
}
