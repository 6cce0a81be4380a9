use super::container::{ContainerAccess, ContainerController, ContainerScan, KeyLayout};
use super::{
    Conglomerate, ConglomerateController, ConglomerateFactory, OpenContext, ScanController,
    ScanSpec, decode_body, encode_descriptor,
};
use crate::catalog::types::{ColumnOrdering, ColumnType};
use crate::catalog::{
    BTREE_KIND, ConglomerateId, ConglomerateProperties, ContainerKey, allows_duplicates,
};
use crate::error::AccessError;
use crate::raw::RawTransaction;
use crate::registry::MethodFactory;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

pub const BTREE_IMPLEMENTATION: &str = "btree";
pub const BTREE_FORMAT: Uuid = Uuid::from_u128(0x0b7e_e1a4_58c6_4f2d_8e90_3d1b_7c64_f210);

/// Ordered conglomerate. Rows are keyed by their ordering columns and can only
/// be reached through scans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BTree {
    id: ConglomerateId,
    container: ContainerKey,
    template: Arc<[ColumnType]>,
    ordering: Arc<[ColumnOrdering]>,
    unique: bool,
    #[serde(default)]
    properties: ConglomerateProperties,
}

impl BTree {
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    fn access(&self) -> ContainerAccess {
        ContainerAccess {
            id: self.id,
            container: self.container,
            template: Arc::clone(&self.template),
            layout: KeyLayout::Ordered {
                ordering: Arc::clone(&self.ordering),
                unique: self.unique,
            },
            implementation: BTREE_IMPLEMENTATION,
            row_access: false,
        }
    }
}

impl Conglomerate for BTree {
    fn id(&self) -> ConglomerateId {
        self.id
    }

    fn container(&self) -> ContainerKey {
        self.container
    }

    fn implementation_type(&self) -> &'static str {
        BTREE_IMPLEMENTATION
    }

    fn template(&self) -> &[ColumnType] {
        &self.template
    }

    fn ordering(&self) -> &[ColumnOrdering] {
        &self.ordering
    }

    fn encode(&self) -> Result<Vec<u8>, AccessError> {
        encode_descriptor(BTREE_FORMAT, self)
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
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BTreeFactory;

impl MethodFactory for BTreeFactory {
    fn primary_implementation_type(&self) -> &str {
        BTREE_IMPLEMENTATION
    }

    fn primary_format(&self) -> Uuid {
        BTREE_FORMAT
    }

    fn supports_implementation(&self, implementation: &str) -> bool {
        matches!(implementation, BTREE_IMPLEMENTATION | "index" | "b2i")
    }
}

impl ConglomerateFactory for BTreeFactory {
    fn kind_tag(&self) -> u8 {
        BTREE_KIND
    }

    fn create(
        &self,
        raw: &mut dyn RawTransaction,
        id: ConglomerateId,
        container: ContainerKey,
        template: &[ColumnType],
        ordering: &[ColumnOrdering],
        properties: &ConglomerateProperties,
    ) -> Result<Arc<dyn Conglomerate>, AccessError> {
        if ordering.is_empty() {
            return Err(AccessError::Validation(
                "btree needs at least one ordering column".into(),
            ));
        }
        let mut seen = HashSet::new();
        for col in ordering {
            if col.column >= template.len() {
                return Err(AccessError::Validation(format!(
                    "ordering column {} outside a {}-column template",
                    col.column,
                    template.len()
                )));
            }
            if !seen.insert(col.column) {
                return Err(AccessError::Validation(format!(
                    "ordering lists column {} twice",
                    col.column
                )));
            }
        }
        let tree = BTree {
            id,
            container,
            template: template.into(),
            ordering: ordering.into(),
            unique: !allows_duplicates(properties),
            properties: properties.clone(),
        };
        raw.create_container(container, tree.encode()?)?;
        Ok(Arc::new(tree))
    }

    fn read_descriptor(&self, body: &[u8]) -> Result<Arc<dyn Conglomerate>, AccessError> {
        let tree: BTree = decode_body(body)?;
        Ok(Arc::new(tree))
    }
}
