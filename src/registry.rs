use crate::catalog::{ConglomerateId, KIND_TAG_BITS, MAX_KIND_TAGS};
use crate::conglomerate::ConglomerateFactory;
use crate::error::{AccessError, ResourceType};
use crate::sort::SortFactory;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Identity every access method advertises: one primary implementation name
/// and on-disk format, plus any secondary ones it can also serve.
pub trait MethodFactory: Send + Sync {
    fn primary_implementation_type(&self) -> &str;

    fn primary_format(&self) -> Uuid;

    fn supports_implementation(&self, implementation: &str) -> bool {
        implementation == self.primary_implementation_type()
    }

    fn supports_format(&self, format: &Uuid) -> bool {
        *format == self.primary_format()
    }
}

#[derive(Clone)]
pub enum AccessMethod {
    Conglomerate(Arc<dyn ConglomerateFactory>),
    Sort(Arc<dyn SortFactory>),
}

impl AccessMethod {
    pub fn implementation_type(&self) -> &str {
        match self {
            AccessMethod::Conglomerate(f) => f.primary_implementation_type(),
            AccessMethod::Sort(f) => f.primary_implementation_type(),
        }
    }

    pub fn primary_format(&self) -> Uuid {
        match self {
            AccessMethod::Conglomerate(f) => f.primary_format(),
            AccessMethod::Sort(f) => f.primary_format(),
        }
    }

    pub fn supports_implementation(&self, implementation: &str) -> bool {
        match self {
            AccessMethod::Conglomerate(f) => f.supports_implementation(implementation),
            AccessMethod::Sort(f) => f.supports_implementation(implementation),
        }
    }

    pub fn supports_format(&self, format: &Uuid) -> bool {
        match self {
            AccessMethod::Conglomerate(f) => f.supports_format(format),
            AccessMethod::Sort(f) => f.supports_format(format),
        }
    }
}

impl std::fmt::Debug for AccessMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMethod::Conglomerate(_) => write!(f, "Conglomerate({})", self.implementation_type()),
            AccessMethod::Sort(_) => write!(f, "Sort({})", self.implementation_type()),
        }
    }
}

/// Host-supplied source of access methods that were not registered up
/// front. `Ok(None)` means the provider does not know the name.
pub trait FactoryProvider: Send + Sync {
    fn load(&self, implementation: &str) -> Result<Option<AccessMethod>, AccessError>;
}

struct RegistryTables {
    by_implementation: HashMap<String, AccessMethod>,
    by_format: HashMap<Uuid, AccessMethod>,
    by_kind: [Option<Arc<dyn ConglomerateFactory>>; MAX_KIND_TAGS],
    /// Registration order, scanned for secondary names and formats.
    all: Vec<AccessMethod>,
}

impl Default for RegistryTables {
    fn default() -> Self {
        Self {
            by_implementation: HashMap::new(),
            by_format: HashMap::new(),
            by_kind: std::array::from_fn(|_| None),
            all: Vec::new(),
        }
    }
}

#[derive(Default)]
pub struct ConglomerateRegistry {
    tables: RwLock<RegistryTables>,
    providers: RwLock<Vec<Arc<dyn FactoryProvider>>>,
    /// Next sequence number, seeded on first use.
    next_sequence: Mutex<Option<i64>>,
}

impl ConglomerateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, method: AccessMethod) -> Result<(), AccessError> {
        let mut tables = self.tables.write();
        let name = method.implementation_type().to_string();
        if tables.by_implementation.contains_key(&name) {
            return Err(AccessError::AlreadyExists {
                resource_type: ResourceType::Factory,
                resource_id: name,
            });
        }
        if let AccessMethod::Conglomerate(factory) = &method {
            let tag = usize::from(factory.kind_tag());
            if tag >= MAX_KIND_TAGS {
                return Err(AccessError::ProtocolViolation(format!(
                    "factory '{name}' kind tag {tag} does not fit in {KIND_TAG_BITS} bits"
                )));
            }
            if tables.by_kind[tag].is_some() {
                return Err(AccessError::AlreadyExists {
                    resource_type: ResourceType::Factory,
                    resource_id: format!("kind tag {tag}"),
                });
            }
            tables.by_kind[tag] = Some(Arc::clone(factory));
        }
        tables
            .by_format
            .entry(method.primary_format())
            .or_insert_with(|| method.clone());
        tables.by_implementation.insert(name.clone(), method.clone());
        tables.all.push(method);
        info!(implementation = %name, "access method registered");
        Ok(())
    }

    pub fn register_provider(&self, provider: Arc<dyn FactoryProvider>) {
        self.providers.write().push(provider);
    }

    /// Primary name, then any method claiming the name as secondary, then the
    /// registered providers.
    pub fn resolve_by_name(&self, implementation: &str) -> Result<AccessMethod, AccessError> {
        {
            let tables = self.tables.read();
            if let Some(method) = tables.by_implementation.get(implementation) {
                return Ok(method.clone());
            }
            if let Some(method) = tables
                .all
                .iter()
                .find(|m| m.supports_implementation(implementation))
            {
                return Ok(method.clone());
            }
        }
        let providers: Vec<Arc<dyn FactoryProvider>> = self.providers.read().clone();
        for provider in providers {
            let loaded = provider
                .load(implementation)
                .map_err(|e| AccessError::FactoryLoad {
                    implementation: implementation.to_string(),
                    message: e.to_string(),
                })?;
            let Some(method) = loaded else {
                continue;
            };
            if !method.supports_implementation(implementation) {
                return Err(AccessError::FactoryLoad {
                    implementation: implementation.to_string(),
                    message: format!(
                        "provider returned '{}' which does not serve the name",
                        method.implementation_type()
                    ),
                });
            }
            debug!(implementation, "access method loaded from provider");
            match self.register(method.clone()) {
                Ok(()) | Err(AccessError::AlreadyExists { .. }) => {}
                Err(other) => return Err(other),
            }
            return Ok(method);
        }
        Err(AccessError::not_found(ResourceType::Factory, implementation))
    }

    pub fn resolve_by_format(&self, format: &Uuid) -> Result<AccessMethod, AccessError> {
        let tables = self.tables.read();
        if let Some(method) = tables.by_format.get(format) {
            return Ok(method.clone());
        }
        tables
            .all
            .iter()
            .find(|m| m.supports_format(format))
            .cloned()
            .ok_or_else(|| AccessError::not_found(ResourceType::Factory, format))
    }

    pub fn conglomerate_factory(&self, implementation: &str) -> Result<Arc<dyn ConglomerateFactory>, AccessError> {
        match self.resolve_by_name(implementation)? {
            AccessMethod::Conglomerate(factory) => Ok(factory),
            AccessMethod::Sort(_) => Err(AccessError::not_found(ResourceType::Factory, implementation)),
        }
    }

    pub fn sort_factory(&self, implementation: &str) -> Result<Arc<dyn SortFactory>, AccessError> {
        match self.resolve_by_name(implementation)? {
            AccessMethod::Sort(factory) => Ok(factory),
            AccessMethod::Conglomerate(_) => Err(AccessError::not_found(ResourceType::Factory, implementation)),
        }
    }

    pub fn conglomerate_factory_by_format(&self, format: &Uuid) -> Result<Arc<dyn ConglomerateFactory>, AccessError> {
        match self.resolve_by_format(format)? {
            AccessMethod::Conglomerate(factory) => Ok(factory),
            AccessMethod::Sort(_) => Err(AccessError::not_found(ResourceType::Factory, format)),
        }
    }

    /// Factory owning the kind tag in `id`'s low bits.
    pub fn factory_for_id(&self, id: ConglomerateId) -> Result<Arc<dyn ConglomerateFactory>, AccessError> {
        self.tables.read().by_kind[usize::from(id.kind_tag())]
            .clone()
            .ok_or_else(|| AccessError::not_found(ResourceType::Conglomerate, id))
    }

    pub fn implementations(&self) -> Vec<String> {
        self.tables
            .read()
            .all
            .iter()
            .map(|m| m.implementation_type().to_string())
            .collect()
    }

    /// Hands out a fresh identifier for `kind_tag`. The sequence is seeded
    /// from `max_container_id` on first use. Collisions are left to the
    /// caller, which retries with another id.
    pub fn next_identifier(
        &self,
        kind_tag: u8,
        max_container_id: impl FnOnce() -> i64,
    ) -> Result<ConglomerateId, AccessError> {
        let mut next = self.next_sequence.lock();
        let sequence = match *next {
            Some(seq) => seq,
            None => ((max_container_id() >> KIND_TAG_BITS) + 1).max(1),
        };
        let id = ConglomerateId::encode(kind_tag, sequence)?;
        *next = Some(sequence + 1);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessMethod, ConglomerateRegistry, FactoryProvider, MethodFactory};
    use crate::catalog::{BTREE_KIND, ConglomerateId, HEAP_KIND};
    use crate::conglomerate::ConglomerateFactory;
    use crate::conglomerate::btree::BTreeFactory;
    use crate::conglomerate::heap::HeapFactory;
    use crate::error::{AccessError, ResourceType};
    use crate::sort::ExternalSortFactory;
    use std::sync::Arc;
    use uuid::Uuid;

    fn registry() -> ConglomerateRegistry {
        let registry = ConglomerateRegistry::new();
        registry
            .register(AccessMethod::Conglomerate(Arc::new(HeapFactory)))
            .expect("heap");
        registry
            .register(AccessMethod::Conglomerate(Arc::new(BTreeFactory)))
            .expect("btree");
        registry
            .register(AccessMethod::Sort(Arc::new(ExternalSortFactory::new(16))))
            .expect("sort");
        registry
    }

    #[test]
    fn secondary_names_resolve_to_the_same_factory() {
        let registry = registry();
        let heap = registry.conglomerate_factory("heap").expect("primary");
        let alias = registry.conglomerate_factory("table").expect("secondary");
        assert_eq!(heap.primary_format(), alias.primary_format());
        assert_eq!(registry.conglomerate_factory("index").expect("btree").kind_tag(), BTREE_KIND);
    }

    #[test]
    fn unknown_names_and_kind_mismatches_are_not_found() {
        let registry = registry();
        let err = registry.resolve_by_name("hash").expect_err("missing");
        assert!(matches!(
            err,
            AccessError::NotFound {
                resource_type: ResourceType::Factory,
                ..
            }
        ));
        assert!(registry.conglomerate_factory("sort external").is_err());
        assert!(registry.sort_factory("heap").is_err());
        assert!(registry.resolve_by_format(&Uuid::nil()).is_err());
        assert!(registry.factory_for_id(ConglomerateId(0x25)).is_err());
    }

    #[test]
    fn duplicate_kind_tags_are_rejected() {
        let registry = registry();
        let err = registry
            .register(AccessMethod::Conglomerate(Arc::new(HeapFactory)))
            .expect_err("dup");
        assert!(matches!(err, AccessError::AlreadyExists { .. }));
    }

    struct FailingProvider;

    impl FactoryProvider for FailingProvider {
        fn load(&self, implementation: &str) -> Result<Option<AccessMethod>, AccessError> {
            if implementation == "broken" {
                return Err(AccessError::Corrupt("plugin image damaged".into()));
            }
            Ok(None)
        }
    }

    struct HeapProvider;

    impl FactoryProvider for HeapProvider {
        fn load(&self, implementation: &str) -> Result<Option<AccessMethod>, AccessError> {
            Ok((implementation == "heap")
                .then(|| AccessMethod::Conglomerate(Arc::new(HeapFactory))))
        }
    }

    #[test]
    fn providers_distinguish_missing_from_failed_loads() {
        let registry = ConglomerateRegistry::new();
        registry.register_provider(Arc::new(FailingProvider));
        registry.register_provider(Arc::new(HeapProvider));
        assert!(matches!(
            registry.resolve_by_name("broken"),
            Err(AccessError::FactoryLoad { .. })
        ));
        assert!(matches!(
            registry.resolve_by_name("nothing"),
            Err(AccessError::NotFound { .. })
        ));
        let heap = registry.conglomerate_factory("heap").expect("loaded");
        assert_eq!(heap.kind_tag(), HEAP_KIND);
        assert_eq!(registry.implementations(), vec!["heap".to_string()]);
    }

    #[test]
    fn identifiers_are_seeded_past_existing_containers() {
        let registry = registry();
        let first = registry
            .next_identifier(HEAP_KIND, || 0x51)
            .expect("first");
        assert_eq!(first.sequence(), 6);
        let second = registry
            .next_identifier(BTREE_KIND, || unreachable!("seeded once"))
            .expect("second");
        assert_eq!(second.sequence(), 7);
        assert_eq!(second.kind_tag(), BTREE_KIND);

        let empty = ConglomerateRegistry::new();
        assert_eq!(empty.next_identifier(HEAP_KIND, || -1).expect("id").sequence(), 1);
    }
}
