use super::{CacheManager, CacheStats};
use crate::catalog::ConglomerateId;
use crate::conglomerate::{Conglomerate, decode_envelope};
use crate::error::{AccessError, ResourceType};
use crate::raw::RawStore;
use crate::registry::ConglomerateRegistry;
use std::sync::Arc;
use tracing::debug;

/// Descriptors of persistent conglomerates, keyed by id. Temporary
/// conglomerates never enter this cache.
pub struct ConglomerateCache {
    cache: CacheManager<ConglomerateId, dyn Conglomerate>,
}

impl ConglomerateCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: CacheManager::new("conglomerate", capacity),
        }
    }

    pub fn find(
        &self,
        id: ConglomerateId,
        registry: &ConglomerateRegistry,
        raw: &dyn RawStore,
    ) -> Result<Arc<dyn Conglomerate>, AccessError> {
        if id.is_temporary() {
            return Err(AccessError::not_found(ResourceType::Conglomerate, id));
        }
        self.cache
            .find(&id, |id| load_descriptor(*id, registry, raw))?
            .ok_or_else(|| AccessError::not_found(ResourceType::Conglomerate, id))
    }

    pub fn find_cached(&self, id: ConglomerateId) -> Result<Option<Arc<dyn Conglomerate>>, AccessError> {
        self.cache.find_cached(&id)
    }

    pub fn add_entry(&self, conglomerate: Arc<dyn Conglomerate>) -> Result<(), AccessError> {
        let id = conglomerate.id();
        if !self.cache.create(id, conglomerate)? {
            return Err(AccessError::AlreadyExists {
                resource_type: ResourceType::Conglomerate,
                resource_id: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn update_entry(&self, conglomerate: Arc<dyn Conglomerate>) -> Result<(), AccessError> {
        self.cache.replace(conglomerate.id(), conglomerate)
    }

    pub fn remove_entry(&self, id: ConglomerateId) -> Result<(), AccessError> {
        self.cache.remove(&id).map(|_| ())
    }

    pub fn invalidate_all(&self) -> Result<(), AccessError> {
        let dropped = self.cache.age_out()?;
        debug!(dropped, "conglomerate cache invalidated");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.cache.shutdown();
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

/// Reads a descriptor back from its container metadata. `Ok(None)` means no
/// such container exists.
fn load_descriptor(
    id: ConglomerateId,
    registry: &ConglomerateRegistry,
    raw: &dyn RawStore,
) -> Result<Option<Arc<dyn Conglomerate>>, AccessError> {
    let owner = registry.factory_for_id(id)?;
    let Some(metadata) = raw.container_metadata(id.persistent_container())? else {
        return Ok(None);
    };
    let (format, body) = decode_envelope(&metadata)?;
    let factory = registry.conglomerate_factory_by_format(&format)?;
    if factory.kind_tag() != owner.kind_tag() {
        return Err(AccessError::Corrupt(format!(
            "conglomerate {id} has kind tag {} but its descriptor format {format} belongs to '{}'",
            owner.kind_tag(),
            factory.primary_implementation_type()
        )));
    }
    let descriptor = factory.read_descriptor(&body)?;
    if descriptor.id() != id {
        return Err(AccessError::Corrupt(format!(
            "container for conglomerate {id} describes conglomerate {}",
            descriptor.id()
        )));
    }
    debug!(conglomerate = %id, implementation = descriptor.implementation_type(), "descriptor loaded");
    Ok(Some(descriptor))
}
