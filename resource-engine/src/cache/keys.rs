use crate::repository::PageRequest;
use crate::specification::Specification;

/// Cache key layout
///
/// Every key starts with `{Entity}:` so that eviction for one entity type can
/// be scoped by prefix without touching any other type.
pub struct CacheKeys;

impl CacheKeys {
    /// `{Entity}:id:{id}`
    pub fn entity(entity: &str, id: impl std::fmt::Display) -> String {
        format!("{}:id:{}", entity, id)
    }

    /// `{Entity}:list:page{n}:size{s}:sort-{..}:filter-{hash}`
    pub fn list(entity: &str, spec: &Specification, page: &PageRequest) -> String {
        format!(
            "{}:list:{}:filter-{}",
            entity,
            page.cache_discriminator(),
            spec.fingerprint()
        )
    }

    /// `{Entity}:count:filter-{hash}`
    pub fn count(entity: &str, spec: &Specification) -> String {
        format!("{}:count:filter-{}", entity, spec.fingerprint())
    }

    /// Prefix shared by every key of one entity type
    pub fn prefix(entity: &str) -> String {
        format!("{}:", entity)
    }
}
