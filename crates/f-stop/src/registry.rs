use crate::capability::Capability;
use crate::negative_cache::{NegativeCache, DEFAULT_NEGATIVE_CACHE_TTL};
use crate::{Asset, AssetClass, AssetError, AssetStore, MESH_ASSET_TYPE, TEXTURE_ASSET_TYPE};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

/// Config of a CapabilityRegistry.
#[derive(Debug, Clone)]
pub struct Config {
    /// Shared secret which authorizes admin operations.
    pub admin_token: String,
    /// Declared asset types which may be served to texture requests.
    pub texture_types: Vec<i8>,
    /// Sliding lifetime of negative cache entries.
    pub negative_cache_ttl: Duration,
}

impl Config {
    pub fn new(admin_token: impl Into<String>) -> Self {
        Self {
            admin_token: admin_token.into(),
            texture_types: vec![TEXTURE_ASSET_TYPE],
            negative_cache_ttl: DEFAULT_NEGATIVE_CACHE_TTL,
        }
    }
}

/// CapabilityRegistry is the admin-token-gated directory of Capabilities.
/// It validates the types of served assets against per-class allow-lists,
/// and remembers assets of disallowed types in a NegativeCache.
pub struct CapabilityRegistry {
    // Lower-cased admin token, against which supplied tokens are compared.
    admin_token: String,
    texture_types: Arc<[i8]>,
    mesh_types: Arc<[i8]>,
    caps: RwLock<HashMap<Uuid, Arc<Capability>>>,
    negative_cache: NegativeCache,
    store: Option<Arc<dyn AssetStore>>,
}

impl CapabilityRegistry {
    pub fn new(config: Config, store: Option<Arc<dyn AssetStore>>) -> Self {
        let Config {
            admin_token,
            texture_types,
            negative_cache_ttl,
        } = config;

        Self {
            admin_token: admin_token.to_lowercase(),
            texture_types: texture_types.into(),
            mesh_types: Arc::from(vec![MESH_ASSET_TYPE]),
            caps: RwLock::new(HashMap::new()),
            negative_cache: NegativeCache::new(negative_cache_ttl),
            store,
        }
    }

    fn authorize(&self, admin_token: &str) -> Result<(), AssetError> {
        if admin_token.to_lowercase() == self.admin_token {
            Ok(())
        } else {
            tracing::warn!("rejected admin operation with an invalid token");
            Err(AssetError::InvalidAdminToken)
        }
    }

    /// Add a Capability. Returns false if `cap_id` already exists,
    /// in which case the existing Capability is unchanged.
    #[tracing::instrument(skip(self, admin_token), ret)]
    pub fn add_cap(
        &self,
        admin_token: &str,
        cap_id: Uuid,
        bandwidth_limit: u32,
    ) -> Result<bool, AssetError> {
        self.authorize(admin_token)?;

        let mut caps = self.caps.write().unwrap();
        if caps.contains_key(&cap_id) {
            return Ok(false);
        }
        caps.insert(
            cap_id,
            Arc::new(Capability::new(cap_id, bandwidth_limit, self.store.clone())),
        );
        Ok(true)
    }

    /// Remove and kill a Capability, refusing its queued requests.
    /// Returns false if `cap_id` is not known.
    #[tracing::instrument(skip(self, admin_token), ret)]
    pub fn remove_cap(&self, admin_token: &str, cap_id: Uuid) -> Result<bool, AssetError> {
        self.authorize(admin_token)?;

        let Some(cap) = self.caps.write().unwrap().remove(&cap_id) else {
            return Ok(false);
        };
        cap.kill();
        Ok(true)
    }

    /// Pause a Capability. Returns false if `cap_id` is not known.
    #[tracing::instrument(skip(self, admin_token), ret)]
    pub fn pause_cap(&self, admin_token: &str, cap_id: Uuid) -> Result<bool, AssetError> {
        self.authorize(admin_token)?;
        Ok(self.get(cap_id).map(|cap| cap.pause()).is_some())
    }

    /// Resume a Capability, dispatching its queued requests.
    /// Returns false if `cap_id` is not known.
    #[tracing::instrument(skip(self, admin_token), ret)]
    pub fn resume_cap(&self, admin_token: &str, cap_id: Uuid) -> Result<bool, AssetError> {
        self.authorize(admin_token)?;
        Ok(self.get(cap_id).map(|cap| cap.resume()).is_some())
    }

    /// Set the bandwidth limit of a Capability.
    /// Returns false if `cap_id` is not known.
    #[tracing::instrument(skip(self, admin_token), ret)]
    pub fn limit_cap(
        &self,
        admin_token: &str,
        cap_id: Uuid,
        bandwidth_limit: u32,
    ) -> Result<bool, AssetError> {
        self.authorize(admin_token)?;
        Ok(self
            .get(cap_id)
            .map(|cap| cap.set_bandwidth_limit(bandwidth_limit))
            .is_some())
    }

    pub fn get(&self, cap_id: Uuid) -> Option<Arc<Capability>> {
        self.caps.read().unwrap().get(&cap_id).cloned()
    }

    pub fn negative_cache(&self) -> &NegativeCache {
        &self.negative_cache
    }

    /// Request texture `asset_id` through Capability `cap_id`.
    pub async fn request_texture_asset(
        &self,
        cap_id: Uuid,
        asset_id: Uuid,
    ) -> Result<Asset, AssetError> {
        self.request_asset(AssetClass::Texture, cap_id, asset_id).await
    }

    /// Request mesh `asset_id` through Capability `cap_id`.
    pub async fn request_mesh_asset(
        &self,
        cap_id: Uuid,
        asset_id: Uuid,
    ) -> Result<Asset, AssetError> {
        self.request_asset(AssetClass::Mesh, cap_id, asset_id).await
    }

    /// Request `asset_id` of `class` through Capability `cap_id`.
    /// Assets of a type not allowed for `class` are refused, and are
    /// refused without consulting the store for a while thereafter.
    pub async fn request_asset(
        &self,
        class: AssetClass,
        cap_id: Uuid,
        asset_id: Uuid,
    ) -> Result<Asset, AssetError> {
        // The cache is keyed on the asset alone, because an asset's declared
        // type doesn't change. So an asset refused for one class is also refused
        // for the other until its entry expires, even where that class allows it.
        if self.negative_cache.contains(&asset_id) {
            tracing::warn!(
                %asset_id,
                %cap_id,
                hits = self.negative_cache.hits(),
                "refused request for an asset of a disallowed type"
            );
            return Err(AssetError::AssetTypeWrong(asset_id));
        }
        let Some(cap) = self.get(cap_id) else {
            return Err(AssetError::CapabilityIdUnknown(cap_id));
        };

        let allowed = match class {
            AssetClass::Texture => self.texture_types.clone(),
            AssetClass::Mesh => self.mesh_types.clone(),
        };
        let outcome = cap.request_asset(asset_id, allowed).await;

        if let Err(AssetError::AssetTypeWrong(_)) = &outcome {
            self.negative_cache.insert(asset_id);
        }
        outcome
    }

    /// Prune expired entries of the negative cache.
    pub fn prune_negative_cache(&self) -> usize {
        self.negative_cache.prune_expired()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::capability::State;
    use crate::MemoryStore;
    use bytes::Bytes;

    const TOKEN: &str = "Sekrit-Token";

    fn fixture(assets: &[(Uuid, i8)]) -> (CapabilityRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for (id, asset_type) in assets {
            store.insert(Asset {
                id: *id,
                asset_type: *asset_type,
                data: Bytes::from_static(b"twelve bytes"),
            });
        }
        let registry = CapabilityRegistry::new(Config::new(TOKEN), Some(store.clone()));
        (registry, store)
    }

    #[test]
    fn test_admin_token_is_case_insensitive() {
        let (registry, _) = fixture(&[]);
        let cap_id = Uuid::new_v4();

        assert!(matches!(
            registry.add_cap("wrong", cap_id, 0),
            Err(AssetError::InvalidAdminToken)
        ));
        assert!(registry.get(cap_id).is_none());

        assert_eq!(registry.add_cap("SEKRIT-TOKEN", cap_id, 0).unwrap(), true);
        assert_eq!(registry.pause_cap("sekrit-token", cap_id).unwrap(), true);
    }

    #[test]
    fn test_admin_operations() {
        let (registry, _) = fixture(&[]);
        let (cap_id, unknown) = (Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(registry.add_cap(TOKEN, cap_id, 100).unwrap(), true);
        registry.pause_cap(TOKEN, cap_id).unwrap();

        // Duplicate adds leave the existing Capability as it was.
        assert_eq!(registry.add_cap(TOKEN, cap_id, 0).unwrap(), false);
        let cap = registry.get(cap_id).unwrap();
        assert_eq!(cap.state(), State::Paused);
        assert_eq!(cap.bandwidth_limit(), 100);

        // Known ids succeed even if already in the target state.
        assert_eq!(registry.pause_cap(TOKEN, cap_id).unwrap(), true);
        assert_eq!(registry.resume_cap(TOKEN, cap_id).unwrap(), true);
        assert_eq!(registry.resume_cap(TOKEN, cap_id).unwrap(), true);
        assert_eq!(cap.state(), State::Active);

        assert_eq!(registry.limit_cap(TOKEN, cap_id, 512).unwrap(), true);
        assert_eq!(cap.bandwidth_limit(), 512);

        for result in [
            registry.pause_cap(TOKEN, unknown),
            registry.resume_cap(TOKEN, unknown),
            registry.limit_cap(TOKEN, unknown, 1),
            registry.remove_cap(TOKEN, unknown),
        ] {
            assert_eq!(result.unwrap(), false);
        }

        assert_eq!(registry.remove_cap(TOKEN, cap_id).unwrap(), true);
        assert_eq!(cap.state(), State::Killed);
        assert!(registry.get(cap_id).is_none());
        assert_eq!(registry.remove_cap(TOKEN, cap_id).unwrap(), false);
    }

    #[tokio::test]
    async fn test_requests() {
        let (texture, mesh) = (Uuid::new_v4(), Uuid::new_v4());
        let (registry, _) = fixture(&[(texture, 0), (mesh, 49)]);
        let cap_id = Uuid::new_v4();

        let err = registry.request_texture_asset(cap_id, texture).await.unwrap_err();
        assert!(matches!(err, AssetError::CapabilityIdUnknown(id) if id == cap_id));

        registry.add_cap(TOKEN, cap_id, 0).unwrap();

        let asset = registry.request_texture_asset(cap_id, texture).await.unwrap();
        assert_eq!(asset.id, texture);
        let asset = registry.request_mesh_asset(cap_id, mesh).await.unwrap();
        assert_eq!(asset.id, mesh);

        let missing = Uuid::new_v4();
        let err = registry.request_mesh_asset(cap_id, missing).await.unwrap_err();
        assert!(matches!(err, AssetError::AssetIdUnknown(id) if id == missing));
        assert!(registry.negative_cache().is_empty());
    }

    #[tokio::test]
    async fn test_disallowed_types_are_negatively_cached() {
        let texture = Uuid::new_v4();
        let (registry, store) = fixture(&[(texture, 0)]);
        let cap_id = Uuid::new_v4();
        registry.add_cap(TOKEN, cap_id, 0).unwrap();

        for _ in 0..2 {
            let err = registry.request_mesh_asset(cap_id, texture).await.unwrap_err();
            assert!(matches!(err, AssetError::AssetTypeWrong(id) if id == texture));
        }
        assert_eq!(store.fetches(), 1);
        assert_eq!(registry.negative_cache().hits(), 1);

        // The cache is keyed on the asset alone, regardless of class or capability.
        let err = registry.request_texture_asset(Uuid::new_v4(), texture).await.unwrap_err();
        assert!(matches!(err, AssetError::AssetTypeWrong(_)));
        assert_eq!(store.fetches(), 1);
    }

    #[tokio::test]
    async fn test_configured_texture_types() {
        let (jpeg, tga) = (Uuid::new_v4(), Uuid::new_v4());
        let store = Arc::new(MemoryStore::new());
        for (id, asset_type) in [(jpeg, 19), (tga, 12)] {
            store.insert(Asset {
                id,
                asset_type,
                data: Bytes::new(),
            });
        }
        let mut config = Config::new(TOKEN);
        config.texture_types = vec![0, 19];
        let registry = CapabilityRegistry::new(config, Some(store));

        let cap_id = Uuid::new_v4();
        registry.add_cap(TOKEN, cap_id, 0).unwrap();

        assert!(registry.request_texture_asset(cap_id, jpeg).await.is_ok());
        assert!(matches!(
            registry.request_texture_asset(cap_id, tga).await,
            Err(AssetError::AssetTypeWrong(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_cache_entries_are_pruned() {
        let texture = Uuid::new_v4();
        let (registry, store) = fixture(&[(texture, 0)]);
        let cap_id = Uuid::new_v4();
        registry.add_cap(TOKEN, cap_id, 0).unwrap();

        assert!(registry.request_mesh_asset(cap_id, texture).await.is_err());
        assert_eq!(registry.negative_cache().len(), 1);

        tokio::time::advance(DEFAULT_NEGATIVE_CACHE_TTL + Duration::from_secs(1)).await;
        assert_eq!(registry.prune_negative_cache(), 1);

        assert!(registry.request_mesh_asset(cap_id, texture).await.is_err());
        assert_eq!(store.fetches(), 2);
    }
}
