use crate::Asset;
use anyhow::Context;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use uuid::Uuid;

/// AssetStore is the backend from which assets are fetched.
#[async_trait::async_trait]
pub trait AssetStore: Send + Sync + 'static {
    /// Fetch asset `id`, returning None if the store has no such asset.
    async fn fetch(&self, id: Uuid) -> anyhow::Result<Option<Asset>>;
}

/// MemoryStore is an AssetStore of assets held in memory.
/// It counts the fetches made of it.
#[derive(Default)]
pub struct MemoryStore {
    assets: RwLock<HashMap<Uuid, Asset>>,
    fetches: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, asset: Asset) {
        self.assets.write().unwrap().insert(asset.id, asset);
    }

    /// Number of fetches which have been made of this store.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl AssetStore for MemoryStore {
    async fn fetch(&self, id: Uuid) -> anyhow::Result<Option<Asset>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.assets.read().unwrap().get(&id).cloned())
    }
}

/// DirectoryStore is an AssetStore of files beneath a root directory,
/// laid out as `{root}/{asset_type}/{asset_id}`, where `asset_type` is the
/// decimal type code and `asset_id` is in simple (unhyphenated) form.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path at which the asset `id` of type `asset_type` is stored.
    pub fn path_of(&self, asset_type: i8, id: Uuid) -> PathBuf {
        self.root
            .join(asset_type.to_string())
            .join(id.simple().to_string())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait::async_trait]
impl AssetStore for DirectoryStore {
    #[tracing::instrument(level = "debug", skip(self), fields(root = ?self.root))]
    async fn fetch(&self, id: Uuid) -> anyhow::Result<Option<Asset>> {
        let mut types = tokio::fs::read_dir(&self.root)
            .await
            .with_context(|| format!("failed to list asset directory {:?}", self.root))?;

        while let Some(entry) = types.next_entry().await? {
            let Some(asset_type) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i8>().ok())
            else {
                continue; // Not a type directory.
            };

            match tokio::fs::read(self.path_of(asset_type, id)).await {
                Ok(data) => {
                    return Ok(Some(Asset {
                        id,
                        asset_type,
                        data: data.into(),
                    }))
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to read asset {id}"));
                }
            }
        }

        Ok(None)
    }
}
