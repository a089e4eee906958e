use bytes::Bytes;
use uuid::Uuid;

/// Declared type code of mesh assets. Meshes are served only if their
/// declared type is exactly this code.
pub const MESH_ASSET_TYPE: i8 = 49;

/// Declared type code of JPEG-2000 texture assets, which is the default
/// allow-list of texture requests.
pub const TEXTURE_ASSET_TYPE: i8 = 0;

/// Asset is the content and declared type of an asset, as fetched from an
/// AssetStore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub id: Uuid,
    pub asset_type: i8,
    pub data: Bytes,
}

/// AssetClass is the kind of asset a client requests, which determines the
/// declared types it may be served and how its content type is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetClass {
    Texture,
    Mesh,
}
