use anyhow::Context;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;

mod asset;
mod error;
mod negative_cache;
mod request;
mod store;

pub mod api;
pub mod assemble;
pub mod capability;
pub mod registry;

pub use asset::{Asset, AssetClass, MESH_ASSET_TYPE, TEXTURE_ASSET_TYPE};
pub use capability::Capability;
pub use error::AssetError;
pub use negative_cache::{NegativeCache, DEFAULT_NEGATIVE_CACHE_TTL};
pub use registry::CapabilityRegistry;
pub use request::{AssetRequest, Outcome, Pending, ResolveError};
pub use store::{AssetStore, DirectoryStore, MemoryStore};

/// f-stop is an HTTP gateway which serves textures and meshes of an asset
/// store to holders of capabilities, with support for byte-range requests.
/// It serves plain HTTP, and expects TLS to be terminated in front of it.
#[derive(clap::Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Address to bind the HTTP server to. `*` binds all interfaces.
    #[clap(long, env = "ADDRESS", default_value = "0.0.0.0")]
    pub address: String,
    /// Port to bind the HTTP server to.
    #[clap(long, env = "PORT", default_value = "8000")]
    pub port: u16,
    /// Secret which authorizes admin operations. Compared case-insensitively.
    #[clap(long, env = "ADMIN_TOKEN", hide_env_values = true)]
    pub admin_token: String,
    /// Declared asset types which may be served to texture requests.
    #[clap(
        long,
        env = "ALLOWED_TEXTURE_TYPES",
        value_delimiter = ',',
        default_value = "0",
        allow_hyphen_values = true
    )]
    pub allowed_texture_types: Vec<i8>,
    /// Duration for which requests of assets of disallowed types are refused
    /// without consulting the asset store, extended with each refusal.
    #[clap(long, env = "NEGATIVE_CACHE_TTL", default_value = "120s", value_parser = humantime::parse_duration)]
    pub negative_cache_ttl: Duration,
    /// Maximum number of byte ranges served of a single request.
    #[clap(long, env = "MAX_RANGES", default_value_t = byte_ranges::DEFAULT_MAX_RANGES)]
    pub max_ranges: usize,
    /// Directory of assets, laid out as `{asset-dir}/{type}/{asset-id}`.
    /// If not set, asset requests fail as misconfigured.
    #[clap(long, env = "ASSET_DIR")]
    pub asset_dir: Option<std::path::PathBuf>,
    /// Log as JSON rather than as human-readable text.
    #[clap(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Args {
    /// Socket address which the server binds.
    pub fn bind_address(&self) -> String {
        let address = match self.address.as_str() {
            "*" => "0.0.0.0",
            address => address,
        };
        if address.contains(':') {
            format!("[{address}]:{}", self.port) // IPv6.
        } else {
            format!("{address}:{}", self.port)
        }
    }
}

/// Build the App which serves `args` from `store`.
pub fn build_app(args: &Args, store: Option<Arc<dyn AssetStore>>) -> api::App {
    let config = registry::Config {
        admin_token: args.admin_token.clone(),
        texture_types: args.allowed_texture_types.clone(),
        negative_cache_ttl: args.negative_cache_ttl,
    };
    api::App {
        registry: CapabilityRegistry::new(config, store),
        max_ranges: args.max_ranges,
    }
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    tracing::info!(
        address = %args.address,
        port = args.port,
        allowed_texture_types = ?args.allowed_texture_types,
        negative_cache_ttl = ?args.negative_cache_ttl,
        max_ranges = args.max_ranges,
        asset_dir = ?args.asset_dir,
        "starting f-stop"
    );

    let store: Option<Arc<dyn AssetStore>> = match &args.asset_dir {
        Some(dir) => {
            let meta = tokio::fs::metadata(dir)
                .await
                .with_context(|| format!("failed to inspect asset directory {dir:?}"))?;
            anyhow::ensure!(meta.is_dir(), "asset directory {dir:?} is not a directory");
            let store = DirectoryStore::new(dir);
            tracing::info!(root = ?store.root(), "serving assets from directory");
            Some(Arc::new(store))
        }
        None => {
            tracing::warn!("no asset directory is configured; asset requests will fail");
            None
        }
    };

    let app = Arc::new(build_app(&args, store));
    let router = api::build_router(app.clone());

    // Periodically prune the negative cache, so it doesn't grow without bound.
    let pruner = tokio::spawn({
        let app = app.clone();
        let period = app.registry.negative_cache().ttl().max(Duration::from_secs(1));

        async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                app.registry.prune_negative_cache();
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(args.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", args.bind_address()))?;

    tracing::info!(address = %args.bind_address(), "f-stop listening");

    let shutdown = tokio::signal::ctrl_c().map(|_| ()).shared();

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("serving HTTP")?;

    pruner.abort();
    tracing::info!("f-stop stopped");

    Ok(())
}
