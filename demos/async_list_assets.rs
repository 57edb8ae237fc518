//! Stream assets page by page with the async `ApiClient`.
//!
//! Run:
//! `cargo run --example async_list_assets`
//!
//! Required env vars: `FUSION_PROJECT`, `FUSION_BASE_URL`, `FUSION_TOKEN`.
//!
//! Optional env vars:
//! - `FUSION_ASSET_LIMIT` (defaults to `25`)
//! - `RUST_LOG` (for example `fusion_client=debug`)

use fusion_client::{ApiClient, ClientConfig, Domain, ListRequest, ResourceEndpoint};
use futures::TryStreamExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let limit: usize = std::env::var("FUSION_ASSET_LIMIT")
        .unwrap_or_else(|_| "25".to_owned())
        .parse()?;

    let client = ApiClient::new(ClientConfig::from_env()?)?;
    let assets = ResourceEndpoint::new(Domain::General, "/assets");

    let mut chunks = client.list_chunks(&assets, ListRequest::post().with_limit(limit), 10);
    while let Some(chunk) = chunks.try_next().await? {
        for asset in &chunk {
            println!("{}", serde_json::to_string(asset)?);
        }
    }
    Ok(())
}
