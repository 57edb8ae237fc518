//! Retrieve assets by external id with the `BlockingApiClient`.
//!
//! Run:
//! `cargo run --example blocking_retrieve_assets -- pump-1 pump-2`
//!
//! Required env vars: `FUSION_PROJECT`, `FUSION_BASE_URL`, `FUSION_TOKEN`.

use fusion_client::{
    BlockingApiClient, ClientConfig, Domain, IdentifierSequence, ResourceEndpoint, RetrieveOptions,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let external_ids: Vec<String> = std::env::args().skip(1).collect();
    let external_ids: Vec<&str> = external_ids.iter().map(String::as_str).collect();
    if external_ids.is_empty() {
        return Err("pass at least one external id".into());
    }

    let client = BlockingApiClient::new(ClientConfig::from_env()?)?;
    let assets = ResourceEndpoint::new(Domain::General, "/assets");
    let options = RetrieveOptions {
        ignore_unknown_ids: true,
        ..RetrieveOptions::default()
    };

    let ids = IdentifierSequence::load(&[], &external_ids);
    let found = client.retrieve_multiple(&assets, &ids, options)?;
    println!("{}", serde_json::to_string_pretty(&found.into_items())?);
    Ok(())
}
