//! `beacon id`: show the anonymous id for this device.

use anyhow::Result;
use beacon::config::{BeaconConfig, IdentityStoreKind};
use beacon::identity::{FileStore, IdentityResolver, KeyValueStore, MemoryStore};
use std::sync::Arc;

pub fn cmd_id(config: &BeaconConfig) -> Result<()> {
    let (store, location): (Arc<dyn KeyValueStore>, String) = match config.identity_store() {
        IdentityStoreKind::File => {
            let path = config.storage_path();
            let location = path.display().to_string();
            (Arc::new(FileStore::new(path)), location)
        }
        IdentityStoreKind::Memory => (Arc::new(MemoryStore::new()), "memory".to_string()),
    };

    let resolver = IdentityResolver::new(store);
    println!("{}", resolver.anonymous_id());
    println!("  source: {}", resolver.source());
    println!("  store:  {}", location);
    Ok(())
}
