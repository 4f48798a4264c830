//! On-disk snapshot of the node id and the reachable routing table.

use std::collections::HashMap;
use std::path::PathBuf;
use std::{env, fs};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Result;

/// What survives a restart: our id, the bound port and the reachable remotes
/// (canonical "ip:port" mapped to the 20 byte node id).
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct DhtStore {
    #[serde(default)]
    pub id: Vec<u8>,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub remotes: HashMap<String, Vec<u8>>,

    #[serde(skip)]
    path: Option<PathBuf>,
}

/// Read the snapshot for `port`, or an empty one when there is none or
/// persistence is disabled.
pub(crate) fn open(port: u16, enabled: bool) -> DhtStore {
    if !enabled {
        return DhtStore::default();
    }
    let path = store_path(port);
    let mut store: DhtStore = fs::read(&path)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_default();
    store.path = Some(path);
    store
}

/// Atomically rewrite the snapshot: write a sibling file, then rename it
/// over the old one.
pub(crate) fn save(store: &DhtStore) -> Result<()> {
    let Some(path) = &store.path else {
        return Ok(());
    };
    let bytes = serde_json::to_vec(store)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, path)?;
    debug!(?path, remotes = store.remotes.len(), "saved routing table snapshot");
    Ok(())
}

fn store_path(port: u16) -> PathBuf {
    env::temp_dir().join(format!("dht-{port}.json"))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::Id;

    #[test]
    fn snapshot_round_trip() {
        // An improbable port keeps this isolated from real nodes.
        let port = 64999;
        let _ = fs::remove_file(store_path(port));

        let mut store = open(port, true);
        assert!(store.id.is_empty());

        let id = Id::random();
        store.id = id.to_vec();
        store.port = port;
        store
            .remotes
            .insert("127.0.0.1:6881".to_string(), Id::random().to_vec());
        save(&store).unwrap();

        let reloaded = open(port, true);
        assert_eq!(reloaded.id, id.to_vec());
        assert_eq!(reloaded.port, port);
        assert_eq!(reloaded.remotes.len(), 1);

        let _ = fs::remove_file(store_path(port));
    }

    #[test]
    fn disabled_store_never_touches_disk() {
        let store = open(64998, false);
        assert!(store.path.is_none());
        save(&store).unwrap();
        assert!(!store_path(64998).exists());
    }
}
