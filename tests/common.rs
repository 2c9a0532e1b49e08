//! Test utilities & fixtures shared by the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use tagtrack::config::{LinkSettings, StorageConfig};
use tagtrack::link::{Channel, StaticResolver};
use tagtrack::protocol::Role;
use tagtrack::storage::Storage;
use tagtrack::tag::TagId;

pub const BOARD_NAME: &str = "TAGTRACK-BOARD";

/// Short timeouts so timeout paths finish quickly.
pub fn fast_settings(port: u16) -> LinkSettings {
    LinkSettings {
        device_name: "tagtrack".to_string(),
        service_port: port,
        connect_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_millis(300),
        poll_timeout: Duration::from_millis(1),
        settle_delay: Duration::from_millis(10),
    }
}

pub fn channel(role: Role, settings: LinkSettings) -> Arc<Channel> {
    let resolver = StaticResolver::new("127.0.0.1").with_peer(BOARD_NAME, "127.0.0.1");
    Arc::new(Channel::new(role, settings, Arc::new(resolver)))
}

/// A controller/board pair joined by an in-memory stream.
pub async fn attached_pair(settings: LinkSettings) -> (Arc<Channel>, Arc<Channel>) {
    let controller = channel(Role::Controller, settings.clone());
    let board = channel(Role::Board, settings);
    let (a, b) = tokio::io::duplex(4096);
    controller.attach(a).await.unwrap();
    board.attach(b).await.unwrap();
    (controller, board)
}

/// A port nothing is listening on right now.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn storage_config(dir: &TempDir) -> StorageConfig {
    StorageConfig {
        data_dir: dir.path().to_string_lossy().into_owned(),
        lookup_file: "lookup_table.json".into(),
        activity_file: "activity_table.json".into(),
    }
}

/// Fresh stores with `bindings` already registered.
pub fn storage_with(dir: &TempDir, bindings: &[(&str, &str)]) -> Storage {
    let mut storage = Storage::open(&storage_config(dir)).unwrap();
    for (uid, label) in bindings {
        storage.lookup.set(tag(uid), *label);
    }
    storage.lookup.persist().unwrap();
    storage
}

pub fn tag(uid: &str) -> TagId {
    TagId::parse(uid).unwrap()
}
