#![allow(dead_code)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use peer_overlay::{Config, Node, NodeId};
use uuid::Uuid;

pub fn temp_root() -> PathBuf {
    std::env::temp_dir().join(format!("peer-overlay-it-{}", Uuid::new_v4()))
}

/// Loopback config with short timeouts.
pub fn test_config(root: &Path) -> Config {
    Config {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        shared_dir: root.join("shared"),
        download_dir: root.join("downloads"),
        probe_timeout: Duration::from_millis(500),
        request_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_millis(500),
        lookup_timeout: Duration::from_secs(3),
        bootstrap_retries: 1,
        bootstrap_backoff: Duration::from_millis(10),
        chunk_size: 1024,
        chunk_idle_timeout: Duration::from_secs(2),
        shutdown_grace: Duration::from_millis(500),
        ..Config::default()
    }
}

pub async fn start_node() -> Node {
    let root = temp_root();
    Node::bind(test_config(&root)).await.unwrap()
}

pub fn addr_of(node: &Node) -> String {
    node.local_contact().addr.to_string()
}

pub fn hex_id(node: &Node) -> String {
    node.node_id().to_hex()
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

pub async fn knows(node: &Node, id: NodeId) -> bool {
    node.get_routing_table().await.contains(&id)
}
