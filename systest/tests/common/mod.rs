//! Fixtures shared by the end-to-end suites.

#![allow(dead_code)]

use std::net::TcpListener;
use std::path::PathBuf;
use std::time::Duration;

use systest::{SystemConfig, SystemUnderTest};
use tempfile::TempDir;

pub const MOCK_BLOCK_TIME: Duration = Duration::from_millis(200);

pub fn mock_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mock-chaind"))
}

/// First of `count` consecutive loopback ports that are free right now.
pub fn free_port_base(count: u16) -> u16 {
    for _ in 0..50 {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
        let base = listener.local_addr().expect("local addr").port();
        drop(listener);
        if base.checked_add(count).is_none() {
            continue;
        }
        let all_free = (0..count).all(|i| TcpListener::bind(("127.0.0.1", base + i)).is_ok());
        if all_free {
            return base;
        }
    }
    panic!("no run of {count} free ports found");
}

/// A mock-chaind cluster in its own temp dir, already set up.
///
/// `sut` is declared first so the nodes are stopped before the dir goes.
pub struct MockCluster {
    pub sut: SystemUnderTest,
    pub dir: TempDir,
}

pub fn mock_cluster(test_name: &str, nodes: usize) -> MockCluster {
    let dir = TempDir::new().expect("temp dir");
    let config = SystemConfig::builder()
        .binary(mock_binary())
        .output_dir(dir.path().join("testnet"))
        .node_count(nodes)
        .block_time(MOCK_BLOCK_TIME)
        .rpc_base_port(free_port_base(nodes as u16))
        .rpc_port_stride(1u16)
        .startup_timeout(Duration::from_secs(20))
        .command_timeout(Duration::from_secs(20))
        .build()
        .expect("valid config");
    let mut sut = SystemUnderTest::new(test_name, config);
    sut.setup_chain().expect("setup chain");
    MockCluster { sut, dir }
}
