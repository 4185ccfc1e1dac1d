//! Test cluster management.
//!
//! Spawns an otpd instance (all four services in one process) with a
//! generated config, and tears it down with its data directory.

#![allow(dead_code)]

use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;
use tokio::time::sleep;

/// Version and schema-hash gate used by every test config.
pub const TEST_VERSION: &str = "test-server";
pub const TEST_HASH: u32 = 1234;

pub struct TestCluster {
    child: Child,
    md_port: u16,
    ca_port: u16,
    data_dir: PathBuf,
}

impl TestCluster {
    /// Spawn a cluster using `base_port` for the director and
    /// `base_port + 1` for the client agent.
    pub async fn spawn(base_port: u16) -> anyhow::Result<Self> {
        let md_port = base_port;
        let ca_port = base_port + 1;

        let data_dir = std::env::temp_dir().join(format!("otpd-test-{base_port}"));
        // A previous crashed run may have left state behind.
        let _ = std::fs::remove_dir_all(&data_dir);
        std::fs::create_dir_all(&data_dir)?;

        let config_path = data_dir.join("config.toml");
        let config_content = format!(
            r#"
[messagedirector]
address = "127.0.0.1:{md_port}"

[clientagent]
address = "127.0.0.1:{ca_port}"
connect-address = "127.0.0.1:{md_port}"
version = "{TEST_VERSION}"
hash-val = {TEST_HASH}
interest-timeout = 1.0
dbm-filename = "{data}/accounts.json"
dna-directory = "{data}/dna"

[stateserver]
connect-address = "127.0.0.1:{md_port}"

[database]
connect-address = "127.0.0.1:{md_port}"
directory = "{data}/objects"
"#,
            data = data_dir.display(),
        );
        std::fs::write(&config_path, config_content)?;
        std::fs::create_dir_all(data_dir.join("dna"))?;

        // Workspace target dir, next to this package's manifest.
        let cargo_manifest_dir = env!("CARGO_MANIFEST_DIR");
        let binary_path = PathBuf::from(cargo_manifest_dir).join("target/debug/otpd");

        let child = Command::new(&binary_path)
            .arg("-c")
            .arg(config_path.to_str().unwrap())
            .spawn()?;

        let cluster = Self { child, md_port, ca_port, data_dir };
        cluster.wait_until_ready().await?;
        Ok(cluster)
    }

    /// Wait until the client agent is accepting connections.
    async fn wait_until_ready(&self) -> anyhow::Result<()> {
        for _ in 0..50 {
            if tokio::net::TcpStream::connect(("127.0.0.1", self.ca_port)).await.is_ok() {
                return Ok(());
            }
            sleep(Duration::from_millis(100)).await;
        }
        anyhow::bail!("Cluster failed to start within 5 seconds")
    }

    pub fn client_address(&self) -> String {
        format!("127.0.0.1:{}", self.ca_port)
    }

    pub fn director_address(&self) -> String {
        format!("127.0.0.1:{}", self.md_port)
    }

    /// The client agent's persistent token store.
    pub fn token_store_path(&self) -> PathBuf {
        self.data_dir.join("accounts.json")
    }

    /// Write a street branch's visibility file.
    pub fn write_visibility(&self, branch: u32, content: &str) -> anyhow::Result<()> {
        std::fs::write(self.data_dir.join("dna").join(format!("{branch}.toml")), content)?;
        Ok(())
    }

    /// Connect a game client to the agent.
    pub async fn connect(&self) -> anyhow::Result<super::client::TestClient> {
        super::client::TestClient::connect(&self.client_address()).await
    }

    /// Connect an AI peer straight to the director.
    pub async fn connect_peer(&self, channel: u64) -> anyhow::Result<super::client::TestPeer> {
        super::client::TestPeer::connect(&self.director_address(), channel).await
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.data_dir);
    }
}
