//! Per-bridge config sandbox (C1): an isolated scratch directory for agent
//! configuration files, never the caller's project tree.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{BridgeError, Result};

/// Owns a `mode 0700` temp directory for one bridge instance's config files.
/// `cleanup()` is idempotent; `Drop` is a synchronous best-effort fallback
/// for the case where `stop()` was skipped (e.g. the process was killed).
pub struct ConfigSandbox {
    dir: PathBuf,
}

impl ConfigSandbox {
    pub fn create(prefix: &str) -> Result<Self> {
        let unique = format!("{:x}", Uuid::new_v4().as_u128() as u32);
        let dir = std::env::temp_dir().join(format!("{prefix}-{unique}"));
        std::fs::create_dir_all(&dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn write_json(&self, filename: &str, value: &serde_json::Value) -> Result<PathBuf> {
        let path = self.dir.join(filename);
        let text = serde_json::to_string_pretty(value)?;
        std::fs::write(&path, text)?;
        Ok(path)
    }

    pub fn write_text(&self, filename: &str, text: &str) -> Result<PathBuf> {
        let path = self.dir.join(filename);
        std::fs::write(&path, text)?;
        Ok(path)
    }

    pub fn mcp_servers_config(
        &self,
        servers: &[(String, String, Vec<String>)],
    ) -> Result<PathBuf> {
        let mut map = serde_json::Map::new();
        for (name, command, args) in servers {
            map.insert(
                name.clone(),
                serde_json::json!({ "command": command, "args": args }),
            );
        }
        self.write_json(
            "mcp_servers.json",
            &serde_json::json!({ "mcpServers": map }),
        )
    }

    /// Recursively removes the sandbox directory. Safe to call more than
    /// once and safe to call during shutdown.
    pub async fn cleanup(&self) -> Result<()> {
        if !self.dir.exists() {
            return Ok(());
        }
        tokio::fs::remove_dir_all(&self.dir)
            .await
            .or_else(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(e)
                }
            })
            .map_err(|e| BridgeError::FileSystem(format!("sandbox cleanup failed: {e}")))
    }
}

impl Drop for ConfigSandbox {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_mode_0700_directory() {
        let sandbox = ConfigSandbox::create("test-sandbox").unwrap();
        assert!(sandbox.path().is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(sandbox.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let sandbox = ConfigSandbox::create("test-sandbox").unwrap();
        sandbox.write_text("system.md", "hello").unwrap();
        sandbox.cleanup().await.unwrap();
        assert!(!sandbox.path().exists());
        sandbox.cleanup().await.unwrap();
    }

    #[test]
    fn writes_mcp_servers_config() {
        let sandbox = ConfigSandbox::create("test-sandbox").unwrap();
        let path = sandbox
            .mcp_servers_config(&[("fs".into(), "mcp-fs".into(), vec!["--root".into(), "/tmp".into()])])
            .unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("mcpServers"));
        assert!(content.contains("mcp-fs"));
    }
}
