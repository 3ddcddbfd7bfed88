//! Generated script workspace and retention sweeper

use crate::config::{DaemonConfig, RetentionPolicy};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use testrig_common::{Result, ToolFamily};
use tokio::fs;
use tracing::{debug, error, info, warn};

const SCRIPT_EXTENSION: &str = "js";

/// Directory of per-test scripts
#[derive(Debug, Clone)]
pub struct ScriptWorkspace {
    dir: PathBuf,
    retention: RetentionPolicy,
}

impl ScriptWorkspace {
    pub fn new(dir: impl Into<PathBuf>, retention: RetentionPolicy) -> Self {
        Self {
            dir: dir.into(),
            retention,
        }
    }

    pub fn from_config(config: &DaemonConfig) -> Self {
        Self::new(config.scripts_dir(), config.scripts.retention)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Path of a test's script: `<family>-<escaped id>.js`
    pub fn script_path(&self, family: ToolFamily, test_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}-{}.{}", family, escape_id(test_id), SCRIPT_EXTENSION))
    }

    /// Write a test's script, creating the directory if needed
    pub async fn write(&self, family: ToolFamily, test_id: &str, contents: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.script_path(family, test_id);
        fs::write(&path, contents).await?;
        debug!("Wrote script {:?}", path);
        Ok(path)
    }

    /// Called when the run that used `path` is over
    pub async fn release(&self, path: &Path) {
        match self.retention {
            RetentionPolicy::DeleteOnCompletion => {
                if let Err(e) = fs::remove_file(path).await {
                    warn!("Failed to remove script {:?}: {}", path, e);
                }
            }
            RetentionPolicy::RetainForSecs(secs) => {
                debug!("Keeping script {:?} for {}s", path, secs);
            }
        }
    }

    /// Remove scripts past their retention. Returns how many were removed.
    pub async fn sweep(&self) -> Result<usize> {
        let RetentionPolicy::RetainForSecs(secs) = self.retention else {
            return Ok(0);
        };
        if !fs::try_exists(&self.dir).await? {
            return Ok(0);
        }

        let keep_for = Duration::from_secs(secs);
        let now = SystemTime::now();
        let mut removed = 0;

        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SCRIPT_EXTENSION) {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age < keep_for {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove expired script {:?}: {}", path, e),
            }
        }

        Ok(removed)
    }
}

/// Escape a test id into a file name stem.
///
/// ASCII alphanumerics and `-` pass through; every other byte becomes `_XX`
/// (upper-case hex). `_` is always an escape, so distinct ids never collide.
fn escape_id(test_id: &str) -> String {
    let mut escaped = String::with_capacity(test_id.len());
    for byte in test_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("_{:02X}", byte));
        }
    }
    escaped
}

/// Periodically removes expired scripts
pub struct ScriptSweeper {
    workspace: ScriptWorkspace,
    interval: Duration,
}

impl ScriptSweeper {
    pub fn new(workspace: ScriptWorkspace, interval: Duration) -> Self {
        Self {
            workspace,
            interval,
        }
    }

    /// Run the sweep loop
    pub async fn run(&self) {
        info!("Script sweeper started for {:?}", self.workspace.dir());

        loop {
            match self.workspace.sweep().await {
                Ok(0) => debug!("No expired scripts"),
                Ok(n) => info!("Removed {} expired script(s)", n),
                Err(e) => error!("Script sweep error: {}", e),
            }

            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_on_completion() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = ScriptWorkspace::new(dir.path().join("scripts"), RetentionPolicy::DeleteOnCompletion);

        let path = workspace
            .write(ToolFamily::K6, "run/1", "export default function () {}")
            .await
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "k6-run_2F1.js");
        assert!(path.exists());

        workspace.release(&path).await;
        assert!(!path.exists());
        assert_eq!(workspace.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retained_until_swept() {
        let dir = tempfile::tempdir().unwrap();
        let keep = ScriptWorkspace::new(dir.path(), RetentionPolicy::RetainForSecs(3600));
        let path = keep.write(ToolFamily::Playwright, "t1", "// script").await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a script").unwrap();

        keep.release(&path).await;
        assert!(path.exists());
        assert_eq!(keep.sweep().await.unwrap(), 0);

        let expire = ScriptWorkspace::new(dir.path(), RetentionPolicy::RetainForSecs(0));
        assert_eq!(expire.sweep().await.unwrap(), 1);
        assert!(!path.exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_sweep_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = ScriptWorkspace::new(dir.path().join("absent"), RetentionPolicy::RetainForSecs(0));
        assert_eq!(workspace.sweep().await.unwrap(), 0);
    }

    #[test]
    fn test_script_paths_never_collide() {
        let workspace = ScriptWorkspace::new("/scripts", RetentionPolicy::DeleteOnCompletion);
        let slash = workspace.script_path(ToolFamily::K6, "a/b");
        let underscore = workspace.script_path(ToolFamily::K6, "a_b");
        let dot = workspace.script_path(ToolFamily::K6, "a.b");
        assert_ne!(slash, underscore);
        assert_ne!(underscore, dot);
        assert_eq!(underscore, PathBuf::from("/scripts/k6-a_5Fb.js"));

        // Same id, different tools
        assert_ne!(
            workspace.script_path(ToolFamily::K6, "run-1"),
            workspace.script_path(ToolFamily::Playwright, "run-1")
        );
        assert_eq!(
            workspace.script_path(ToolFamily::Playwright, "run-1"),
            PathBuf::from("/scripts/playwright-run-1.js")
        );
    }
}
