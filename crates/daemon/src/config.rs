//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use testrig_common::{Error, ToolFamily};

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Long-lived tool process supervision
    pub process: ProcessConfig,

    /// Tool binaries and server entry points
    pub tools: ToolsConfig,

    /// Generated script handling
    pub scripts: ScriptsConfig,

    /// Test execution defaults
    pub execution: ExecutionConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: testrig_common::default_store_path(),
            process: ProcessConfig::default(),
            tools: ToolsConfig::default(),
            scripts: ScriptsConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}

/// Process supervision configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Seconds between health checks of a server process
    pub health_check_interval_secs: u64,

    /// Automatic restarts allowed per server before it is given up on
    pub max_restarts: u32,

    /// Seconds to wait for a response to one command
    pub call_timeout_secs: u64,

    /// Seconds to wait for the ready marker after spawn
    pub startup_timeout_secs: u64,

    /// Seconds between SIGTERM and SIGKILL
    pub stop_grace_secs: u64,

    /// Mark a server unhealthy after this many seconds without output
    pub inactivity_threshold_secs: Option<u64>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            max_restarts: 3,
            call_timeout_secs: 600,
            startup_timeout_secs: 10,
            stop_grace_secs: 5,
            inactivity_threshold_secs: None,
        }
    }
}

impl ProcessConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn inactivity_threshold(&self) -> Option<Duration> {
        self.inactivity_threshold_secs.map(Duration::from_secs)
    }
}

/// Tool configuration for all families
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Directory holding one sub-directory per tool server
    pub servers_dir: PathBuf,

    pub k6: ToolConfig,
    pub lighthouse: ToolConfig,
    pub playwright: ToolConfig,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            servers_dir: PathBuf::from("mcp"),
            k6: ToolConfig {
                binary: "k6".to_string(),
                server_command: "python3".to_string(),
                server_dir: "k6-mcp-server".to_string(),
                server_script: "k6_server.py".to_string(),
                env: BTreeMap::from([("K6_BIN".to_string(), "k6".to_string())]),
                direct: true,
            },
            lighthouse: ToolConfig {
                binary: "lighthouse".to_string(),
                server_command: "node".to_string(),
                server_dir: "lighthouse-mcp-server".to_string(),
                server_script: "lighthouse_server.js".to_string(),
                env: BTreeMap::from([(
                    "LIGHTHOUSE_BIN".to_string(),
                    "npx lighthouse".to_string(),
                )]),
                direct: false,
            },
            playwright: ToolConfig {
                binary: "node".to_string(),
                server_command: "node".to_string(),
                server_dir: "playwright-mcp-server".to_string(),
                server_script: "playwright_server.js".to_string(),
                env: BTreeMap::from([(
                    "PLAYWRIGHT_BIN".to_string(),
                    "npx playwright".to_string(),
                )]),
                direct: true,
            },
        }
    }
}

impl ToolsConfig {
    /// Configuration of one tool family
    pub fn for_family(&self, family: ToolFamily) -> &ToolConfig {
        match family {
            ToolFamily::K6 => &self.k6,
            ToolFamily::Lighthouse => &self.lighthouse,
            ToolFamily::Playwright => &self.playwright,
        }
    }

    /// Working directory of a family's tool server
    pub fn server_dir(&self, family: ToolFamily) -> PathBuf {
        self.servers_dir.join(&self.for_family(family).server_dir)
    }

    /// Entry point script of a family's tool server
    pub fn server_script_path(&self, family: ToolFamily) -> PathBuf {
        self.server_dir(family)
            .join(&self.for_family(family).server_script)
    }
}

/// Per-tool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Tool binary used when spawning the tool directly
    pub binary: String,

    /// Interpreter running the tool server script
    pub server_command: String,

    /// Server directory, relative to `servers_dir`
    pub server_dir: String,

    /// Server entry point inside `server_dir`
    pub server_script: String,

    /// Extra environment for the server process
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Spawn the tool itself instead of going through its server
    #[serde(default)]
    pub direct: bool,
}

/// What happens to a generated script once its run ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Remove the script as soon as the run is over
    DeleteOnCompletion,
    /// Keep the script for inspection; the sweeper removes it afterwards
    RetainForSecs(u64),
}

/// Generated script configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptsConfig {
    /// Script directory (defaults to `<store>/scripts`)
    pub dir: Option<PathBuf>,

    pub retention: RetentionPolicy,

    /// Seconds between sweeper passes
    pub sweep_interval_secs: u64,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            retention: RetentionPolicy::RetainForSecs(3600),
            sweep_interval_secs: 300,
        }
    }
}

impl ScriptsConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Seconds a test may run before it is failed
    pub default_timeout_secs: u64,

    /// Refuse a second concurrent audit of the same URL
    pub reject_duplicate_audits: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 600,
            reject_duplicate_audits: true,
        }
    }
}

impl ExecutionConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject settings no run could work with
    pub fn validate(&self) -> testrig_common::Result<()> {
        let zero = |field: &str| Error::InvalidConfig(format!("{} must be greater than zero", field));

        if self.execution.default_timeout_secs == 0 {
            return Err(zero("execution.default_timeout_secs"));
        }
        if self.process.call_timeout_secs == 0 {
            return Err(zero("process.call_timeout_secs"));
        }
        if self.process.startup_timeout_secs == 0 {
            return Err(zero("process.startup_timeout_secs"));
        }
        if self.process.inactivity_threshold_secs == Some(0) {
            return Err(zero("process.inactivity_threshold_secs"));
        }

        for family in [ToolFamily::K6, ToolFamily::Lighthouse, ToolFamily::Playwright] {
            let tool = self.tools.for_family(family);
            if tool.binary.trim().is_empty() {
                return Err(Error::InvalidConfig(format!("tools.{}.binary is empty", family)));
            }
            if tool.server_command.trim().is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "tools.{}.server_command is empty",
                    family
                )));
            }
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("results.db")
    }

    /// Get the generated script directory
    pub fn scripts_dir(&self) -> PathBuf {
        self.scripts
            .dir
            .clone()
            .unwrap_or_else(|| self.store_path.join("scripts"))
    }
}
