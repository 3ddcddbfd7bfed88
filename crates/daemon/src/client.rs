//! Tool client adapters
//!
//! Runners talk to tools through [`ToolClient`]. The preferred adapter keeps a
//! long-lived server process in the [`ProcessManager`]; the local adapter
//! spawns the server script once per call. [`FallbackClient`] prefers the
//! former and quietly degrades to the latter.

use crate::config::{DaemonConfig, ProcessConfig, ToolsConfig};
use crate::exec::{run_streaming, CommandSpec};
use crate::process::{ProcessManager, ServerConfig};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use testrig_common::protocol::{unwrap_envelope, Request};
use testrig_common::{Error, Result, ToolFamily};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A way of invoking tool methods
#[async_trait]
pub trait ToolClient: Send + Sync {
    /// Adapter name, for logs
    fn name(&self) -> &str;

    /// Prepare the adapter (start the server, check availability)
    async fn initialize(&self) -> Result<()>;

    /// Invoke one tool method
    async fn call_tool(&self, method: &str, params: Value) -> Result<Value>;

    /// Release whatever the adapter holds
    async fn close(&self) -> Result<()>;
}

// ============================================================================
// Pooled (long-lived server)
// ============================================================================

/// Client backed by a long-lived server process
pub struct PooledClient {
    name: String,
    config: ServerConfig,
    manager: ProcessManager,
}

impl PooledClient {
    pub fn new(config: ServerConfig, manager: ProcessManager) -> Self {
        Self {
            name: config.name.clone(),
            config,
            manager,
        }
    }

    /// Id of the live server, starting one if needed. Looked up by name on
    /// every call because restarts hand out new ids.
    async fn server_id(&self) -> Result<String> {
        match self.manager.running_server_id(&self.config.name) {
            Some(id) => Ok(id),
            None => self.manager.start_server(self.config.clone()).await,
        }
    }
}

#[async_trait]
impl ToolClient for PooledClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<()> {
        let id = self.server_id().await?;
        debug!("{} ready on server {}", self.name, id);
        Ok(())
    }

    async fn call_tool(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.server_id().await?;
        self.manager.execute_command(&id, method, params).await
    }

    async fn close(&self) -> Result<()> {
        if let Some(id) = self.manager.running_server_id(&self.config.name) {
            self.manager.stop_server(&id).await;
        }
        Ok(())
    }
}

// ============================================================================
// One-shot (process per call)
// ============================================================================

/// Client that spawns a fresh process for every call
pub struct OneShotClient {
    name: String,
    command: CommandSpec,
    timeout: Duration,
    grace: Duration,
}

impl OneShotClient {
    pub fn new(name: impl Into<String>, command: CommandSpec, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            command,
            timeout,
            grace: Duration::from_secs(5),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

#[async_trait]
impl ToolClient for OneShotClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn call_tool(&self, method: &str, params: Value) -> Result<Value> {
        let spec = self
            .command
            .clone()
            .stdin(Request::new(method, params).to_line()?);
        let cancel = CancellationToken::new();

        let output = match tokio::time::timeout(
            self.timeout,
            run_streaming(&spec, &cancel, self.grace, |_| {}),
        )
        .await
        {
            Ok(output) => output?,
            Err(_) => {
                warn!("{} call {} timed out", self.name, method);
                return Err(Error::ProcessCallTimeout {
                    method: method.to_string(),
                    millis: self.timeout.as_millis() as u64,
                });
            }
        };

        if !output.success() {
            return Err(Error::ProcessExit {
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        let value = decode_stdout(&output.stdout).ok_or_else(|| {
            Error::OutputParse(format!("{} produced no JSON output", self.name))
        })?;
        unwrap_envelope(value)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Whole stdout as JSON, or else its last JSON line
fn decode_stdout(stdout: &str) -> Option<Value> {
    serde_json::from_str(stdout.trim()).ok().or_else(|| {
        stdout
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
            .filter(|v| v.is_object() || v.is_array())
    })
}

// ============================================================================
// Fallback
// ============================================================================

/// Prefers one client; switches to another for good if the first cannot initialize
pub struct FallbackClient {
    name: String,
    preferred: Arc<dyn ToolClient>,
    local: Arc<dyn ToolClient>,
    degraded: AtomicBool,
}

impl FallbackClient {
    pub fn new(preferred: Arc<dyn ToolClient>, local: Arc<dyn ToolClient>) -> Self {
        Self {
            name: format!("{}|{}", preferred.name(), local.name()),
            preferred,
            local,
            degraded: AtomicBool::new(false),
        }
    }

    /// Whether calls go to the local client
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn active(&self) -> &Arc<dyn ToolClient> {
        if self.is_degraded() {
            &self.local
        } else {
            &self.preferred
        }
    }
}

#[async_trait]
impl ToolClient for FallbackClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<()> {
        if !self.is_degraded() {
            match self.preferred.initialize().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "{} unavailable ({}), using {}",
                        self.preferred.name(),
                        e,
                        self.local.name()
                    );
                    self.degraded.store(true, Ordering::SeqCst);
                }
            }
        }
        self.local.initialize().await
    }

    async fn call_tool(&self, method: &str, params: Value) -> Result<Value> {
        self.active().call_tool(method, params).await
    }

    async fn close(&self) -> Result<()> {
        self.active().close().await
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Which external server entry points exist on disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerAvailability {
    pub k6: bool,
    pub lighthouse: bool,
    pub playwright: bool,
}

/// Builds tool clients from configuration
#[derive(Clone)]
pub struct ClientFactory {
    tools: ToolsConfig,
    process: ProcessConfig,
    manager: ProcessManager,
}

impl ClientFactory {
    pub fn new(config: &DaemonConfig, manager: ProcessManager) -> Self {
        Self {
            tools: config.tools.clone(),
            process: config.process.clone(),
            manager,
        }
    }

    pub fn manager(&self) -> &ProcessManager {
        &self.manager
    }

    /// Spawn configuration of a family's long-lived server
    pub fn server_config(&self, family: ToolFamily) -> ServerConfig {
        let tool = self.tools.for_family(family);
        tool.env.iter().fold(
            ServerConfig::new(format!("external-{}", family), &tool.server_command)
                .args([tool.server_script.clone()])
                .cwd(self.tools.server_dir(family))
                .with_process_config(&self.process),
            |config, (key, value)| config.env(key, value),
        )
    }

    /// Pooled client on the family's long-lived server
    pub fn external(&self, family: ToolFamily) -> Arc<dyn ToolClient> {
        Arc::new(PooledClient::new(
            self.server_config(family),
            self.manager.clone(),
        ))
    }

    /// One-shot client running the family's server script per call
    pub fn local(&self, family: ToolFamily) -> Arc<dyn ToolClient> {
        let tool = self.tools.for_family(family);
        let command = tool.env.iter().fold(
            CommandSpec::new(&tool.server_command)
                .arg(tool.server_script.clone())
                .cwd(self.tools.server_dir(family)),
            |spec, (key, value)| spec.env(key, value),
        );
        Arc::new(
            OneShotClient::new(
                format!("local-{}", family),
                command,
                self.process.call_timeout(),
            )
            .with_grace(self.process.stop_grace()),
        )
    }

    /// External server first, local script if it cannot be started
    pub fn client(&self, family: ToolFamily) -> Arc<dyn ToolClient> {
        Arc::new(FallbackClient::new(self.external(family), self.local(family)))
    }

    pub fn check_external_servers(&self) -> ServerAvailability {
        let exists = |family| {
            let path = self.tools.server_script_path(family);
            let found = path.is_file();
            info!("{} server {}: {}", family, path.display(), if found { "found" } else { "missing" });
            found
        };
        ServerAvailability {
            k6: exists(ToolFamily::K6),
            lighthouse: exists(ToolFamily::Lighthouse),
            playwright: exists(ToolFamily::Playwright),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    fn one_shot(script: &str) -> OneShotClient {
        OneShotClient::new("test", sh(script), Duration::from_secs(5))
    }

    struct Unavailable;

    #[async_trait]
    impl ToolClient for Unavailable {
        fn name(&self) -> &str {
            "unavailable"
        }

        async fn initialize(&self) -> Result<()> {
            Err(Error::ProcessStart {
                name: "unavailable".to_string(),
                reason: "no such server".to_string(),
            })
        }

        async fn call_tool(&self, _method: &str, _params: Value) -> Result<Value> {
            Err(Error::Internal("should not be called".to_string()))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_one_shot_result() {
        let client = one_shot(r#"read req; echo "starting"; echo '{"result": {"ok": true}}'"#);
        let value = client.call_tool("run", json!({"url": "x"})).await.unwrap();
        assert_eq!(value, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_one_shot_echoes_request() {
        let client = one_shot("read req; echo \"$req\"");
        let value = client.call_tool("run_audit", json!({"url": "x"})).await.unwrap();
        assert_eq!(value["method"], "run_audit");
        assert_eq!(value["params"]["url"], "x");
    }

    #[tokio::test]
    async fn test_one_shot_errors() {
        let remote = one_shot(r#"echo '{"error": "lighthouse crashed"}'"#)
            .call_tool("run", Value::Null)
            .await;
        assert!(matches!(remote, Err(Error::Remote(msg)) if msg == "lighthouse crashed"));

        let exit = one_shot("echo boom >&2; exit 4").call_tool("run", Value::Null).await;
        assert!(
            matches!(exit, Err(Error::ProcessExit { code: Some(4), ref stderr }) if stderr == "boom")
        );

        let garbage = one_shot("echo not json").call_tool("run", Value::Null).await;
        assert!(matches!(garbage, Err(Error::OutputParse(_))));
    }

    #[tokio::test]
    async fn test_one_shot_timeout() {
        let client = OneShotClient::new("slow", sh("sleep 5"), Duration::from_millis(100));
        let result = client.call_tool("run", Value::Null).await;
        assert!(matches!(result, Err(Error::ProcessCallTimeout { millis: 100, .. })));
    }

    #[tokio::test]
    async fn test_fallback_degrades_once() {
        let local: Arc<dyn ToolClient> =
            Arc::new(one_shot(r#"echo '{"result": "local"}'"#));
        let client = FallbackClient::new(Arc::new(Unavailable), local);

        client.initialize().await.unwrap();
        assert!(client.is_degraded());
        assert_eq!(client.call_tool("run", Value::Null).await.unwrap(), json!("local"));

        // Stays on the local client
        client.initialize().await.unwrap();
        assert!(client.is_degraded());
    }

    #[tokio::test]
    async fn test_pooled_client_follows_restarts() {
        let manager = ProcessManager::with_timeouts(Duration::from_secs(5), Duration::from_secs(1));
        let config = ServerConfig::new(
            "echo-server",
            "sh",
        )
        .args([
            "-c",
            r#"while read req; do echo "{\"result\": \"$TESTRIG_SERVER_ID\"}"; done"#,
        ]);
        let client = PooledClient::new(config, manager.clone());

        client.initialize().await.unwrap();
        let first = client.call_tool("whoami", Value::Null).await.unwrap();
        let first_id = manager.running_server_id("echo-server").unwrap();
        assert_eq!(first, json!(first_id));

        let second_id = manager.restart_server(&first_id).await.unwrap();
        let second = client.call_tool("whoami", Value::Null).await.unwrap();
        assert_eq!(second, json!(second_id));
        assert_ne!(first_id, second_id);

        client.close().await.unwrap();
        assert!(!manager.is_server_running("echo-server"));
    }

    #[test]
    fn test_factory_server_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::default();
        config.tools.servers_dir = dir.path().to_path_buf();
        std::fs::create_dir_all(dir.path().join("k6-mcp-server")).unwrap();
        std::fs::write(dir.path().join("k6-mcp-server/k6_server.py"), "").unwrap();

        let factory = ClientFactory::new(
            &config,
            ProcessManager::new(&config.process),
        );
        let server = factory.server_config(ToolFamily::K6);
        assert_eq!(server.name, "external-k6");
        assert_eq!(server.command, "python3");
        assert_eq!(server.args, vec!["k6_server.py"]);
        assert_eq!(server.env.get("K6_BIN").map(String::as_str), Some("k6"));
        assert_eq!(server.cwd, Some(dir.path().join("k6-mcp-server")));

        let availability = factory.check_external_servers();
        assert_eq!(
            availability,
            ServerAvailability {
                k6: true,
                lighthouse: false,
                playwright: false
            }
        );
    }
}
