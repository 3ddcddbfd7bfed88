//! k6 load test runner

use super::{js_string, ProgressUpdate, RunContext, RunDescription, ToolOutput, ToolRunner};
use crate::client::ToolClient;
use crate::exec::{run_streaming, CommandSpec};
use crate::scripts::ScriptWorkspace;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use testrig_common::parse::k6;
use testrig_common::{Error, ParsedOutput, Result, ToolFamily};
use tracing::{debug, info};

/// One ramping stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub duration: String,
    pub target: u32,
}

/// Load test settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct K6Config {
    pub url: String,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_vus")]
    pub vus: u32,
    #[serde(default = "default_duration")]
    pub duration: String,
    /// Ramping stages; when present they replace `vus`/`duration`
    #[serde(default)]
    pub stages: Vec<Stage>,
}

fn default_name() -> String {
    "Load test".to_string()
}

fn default_vus() -> u32 {
    10
}

fn default_duration() -> String {
    "30s".to_string()
}

impl K6Config {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: default_name(),
            description: None,
            vus: default_vus(),
            duration: default_duration(),
            stages: Vec::new(),
        }
    }
}

/// Render the k6 script for a load test
pub fn generate_script(config: &K6Config) -> String {
    let load = if config.stages.is_empty() {
        format!(
            "  vus: {},\n  duration: '{}',",
            config.vus,
            js_string(&config.duration)
        )
    } else {
        let stages: Vec<String> = config
            .stages
            .iter()
            .map(|s| {
                format!(
                    "    {{ duration: '{}', target: {} }}",
                    js_string(&s.duration),
                    s.target
                )
            })
            .collect();
        format!("  stages: [\n{}\n  ],", stages.join(",\n"))
    };

    format!(
        r#"import http from 'k6/http';
import {{ check, sleep }} from 'k6';
import {{ Rate }} from 'k6/metrics';

const errorRate = new Rate('errors');

export const options = {{
{load}
  thresholds: {{
    http_req_duration: ['p(95)<2000'],
    errors: ['rate<0.1'],
  }},
}};

export default function () {{
  const response = http.get('{url}');

  check(response, {{
    'status is 200': (r) => r.status === 200,
    'response time < 2000ms': (r) => r.timings.duration < 2000,
  }});

  errorRate.add(response.status !== 200);
  sleep(1);
}}
"#,
        load = load,
        url = js_string(&config.url),
    )
}

/// How the runner reaches k6
enum Mode {
    /// Spawn the k6 binary
    Direct { binary: String, grace: Duration },
    /// Ask the k6 tool server
    Server(Arc<dyn ToolClient>),
}

/// Runs load tests with k6
pub struct K6Runner {
    mode: Mode,
    scripts: ScriptWorkspace,
}

impl K6Runner {
    pub fn direct(binary: impl Into<String>, scripts: ScriptWorkspace, grace: Duration) -> Self {
        Self {
            mode: Mode::Direct {
                binary: binary.into(),
                grace,
            },
            scripts,
        }
    }

    pub fn with_client(client: Arc<dyn ToolClient>, scripts: ScriptWorkspace) -> Self {
        Self {
            mode: Mode::Server(client),
            scripts,
        }
    }

    async fn run_direct(
        &self,
        binary: &str,
        grace: Duration,
        script: &Path,
        ctx: &RunContext<K6Config>,
    ) -> Result<ToolOutput> {
        let mut spec = CommandSpec::new(binary).arg("run");
        // CLI flags would override the script's stages
        if ctx.config.stages.is_empty() {
            spec = spec
                .args(["--duration", ctx.config.duration.as_str()])
                .args(["--vus".to_string(), ctx.config.vus.to_string()]);
        }
        let spec = spec.arg(script.to_string_lossy());

        let progress = ctx.progress.clone();
        let output = run_streaming(&spec, &ctx.cancel, grace, |line| {
            if let Some(p) = k6::parse_progress(line) {
                progress.send(ProgressUpdate {
                    step: p.step,
                    percent: p.percent,
                });
            }
        })
        .await?;

        if output.cancelled {
            return Err(Error::Cancelled);
        }
        if output.code.is_none() {
            return Err(Error::ProcessExit {
                code: None,
                stderr: output.stderr,
            });
        }
        Ok(ToolOutput {
            raw: output.stdout,
            stderr: output.stderr,
            exit_code: output.code,
        })
    }

    async fn run_server(
        &self,
        client: &Arc<dyn ToolClient>,
        script: &Path,
        ctx: &RunContext<K6Config>,
    ) -> Result<ToolOutput> {
        client.initialize().await?;
        let params = json!({
            "script_file": script.to_string_lossy(),
            "duration": ctx.config.duration,
            "vus": ctx.config.vus,
        });

        // The server owns the k6 process; a cancel only stops waiting for it
        let value = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
            result = client.call_tool("execute_k6_test", params) => result?,
        };

        let raw = ["output", "result"]
            .iter()
            .find_map(|key| value.get(key).and_then(Value::as_str))
            .map(str::to_string);
        Ok(match raw {
            Some(raw) => ToolOutput {
                raw,
                ..Default::default()
            },
            None => ToolOutput::from_value(&value),
        })
    }
}

#[async_trait]
impl ToolRunner for K6Runner {
    type Config = K6Config;

    fn family(&self) -> ToolFamily {
        ToolFamily::K6
    }

    fn describe(&self, config: &K6Config) -> RunDescription {
        RunDescription {
            url: config.url.clone(),
            name: config.name.clone(),
            description: config.description.clone(),
        }
    }

    async fn run(&self, ctx: RunContext<K6Config>) -> Result<ToolOutput> {
        ctx.progress.step("Preparing k6 script", 5);
        let script = self
            .scripts
            .write(ToolFamily::K6, &ctx.test_id, &generate_script(&ctx.config))
            .await?;
        debug!("k6 script for {} at {:?}", ctx.test_id, script);

        ctx.progress.step("Running k6", 10);
        info!("Running k6 against {} for test {}", ctx.config.url, ctx.test_id);
        let result = match &self.mode {
            Mode::Direct { binary, grace } => self.run_direct(binary, *grace, &script, &ctx).await,
            Mode::Server(client) => self.run_server(client, &script, &ctx).await,
        };
        self.scripts.release(&script).await;
        result
    }

    fn parse(&self, test_id: &str, output: &ToolOutput) -> Result<ParsedOutput> {
        Ok(k6::parse(test_id, &output.raw))
    }

    fn detect_failure(&self, output: &ToolOutput) -> Option<String> {
        k6::detect_failure(&output.raw, &output.stderr)
    }
}
