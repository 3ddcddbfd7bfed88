//! Playwright end-to-end runner
//!
//! With scenario code the run goes to the Playwright tool server
//! (`execute_scenario`). Without it a smoke script is generated and run with
//! node directly; the script prints one glyph line per step and finishes with
//! a single JSON summary line.

use super::{ProgressUpdate, RunContext, RunDescription, ToolOutput, ToolRunner};
use crate::client::ToolClient;
use crate::exec::{run_streaming, CommandSpec};
use crate::scripts::ScriptWorkspace;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use testrig_common::parse::{glyph_outcome, playwright};
use testrig_common::{Error, ParsedOutput, Result, ToolFamily};
use tracing::{debug, info};

/// Environment variable carrying the target URL into the generated script
pub const URL_ENV: &str = "PLAYWRIGHT_TEST_URL";

/// Environment variable carrying the JSON browser settings
pub const CONFIG_ENV: &str = "PLAYWRIGHT_CONFIG";

/// Browser engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

/// Browser settings handed to the scenario or script
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrowserSettings {
    pub browser: Browser,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub navigation_timeout_ms: u64,
    pub action_timeout_ms: u64,
    pub ignore_https_errors: bool,
    pub user_agent: Option<String>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            browser: Browser::Chromium,
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            navigation_timeout_ms: 30_000,
            action_timeout_ms: 10_000,
            ignore_https_errors: false,
            user_agent: None,
        }
    }
}

/// End-to-end test settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaywrightConfig {
    pub url: String,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Scenario body run by the tool server; `None` runs the smoke script
    #[serde(default)]
    pub scenario_code: Option<String>,
    #[serde(default)]
    pub settings: BrowserSettings,
}

fn default_name() -> String {
    "E2E test".to_string()
}

impl PlaywrightConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: default_name(),
            description: None,
            scenario_code: None,
            settings: BrowserSettings::default(),
        }
    }
}

/// Render the smoke script. The URL and settings are read from the
/// environment at run time so nothing user-supplied is spliced into code.
pub fn generate_script(settings: &BrowserSettings) -> String {
    format!(
        r#"const playwright = require('playwright');

const url = process.env.{url_env};
const config = JSON.parse(process.env.{config_env} || '{{}}');

(async () => {{
  const started = Date.now();
  let steps = 0;
  const step = async (name, action) => {{
    await action();
    steps += 1;
    console.log(`✓ ${{name}}`);
  }};

  const browser = await playwright.{browser}.launch({{ headless: config.headless !== false }});
  try {{
    const context = await browser.newContext({{
      viewport: {{ width: config.viewportWidth || 1280, height: config.viewportHeight || 720 }},
      ignoreHTTPSErrors: !!config.ignoreHttpsErrors,
      userAgent: config.userAgent || undefined,
    }});
    context.setDefaultNavigationTimeout(config.navigationTimeoutMs || 30000);
    context.setDefaultTimeout(config.actionTimeoutMs || 10000);
    const page = await context.newPage();

    await step('Navigate to page', () => page.goto(url));
    await step('Wait for load', () => page.waitForLoadState('networkidle'));
    await step('Read title', async () => {{
      const title = await page.title();
      console.log(`title: ${{title}}`);
    }});
    await step('Check links', async () => {{
      const links = await page.locator('a').count();
      console.log(`links: ${{links}}`);
    }});

    console.log(JSON.stringify({{ success: true, steps, durationMs: Date.now() - started }}));
  }} catch (error) {{
    console.log(`✘ ${{error.message.split('\n')[0]}}`);
    console.log(JSON.stringify({{ success: false, steps, durationMs: Date.now() - started, error: error.message }}));
    process.exitCode = 1;
  }} finally {{
    await browser.close();
  }}
}})();
"#,
        url_env = URL_ENV,
        config_env = CONFIG_ENV,
        browser = settings.browser.as_str(),
    )
}

/// Runs end-to-end tests with Playwright
pub struct PlaywrightRunner {
    node: String,
    client: Arc<dyn ToolClient>,
    scripts: ScriptWorkspace,
    grace: Duration,
}

impl PlaywrightRunner {
    pub fn new(
        node: impl Into<String>,
        client: Arc<dyn ToolClient>,
        scripts: ScriptWorkspace,
        grace: Duration,
    ) -> Self {
        Self {
            node: node.into(),
            client,
            scripts,
            grace,
        }
    }

    async fn run_scenario(
        &self,
        code: &str,
        ctx: &RunContext<PlaywrightConfig>,
    ) -> Result<ToolOutput> {
        ctx.progress.step("Connecting to Playwright", 5);
        self.client.initialize().await?;

        ctx.progress.step("Running scenario", 20);
        let params = json!({
            "scenarioCode": code,
            "config": ctx.config.settings,
            "url": ctx.config.url,
        });
        let value = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
            result = self.client.call_tool("execute_scenario", params) => result?,
        };

        ctx.progress.step("Processing results", 90);
        Ok(ToolOutput::from_value(&value))
    }

    async fn run_script(&self, ctx: &RunContext<PlaywrightConfig>) -> Result<ToolOutput> {
        ctx.progress.step("Preparing script", 5);
        let script = self
            .scripts
            .write(ToolFamily::Playwright, &ctx.test_id, &generate_script(&ctx.config.settings))
            .await?;
        debug!("Playwright script for {} at {:?}", ctx.test_id, script);

        let spec = CommandSpec::new(&self.node)
            .arg(script.to_string_lossy())
            .env(URL_ENV, &ctx.config.url)
            .env(CONFIG_ENV, serde_json::to_string(&ctx.config.settings)?);

        let progress = ctx.progress.clone();
        let mut done: u8 = 0;
        let result = run_streaming(&spec, &ctx.cancel, self.grace, |line| {
            if let Some((true, name)) = glyph_outcome(line) {
                done = done.saturating_add(1);
                progress.send(ProgressUpdate::step(
                    name,
                    done.saturating_mul(20).saturating_add(10).min(95),
                ));
            }
        })
        .await;
        self.scripts.release(&script).await;

        let output = result?;
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
}

#[async_trait]
impl ToolRunner for PlaywrightRunner {
    type Config = PlaywrightConfig;

    fn family(&self) -> ToolFamily {
        ToolFamily::Playwright
    }

    fn describe(&self, config: &PlaywrightConfig) -> RunDescription {
        RunDescription {
            url: config.url.clone(),
            name: config.name.clone(),
            description: config.description.clone(),
        }
    }

    async fn run(&self, ctx: RunContext<PlaywrightConfig>) -> Result<ToolOutput> {
        info!(
            "Running Playwright ({}) against {} for test {}",
            ctx.config.settings.browser.as_str(),
            ctx.config.url,
            ctx.test_id
        );
        match ctx.config.scenario_code.clone() {
            Some(code) => self.run_scenario(&code, &ctx).await,
            None => self.run_script(&ctx).await,
        }
    }

    fn parse(&self, test_id: &str, output: &ToolOutput) -> Result<ParsedOutput> {
        playwright::parse(test_id, &output.raw)
    }

    fn detect_failure(&self, output: &ToolOutput) -> Option<String> {
        playwright::detect_failure(&output.raw, &output.stderr)
    }
}
