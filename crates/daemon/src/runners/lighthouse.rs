//! Lighthouse audit runner

use super::{RunContext, RunDescription, ToolOutput, ToolRunner};
use crate::client::ToolClient;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use testrig_common::parse::lighthouse;
use testrig_common::{Error, ParsedOutput, Result, ToolFamily};
use tracing::info;

/// Audit settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LighthouseConfig {
    pub url: String,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// `desktop` or `mobile`
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
}

fn default_name() -> String {
    "Lighthouse audit".to_string()
}

fn default_device() -> String {
    "desktop".to_string()
}

fn default_categories() -> Vec<String> {
    ["performance", "accessibility", "best-practices", "seo"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl LighthouseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: default_name(),
            description: None,
            device: default_device(),
            categories: default_categories(),
        }
    }
}

/// Runs audits through the Lighthouse tool server
pub struct LighthouseRunner {
    client: Arc<dyn ToolClient>,
}

impl LighthouseRunner {
    pub fn new(client: Arc<dyn ToolClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ToolRunner for LighthouseRunner {
    type Config = LighthouseConfig;

    fn family(&self) -> ToolFamily {
        ToolFamily::Lighthouse
    }

    fn describe(&self, config: &LighthouseConfig) -> RunDescription {
        RunDescription {
            url: config.url.clone(),
            name: config.name.clone(),
            description: config.description.clone(),
        }
    }

    async fn run(&self, ctx: RunContext<LighthouseConfig>) -> Result<ToolOutput> {
        ctx.progress.step("Connecting to Lighthouse", 5);
        self.client.initialize().await?;

        ctx.progress.step("Running audit", 20);
        info!(
            "Auditing {} ({}) for test {} via {}",
            ctx.config.url,
            ctx.config.device,
            ctx.test_id,
            self.client.name()
        );
        let params = json!({
            "url": ctx.config.url,
            "device": ctx.config.device,
            "categories": ctx.config.categories,
        });

        let value = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
            result = self.client.call_tool("run_audit", params) => result?,
        };

        ctx.progress.step("Processing report", 90);
        Ok(ToolOutput::from_value(&value))
    }

    fn parse(&self, test_id: &str, output: &ToolOutput) -> Result<ParsedOutput> {
        lighthouse::parse(test_id, &output.raw)
    }

    fn detect_failure(&self, output: &ToolOutput) -> Option<String> {
        lighthouse::detect_failure(&output.raw)
    }
}
