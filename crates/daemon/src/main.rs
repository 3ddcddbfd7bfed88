//! testrig daemon entry point
//!
//! Starts one run through the matching coordinator, follows it to a terminal
//! status and prints the stored result as JSON.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use testrig_common::{ResultStore, SqliteStore, TestResult, TestStatus, ToolFamily};
use testrig_daemon::client::ClientFactory;
use testrig_daemon::config::DaemonConfig;
use testrig_daemon::coordinator::{Coordinator, StartRequest};
use testrig_daemon::process::{ProcessManager, ServerEvent};
use testrig_daemon::runners::playwright::Browser;
use testrig_daemon::runners::{
    K6Config, K6Runner, LighthouseConfig, LighthouseRunner, PlaywrightConfig, PlaywrightRunner,
    Stage, ToolRunner,
};
use testrig_daemon::scripts::{ScriptSweeper, ScriptWorkspace};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "testrigd")]
#[command(about = "testrig - run k6, Lighthouse and Playwright tests and keep their metrics")]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults to <store>/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long, env = "TESTRIG_STORE")]
    store: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a k6 load test
    Load {
        url: String,

        /// Virtual users
        #[arg(long, default_value_t = 10)]
        vus: u32,

        /// Test duration, e.g. 30s or 2m
        #[arg(long, default_value = "30s")]
        duration: String,

        /// Ramping stage as DURATION:TARGET (repeatable)
        #[arg(long = "stage", value_parser = parse_stage)]
        stages: Vec<Stage>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Run a Lighthouse audit
    Audit {
        url: String,

        /// desktop or mobile
        #[arg(long, default_value = "desktop")]
        device: String,

        /// Category to audit (repeatable)
        #[arg(long = "category")]
        categories: Vec<String>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Run a Playwright end-to-end test
    E2e {
        url: String,

        /// chromium, firefox or webkit
        #[arg(long, default_value = "chromium")]
        browser: String,

        /// Scenario file run by the Playwright server
        #[arg(long)]
        scenario: Option<PathBuf>,

        /// Show the browser window
        #[arg(long)]
        headed: bool,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Show a stored result and its metrics
    Status { test_id: String },

    /// Report which external tool servers are installed
    Servers,

    /// Remove generated scripts past their retention
    Sweep,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Test id (generated when omitted)
    #[arg(long)]
    test_id: Option<String>,

    /// Display name
    #[arg(long)]
    name: Option<String>,

    /// Maximum run time in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
}

impl RunArgs {
    fn request<C>(&self, config: C) -> StartRequest<C> {
        StartRequest {
            test_id: self.test_id.clone(),
            timeout: self.timeout_secs.map(Duration::from_secs),
            config,
        }
    }
}

fn parse_stage(value: &str) -> Result<Stage, String> {
    let (duration, target) = value
        .split_once(':')
        .ok_or_else(|| format!("expected DURATION:TARGET, got '{}'", value))?;
    let target = target
        .parse()
        .map_err(|e| format!("invalid stage target '{}': {}", target, e))?;
    Ok(Stage {
        duration: duration.to_string(),
        target,
    })
}

fn parse_browser(value: &str) -> anyhow::Result<Browser> {
    Ok(serde_json::from_value(json!(value.to_lowercase()))
        .with_context(|| format!("unknown browser '{}'", value))?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    debug!("testrig v{}", testrig_common::VERSION);

    // Load configuration
    let store_path = cli.store.unwrap_or_else(testrig_common::default_store_path);
    let config_path = cli.config.unwrap_or_else(|| store_path.join("config.toml"));
    let mut config = DaemonConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    config.store_path = store_path;

    tokio::fs::create_dir_all(&config.store_path).await?;

    match cli.command {
        Commands::Status { test_id } => {
            let store = SqliteStore::open(config.db_path())?;
            let result = store
                .get_result_by_test_id(&test_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no result for test {}", test_id))?;
            let metrics = store.metrics_for_test(&test_id).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "result": result, "metrics": metrics }))?
            );
        }
        Commands::Servers => {
            let factory = ClientFactory::new(&config, ProcessManager::new(&config.process));
            let available = factory.check_external_servers();
            println!("{}", serde_json::to_string_pretty(&available)?);
        }
        Commands::Sweep => {
            let removed = ScriptWorkspace::from_config(&config).sweep().await?;
            println!("{}", json!({ "removed": removed }));
        }
        Commands::Load {
            url,
            vus,
            duration,
            stages,
            run,
        } => {
            let session = Session::open(&config)?;
            let tool = &config.tools.k6;
            let runner = if tool.direct {
                K6Runner::direct(&tool.binary, session.scripts.clone(), session.grace)
            } else {
                K6Runner::with_client(
                    session.factory.client(ToolFamily::K6),
                    session.scripts.clone(),
                )
            };
            let mut k6 = K6Config::new(url);
            k6.vus = vus;
            k6.duration = duration;
            k6.stages = stages;
            if let Some(name) = &run.name {
                k6.name = name.clone();
            }
            let coordinator = Coordinator::new(runner, session.store.clone())
                .with_execution_config(&config.execution, false);
            let outcome = follow(coordinator, run.request(k6)).await;
            session.finish(outcome).await?;
        }
        Commands::Audit {
            url,
            device,
            categories,
            run,
        } => {
            let session = Session::open(&config)?;
            let client = if config.tools.lighthouse.direct {
                session.factory.local(ToolFamily::Lighthouse)
            } else {
                session.factory.client(ToolFamily::Lighthouse)
            };
            let mut audit = LighthouseConfig::new(url);
            audit.device = device;
            if !categories.is_empty() {
                audit.categories = categories;
            }
            if let Some(name) = &run.name {
                audit.name = name.clone();
            }
            let coordinator = Coordinator::new(LighthouseRunner::new(client), session.store.clone())
                .with_execution_config(&config.execution, true);
            let outcome = follow(coordinator, run.request(audit)).await;
            session.finish(outcome).await?;
        }
        Commands::E2e {
            url,
            browser,
            scenario,
            headed,
            run,
        } => {
            let mut e2e = PlaywrightConfig::new(url);
            e2e.settings.browser = parse_browser(&browser)?;
            e2e.settings.headless = !headed;
            if let Some(path) = scenario {
                e2e.scenario_code = Some(
                    tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("failed to read {}", path.display()))?,
                );
            }
            if let Some(name) = &run.name {
                e2e.name = name.clone();
            }

            let session = Session::open(&config)?;
            let runner = PlaywrightRunner::new(
                &config.tools.playwright.binary,
                session.factory.client(ToolFamily::Playwright),
                session.scripts.clone(),
                session.grace,
            );
            let coordinator = Coordinator::new(runner, session.store.clone())
                .with_execution_config(&config.execution, false);
            let outcome = follow(coordinator, run.request(e2e)).await;
            session.finish(outcome).await?;
        }
    }

    Ok(())
}

/// Shared machinery of one test run
struct Session {
    store: Arc<dyn ResultStore>,
    manager: ProcessManager,
    factory: ClientFactory,
    scripts: ScriptWorkspace,
    grace: Duration,
    background: Vec<tokio::task::JoinHandle<()>>,
}

impl Session {
    fn open(config: &DaemonConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn ResultStore> = Arc::new(SqliteStore::open(config.db_path())?);
        let manager = ProcessManager::new(&config.process);
        let factory = ClientFactory::new(config, manager.clone());
        let scripts = ScriptWorkspace::from_config(config);

        let sweeper = ScriptSweeper::new(scripts.clone(), config.scripts.sweep_interval());
        let background = vec![
            tokio::spawn(log_server_events(manager.clone())),
            tokio::spawn(async move { sweeper.run().await }),
        ];

        Ok(Self {
            store,
            manager,
            factory,
            scripts,
            grace: config.process.stop_grace(),
            background,
        })
    }

    /// Stop servers and background tasks, then print the result
    async fn finish(self, outcome: anyhow::Result<TestResult>) -> anyhow::Result<()> {
        self.manager.stop_all_servers().await;
        for task in &self.background {
            task.abort();
        }

        let result = outcome?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        if result.status != TestStatus::Completed {
            std::process::exit(1);
        }
        Ok(())
    }
}

/// Follow a run to its end, cancelling it on Ctrl-C
async fn follow<R: ToolRunner>(
    coordinator: Coordinator<R>,
    request: StartRequest<R::Config>,
) -> anyhow::Result<TestResult> {
    let started = coordinator.start(request).await?;
    let test_id = started.test_id;
    info!("Test {} running against {}", test_id, started.url);

    tokio::select! {
        result = coordinator.wait(&test_id, POLL_INTERVAL) => Ok(result?),
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, cancelling {}", test_id);
            coordinator.cancel(&test_id).await?;
            Ok(coordinator.status(&test_id).await?)
        }
    }
}

async fn log_server_events(manager: ProcessManager) {
    let mut events = manager.subscribe();
    while let Ok(event) = events.recv().await {
        match event {
            ServerEvent::Unhealthy { name, reason, .. } => {
                warn!("Server {} unhealthy: {}", name, reason)
            }
            ServerEvent::RestartBudgetExhausted { name, restarts, .. } => {
                warn!("Server {} gave up after {} restarts", name, restarts)
            }
            other => info!("Server event: {:?}", other),
        }
    }
}
