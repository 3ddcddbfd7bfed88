//! testrig daemon
//!
//! Runs k6 load tests, Lighthouse audits and Playwright end-to-end tests,
//! supervises the long-lived tool servers they talk to, and turns whatever
//! the tools print into stored results and metric rows.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Coordinator<R: ToolRunner>                                 │
//! │    ├── start(StartRequest) -> TestResult (running)          │
//! │    ├── status(test_id) -> TestResult                        │
//! │    └── cancel(test_id) -> TestStatus                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TestStateTracker   one ActiveTest per run, first finisher  │
//! │                     (runner | timer | cancel) wins          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Runners            K6Runner, LighthouseRunner,             │
//! │                     PlaywrightRunner                        │
//! │    ├── exec::run_streaming   spawn the tool directly        │
//! │    └── ToolClient            Pooled | OneShot | Fallback    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ProcessManager     JSON-lines servers, health checks,      │
//! │                     restart budget, SIGTERM -> SIGKILL      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  testrig_common     parsers (pure) + ResultStore            │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod coordinator;
pub mod exec;
pub mod process;
pub mod runners;
pub mod scripts;
pub mod state;

pub use client::{ClientFactory, ToolClient};
pub use config::DaemonConfig;
pub use coordinator::{Coordinator, StartRequest};
pub use process::{ProcessManager, ServerConfig, ServerEvent};
pub use runners::{ToolOutput, ToolRunner};
pub use state::TestStateTracker;
