//! # netbatch - Parallel Command Batches for Network Devices
//!
//! `netbatch` runs one ordered command script against many network devices
//! over SSH, a bounded number at a time. Each device gets its own session:
//! login, optional privilege escalation, paging suppression, the script, and
//! a clean exit. Output is streamed line by line to a per-device log file and
//! to live subscribers while the run progresses.
//!
//! ## Features
//!
//! - **Bounded Concurrency**: At most `concurrency_limit` sessions are open at once
//! - **Prompt Detection**: Regex-based prompt, pager and error recognition per device family
//! - **Cooperative Cancellation**: Every connect, login and response wait observes cancel
//! - **Live Log Streaming**: Per-device log files plus a drop-oldest broadcast of lines
//! - **Maximum Compatibility**: Legacy SSH algorithms for older switch firmware
//! - **Offline Replay**: A scripted device CLI for tests and dry runs
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use futures::StreamExt;
//! use netbatch::config::CoordinatorConfig;
//! use netbatch::coordinator::RunCoordinator;
//! use netbatch::events::RunEvent;
//! use netbatch::model::{Device, ExecutionOptions};
//! use netbatch::session::SshConnector;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let coordinator = RunCoordinator::new(
//!         Arc::new(SshConnector::default()),
//!         CoordinatorConfig::default(),
//!     );
//!     coordinator.set_devices([
//!         Device::new("192.168.1.1", "core-1"),
//!         Device::new("192.168.1.2", "core-2"),
//!     ])?;
//!     coordinator.set_commands(["show version", "show ip interface brief"])?;
//!
//!     let mut events = coordinator.subscribe();
//!     let mut options = ExecutionOptions::new("admin", "password");
//!     options.enable_privilege = true;
//!     options.enable_password = "secret".to_string();
//!     coordinator.start_run(options).await?;
//!
//!     while let Some(event) = events.next().await {
//!         match event {
//!             RunEvent::Log(log) => println!("[{}] {}", log.display_name, log.line),
//!             RunEvent::Completed(summary) => {
//!                 println!("{} ok, {} failed", summary.success_count, summary.fail_count);
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!     coordinator.export_results().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`coordinator::RunCoordinator`] - Owns a run's lifecycle, results and export
//! - [`pool::WorkerPool`] - Dispatches device sessions under the concurrency limit
//! - [`session::DeviceSession`] - Per-device protocol state machine
//! - [`device::PromptMatcher`] - Classifies shell output lines
//! - [`sink::LogSink`] - Per-device log files and the live line stream
//! - [`events::RunEvent`] - Notifications for UI and CLI consumers
//! - [`config`] - Defaults, SSH algorithm tables and the JSON job file

pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod events;
pub mod model;
pub mod pool;
pub mod report;
pub mod session;
pub mod sink;
