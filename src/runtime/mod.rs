// src/runtime/mod.rs
//! Host roles and bot execution
//!
//! - **Controller**: ensures a client host exists and collects bot placement over IPC
//! - **Client**: owns a BotRunner and runs the reconciliation loop
//! - **Reconciler**: converges running workers to the desired bots
//! - **Worker**: one OS process per bot, launched and supervised
//! - **Process**: signal-based termination of child processes
//! - **Limits**: cgroup v2 CPU/memory/pids limits for workers
//! - **Bot**: the entry point a worker process runs
//! - **Dispatch**: runs `/main` and routes events to command, hook and webhook handlers
//!
//! ```text
//!  controller host                     client host
//! ┌──────────────┐  bots:discover   ┌──────────────────────────┐
//! │  Controller  │ ───────────────▶ │ IpcEndpoint (RunningBots)│
//! └──────┬───────┘   shared topic   │                          │
//!        │ spawn_client             │ ReconciliationLoop       │
//!        ▼                          │   ▲ watch BotRunner      │
//!   client host pod                 │   ▼ launch / terminate   │
//!                                   │ worker ── worker ── ...  │
//!                                   └──────────────────────────┘
//! ```

pub mod bot;
pub mod client;
pub mod controller;
pub mod dispatch;
pub mod limits;
pub mod process;
pub mod reconciler;
pub mod worker;

pub use client::{run_client, run_client_with};
pub use controller::{run_controller, Controller, Placement};
pub use dispatch::{BotEvent, Dispatcher, HandlerEngine, HandlerTable, InterpreterEngine, Invocation};
pub use limits::{CgroupLimiter, ResourceLimits};
pub use reconciler::{ReconcileOutcome, ReconciliationLoop};
pub use worker::{ExitOutcome, LaunchRequest, ProcessLauncher, Worker, WorkerExit, WorkerLauncher};
