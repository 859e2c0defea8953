/*
 * 5D Labs Agent Platform - Cluster Agent
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Cluster agent core library
//!
//! Reconciliation engine keeping in-cluster state in sync with the remote
//! console: per-domain controllers fed by periodic polls and realtime push
//! events, supervised by a heartbeat watchdog.

pub mod cache;
pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod manager;
pub mod namespaces;
pub mod poller;
pub mod queue;
pub mod reconciler;
pub mod socket;
pub mod supervisor;

// Re-export commonly used types
pub use cache::Cache;
pub use client::ConsoleClient;
pub use config::AgentConfig;
pub use controller::{Controller, ControllerHealth};
pub use error::{ConsoleError, Error, Result};
pub use manager::{Manager, ManagerBuilder, ManagerOptions};
pub use queue::WorkQueue;
pub use reconciler::{PollInterval, ReconcileContext, ReconcileResult, Reconciler, ReconcilerState};
pub use socket::{Publisher, QueuePublisher, Socket};
pub use supervisor::LivenessThreshold;
