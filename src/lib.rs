//! # sgguard
//!
//! **Security-group compliance auditor for OpenStack.**
//!
//! sgguard periodically scans every security group visible to its OpenStack
//! account, reports ingress rules open to the whole internet and groups that
//! match operator-supplied Rego policies to a Slack channel, and lets
//! operators grant temporary exceptions by reacting to a warning.
//!
//! ## Architecture
//!
//! - **[`inventory`]**: `Inventory` trait and the OpenStack (Keystone/Neutron) client
//! - **[`policy`]**: static allow-list matching and the OPA policy-engine adapter
//! - **[`exception`]**: shared list of temporarily excepted groups (SQLite or memory)
//! - **[`notification`]**: batched warning messages
//! - **[`check`]**: one compliance pass producing a `RunReport`
//! - **[`scheduler`]**: cron triggers for checks and exception resets
//! - **[`chat`]**: chat gateway trait, message types and the Slack client
//! - **[`listener`]**: approve reactions and `ping` mentions
//! - **[`web`]**: Slack Events API webhook (axum)
//! - **[`server`]**: wires the long-running mode together
//! - **[`config`]**, **[`cli`]**, **[`error`]**
//!
//! ## Quick Start
//!
//! ```bash
//! # One pass, print findings only
//! sgguard --config sgguard.toml check --dry-run
//!
//! # Scheduler + Slack events endpoint on :8080
//! sgguard --config sgguard.toml server
//! ```

pub mod chat;
pub mod check;
pub mod cli;
pub mod config;
pub mod error;
pub mod exception;
pub mod inventory;
pub mod listener;
pub mod notification;
pub mod policy;
pub mod scheduler;
pub mod server;
pub mod web;
