//! # tagtrack - RFID Task-Time Tracker
//!
//! A stationary board with an RFID reader records which task is running and for
//! how long; a controller connects over a point-to-point stream link to register
//! tags, start and stop tracking, and download the collected record.
//!
//! ## Features
//!
//! - **Framed link**: length-prefixed named frames over any byte stream, with a
//!   role-gated [`link::Channel`] handling handshake, teardown and the
//!   "no data yet" versus "timed out" read distinction.
//! - **Board service**: handshake retry loop and command dispatcher driving a tag
//!   reader task and a single-owner activity recorder with a per-second timer.
//! - **Controller**: connect/sync/read sequence, tag registration, record download
//!   with CSV export and an interactive shell.
//! - **Persistence**: JSON stores written under a file lock with atomic rename.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tagtrack::config::Config;
//! use tagtrack::controller::Controller;
//! use tagtrack::link::{Channel, StaticResolver};
//! use tagtrack::protocol::Role;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let resolver = Arc::new(StaticResolver::from_config(&config.link));
//!     let channel = Arc::new(Channel::new(Role::Controller, config.link.settings(), resolver));
//!     let controller = Controller::new(channel);
//!     controller.connect().await?;
//!     let record = controller.download().await?;
//!     println!("{} entries", record.len());
//!     controller.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`protocol`] - frame codec, command vocabulary and the link error taxonomy
//! - [`link`] - the channel, its stream guard and address resolution
//! - [`board`] - board service: dispatcher, tag reader task, activity recorder
//! - [`controller`] - controller operations and the operator shell
//! - [`activity`] - the activity record
//! - [`storage`] - lookup table and activity record persistence
//! - [`config`] - configuration management and validation
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   commands    ┌──────────────┐
//! │  Controller  │ ────────────▶ │    Board     │ ← dispatcher
//! └──────────────┘ ◀──────────── └──────────────┘
//!          │        data frames         │
//! ┌──────────────┐              ┌───────┴───────┐
//! │   Channel    │              │ reader task   │ → recorder task → stores
//! └──────────────┘              └───────────────┘
//! ```

pub mod activity;
pub mod board;
pub mod config;
pub mod controller;
pub mod link;
pub mod logutil;
pub mod protocol;
pub mod storage;
pub mod tag;
