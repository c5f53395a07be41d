//! Autonomous task orchestration core: a PRD -> Story -> Task hierarchy
//! driven to completion by a dependency-aware scheduler that invokes an
//! external coding agent per task, gates the result behind quality checks
//! and independent verification, and extracts learnings along the way.
//!
//! This crate is a library plus a headless binary (see `src/bin/`); it
//! has no GUI or desktop shell of its own. An embedding front-end holds
//! an [`AutonomousManager`], drives it through the methods in
//! `manager`, and supplies a [`notify::NotifyCallback`] to receive
//! progress updates.

pub mod agent_runner;
pub mod config;
pub mod cooldown;
pub mod db;
pub mod db_utils;
pub mod error;
pub mod executor;
pub mod learning;
pub mod logger;
pub mod manager;
pub mod models;
pub mod notify;
pub mod prd_breakdown;
pub mod quality_gates;
pub mod resource_guard;
pub mod scheduler;
pub mod state_machine;
pub mod verification;

pub use config::OrchestratorConfig;
pub use error::{AppError, AppResult};
pub use manager::{AutonomousManager, PrdDetail, StoryDetail};
