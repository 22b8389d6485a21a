//! # shipwright-core
//!
//! The engine behind the `shipwright` CLI: a hybrid multi-platform
//! release orchestrator for a small fleet of developer tools. Linux
//! targets build inside a local GitHub-Actions-compatible runner
//! emulator; macOS and Windows targets build natively on SSH hosts. The
//! engine plans a per-platform strategy, prepares remote work trees,
//! persists per-host state with retry and resume, collects artifacts,
//! produces a signed manifest with checksums, SBOMs, and provenance, and
//! fans the release out to downstream repositories.
//!
//! ## Pipeline
//!
//! The core flow is **plan → lock → build (concurrent) → manifest →
//! dispatch**:
//!
//! 1. [`strategy::resolve`] decides container-runner vs native per target.
//! 2. [`lock::acquire`] takes the per-(tool, version) advisory lock.
//! 3. [`orchestrator::Orchestrator::orchestrate`] runs every target under
//!    host slot caps with the retry envelope from `shipwright-retry`.
//! 4. [`manifest::build_manifest`] hashes, signs, and attests artifacts.
//! 5. [`dispatch::Dispatcher`] notifies downstream repositories.
//!
//! Structured records flow between components; only the CLI prints JSON.

pub mod dispatch;
pub mod github;
pub mod gitinfo;
pub mod guardrails;
pub mod health;
pub mod lock;
pub mod logger;
pub mod manifest;
pub mod naming;
pub mod orchestrator;
pub mod process;
pub mod runner;
pub mod selector;
pub mod ssh;
pub mod state;
pub mod strategy;
pub mod sync;

pub use shipwright_config as config;
pub use shipwright_retry as retry;
pub use shipwright_types as types;
