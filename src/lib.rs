//! poolgate — request admission and account selection for a multi-account
//! LLM gateway.
//!
//! The crate multiplexes many end-user API keys onto a smaller pool of
//! upstream provider accounts. Admission is governed by per-user and
//! per-account slots, bounded wait queues, sliding-window rate limits, and a
//! session-affine slot scheduler, all coordinated through Redis server-side
//! scripts so any number of gateway replicas stay consistent.
//!
//! Layering, bottom up:
//!
//! - [`store`] — atomic slot store (Redis scripts, the only shared state)
//! - [`concurrency`] — typed acquire/release, waits, release handles
//! - [`scheduler`] — session -> slot mapping and model-pool partitioning
//! - [`selector`] — account choice by priority and weighted load
//! - [`pipeline`] — the per-request admission state machine with failover
//! - [`cleaner`] — startup wipe and background expiry sweeps

pub mod cleaner;
pub mod concurrency;
pub mod config;
pub mod entities;
pub mod forwarder;
pub mod http;
pub mod pipeline;
pub mod scheduler;
pub mod selector;
pub mod session;
pub mod sse;
pub mod store;

pub use cleaner::IdleCleaner;
pub use concurrency::{ConcurrencyManager, ReleaseHandle, WaitError};
pub use config::Config;
pub use entities::{
    Account, AuthContext, BillingGate, EntityStore, Forwarder, Group, NoopBillingGate, Platform,
    StaticEntityStore,
};
pub use forwarder::HttpForwarder;
pub use http::{router, AppState};
pub use pipeline::AdmissionPipeline;
pub use scheduler::SessionScheduler;
pub use selector::AccountSelector;
pub use session::ModelFamily;
pub use sse::{PingFormat, ReplyChannel};
pub use store::{SlotStore, StoreError};
