//! Worker pool, service dispatcher and runtime/router for the ember actor
//! runtime (spec §4.C, §4.F, §4.G). Builds on `ember-core`'s envelope and
//! addressing types, `ember-net`'s per-worker socket server and `ember-timer`'s
//! timer wheel.

pub mod config;
pub mod runtime;
pub mod service;
pub mod worker;

pub use config::{RuntimeConfig, ServiceSpec};
pub use runtime::Runtime;
pub use service::{Service, ServiceContext};
pub use worker::{Worker, WorkerCommand};
