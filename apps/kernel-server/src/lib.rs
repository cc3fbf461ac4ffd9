// [[CONDUIT]]/apps/kernel-server/src/lib.rs
// Purpose: Crate root. Task dispatch runtime with an append-only event log and a streaming bridge.
// Architecture: Library Root

pub mod config;
pub mod error;
pub mod event_log;
pub mod events;
pub mod executor;
pub mod hub;
pub mod models;
pub mod observability;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod security;
pub mod server;
pub mod task_store;

pub use config::{Backend, KernelConfig};
pub use error::{KernelError, KernelResult};
pub use server::{router, KernelState};
