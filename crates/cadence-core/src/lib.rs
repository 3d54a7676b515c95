//! Cadence cooperative worker runtime
//!
//! This crate provides:
//! - A single-thread cooperative worker with an owned or adopted loop thread
//! - A thread-safe queue for handing work to that loop
//! - A bounded-step engine contract with a default synchronous engine
//! - Completion signals for awaiting task termination from any loop

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod completion;
pub mod config;
pub mod engine;
pub mod error;
pub mod queue;
pub mod signal;
pub mod time;
pub mod worker;

pub use completion::CompletionSignal;
pub use config::{CadenceConfig, ConfigError, EngineConfig, WorkerConfig};
pub use engine::{EngineFactory, EngineLimits, Loop, LoopCallback, Priority, StepEngine, SyncLoop};
pub use error::{PreconditionViolation, RegistrationError, Result, Status, StatusCode, WorkerError};
pub use signal::{Event, WaitSource, WaitState};
pub use time::{Deadline, Timeout};
pub use worker::{Worker, WorkerFactory, WorkerHandle, WorkerHooks, WorkerOptions, WorkerStats};
