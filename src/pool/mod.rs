//! Bounded pool of per-problem proof-checking workers.
//!
//! Each worker is an external process that has loaded one theorem's context
//! and answers `check_proof` calls for it over HTTP. The pool starts workers
//! lazily, reuses idle ones, evicts the least recently used idle worker when it
//! is full, and replaces workers whose process has died.
//!
//! ```text
//!  check_proof(problem, proof, timeout)
//!        │
//!        ▼
//!  ┌──────────────┐  checkout   ┌──────────────────────────────┐
//!  │  WorkerPool  │────────────▶│ Registry (one mutex)         │
//!  │ (dispatcher) │◀────────────│ ProblemId -> [WorkerHandle]  │
//!  └──────┬───────┘  lease /    │ + reserved slots, capacity C │
//!         │          slot       └──────────────────────────────┘
//!         │ launch / probe / check_proof
//!         ▼
//!  ┌────────────────┐   ┌─────────────────┐
//!  │ WorkerLauncher │   │ WorkerTransport │ ──HTTP──▶ worker process
//!  └────────────────┘   └─────────────────┘
//! ```
//!
//! No worker ever serves two requests at once: a request holds a
//! [`WorkerLease`] for the whole time it talks to the worker, and dropping the
//! lease is the only way to release it.

mod dispatcher;
mod handle;
mod proc;
mod registry;
mod signals;
mod spawn;
mod transport;

pub use dispatcher::{PoolConfig, PoolStats, WorkerPool};
pub use registry::WorkerInfo;
pub use spawn::{BuiltinWorkerOptions, CommandLauncher, WorkerCommand};
pub use transport::HttpTransport;

// Seams for plugging fake workers into a pool.
#[cfg(test)]
pub use proc::WorkerProcess;
#[cfg(test)]
pub use signals::TerminationReason;
#[cfg(test)]
pub use spawn::WorkerLauncher;
#[cfg(test)]
pub use transport::WorkerTransport;
