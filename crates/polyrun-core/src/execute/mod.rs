//! Execution layer: units, executors, pools and composition.
//!
//! # Architecture
//!
//! ```text
//! CallbackUnit (closure receiving a CancelToken)
//!     │
//!     ├── UnitExecutor ── supervisor thread ── worker thread
//!     │       │                 │
//!     │       │                 └── recv_timeout: on expiry cancel token, detach worker
//!     │       └── ResultHandle (one-shot channel)
//!     │
//!     ├── CallbackPool ── at most N UnitExecutors in flight, blocking admission
//!     │
//!     └── ThreadPool ── fixed workers, FIFO queue, drains on shutdown
//! ```
//!
//! # Module Structure
//!
//! - `context` - Cooperative cancellation token
//! - `result` - Units, outcomes and failure classification
//! - `handle` - One-shot result handles
//! - `unit` - Single-unit executor with timeout
//! - `pool` - Bounded callback pool
//! - `thread_pool` - Fixed-size worker pool
//! - `compose` - Retry, parallel and race

mod compose;
mod context;
mod handle;
mod pool;
mod result;
mod thread_pool;
mod unit;

pub use compose::{execute_parallel, execute_race, execute_with_retry};
pub use context::CancelToken;
pub use handle::{ResultHandle, TaskHandle};
pub use pool::CallbackPool;
pub use result::{CallbackUnit, ErrorKind, ExecutionResult, UnitError, UnitResult};
pub use thread_pool::ThreadPool;
pub use unit::UnitExecutor;

pub(crate) use compose::join_in_order;
pub(crate) use unit::run_inline;
