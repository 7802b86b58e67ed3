//! Task manager: owns the task state machine.
//!
//! ```text
//! CREATED ──> RUNNING ──> COMPLETED | FAILED | CANCELLED | TIMEOUT
//!    └──────────────────> CANCELLED
//! ```

pub mod cancel;
pub mod handler;
pub mod manager;
pub mod state;

pub use cancel::CancellationToken;
pub use handler::{handler_fn, FnHandler, HandlerError, HandlerRegistry, TaskContext, TaskHandler, TaskOutput};
pub use manager::TaskManager;
pub use state::{TaskError, TaskInput, TaskSnapshot, TaskSpec, TaskState};
