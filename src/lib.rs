//! agentmesh library root.
//!
//! Agents exchange multi-part messages through the [`router`], which delivers
//! them FIFO per sender/recipient pair behind retries and a per-agent circuit
//! breaker. Deliveries to task-backed agents become tasks in the [`task`]
//! manager, whose outputs land in the versioned [`artifact`] store. Every
//! state change is recorded in the checkpoint [`ledger`]. [`Mesh`] wires it
//! all together.

pub mod artifact;
pub mod cli;
pub mod config;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod mesh;
pub mod protocol;
pub mod reliability;
pub mod router;
pub mod task;
pub mod web;

pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use error::{Error, Result, RoutingError};
pub use mesh::{MaintenanceReport, Mesh, SendReport};
pub use protocol::{Message, MessageBuilder, Part, Priority};
pub use router::{DeliveryOutcome, DeliveryReceipt, Endpoint};
pub use task::{TaskContext, TaskHandler, TaskOutput, TaskSnapshot, TaskSpec, TaskState};
pub use web::run_server;
