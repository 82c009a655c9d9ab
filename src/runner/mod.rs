//! Start sequence for a set of interdependent containers.
//!
//! ```text
//!   RunPlan ──▶ StartOrderResolver ──▶ for each spec:
//!                                        NameResolver   (free container name)
//!                                        PortMapper     (bindings, variables)
//!                                        create ─▶ start ─▶ inspect
//!                                        DynamicPortTable (assigned ports)
//!                                        ReadinessPoller  (wait until ready)
//!
//!   stop_all(): reverse start order, unless containers are kept
//! ```
//!
//! A container that fails after it was created is removed again before the
//! error is returned.

mod config;
mod error;
mod manager;

pub use config::{HttpWait, RunPlan, RunSpec, TcpWait, WaitSpec};
pub use error::{Result, RunError};
pub use manager::{Runner, StartedContainer};
