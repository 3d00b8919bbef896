//! # Handlers
//!
//! Contract between the dispatcher and handler modules, and the registry
//! that classifies instantiated handlers by capability.

pub mod errors;
pub mod handler;
pub mod registry;

pub use errors::{Fault, FaultCode, FaultResult};
pub use handler::{Capabilities, Capability, Handler, HandlerRequest, HandlerResponse};
pub use registry::{HandlerInstance, HandlerRegistry};
