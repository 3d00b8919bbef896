//! treeserve - serve HTTP straight from a git reference
//!
//! Files of the referenced snapshot are served as they are, except for
//! handler modules (`*.wat`), which are compiled once per snapshot and
//! take part in request handling as scripts, processors or exception
//! handlers.

pub mod cli;
pub mod compiler;
pub mod config;
pub mod dispatch;
pub mod handlers;
pub mod http_server;
pub mod snapshot;
pub mod telemetry;
