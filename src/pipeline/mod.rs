//! Pipeline module - the multi-hop coordinator and its run layout.

mod coordinator;
mod metrics;
mod run;

pub use coordinator::*;
pub use metrics::*;
pub use run::*;
