pub mod adjust;
pub mod builder;
pub mod calibrator;
pub mod dummy;
pub mod graph;
pub mod metrics;
pub mod repair;
pub mod schema;
pub mod tracker;

pub use adjust::{AdjustContext, Direction};
pub use builder::*;
pub use calibrator::*;
pub use dummy::*;
pub use graph::*;
pub use metrics::*;
pub use repair::*;
pub use schema::*;
pub use tracker::*;
