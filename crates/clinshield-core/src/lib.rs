pub mod attributes;
pub mod config_manager;
pub mod error;
pub mod id_mapping;
pub mod record;
pub mod seed;
pub mod shape;
pub mod traits;
pub mod types;

pub use attributes::*;
pub use config_manager::*;
pub use error::*;
pub use id_mapping::*;
pub use record::*;
pub use seed::*;
pub use shape::*;
pub use traits::*;
pub use types::*;

/// Literal used for synthetic values and dummy record fields.
pub const PLACEHOLDER: &str = "unspecified";
