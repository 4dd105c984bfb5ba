pub mod analysis;
pub mod models;

pub use analysis::*;
pub use models::*;
