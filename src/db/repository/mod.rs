//! Repository layer: table-scoped database operations for the
//! validation pipeline's collaborators.

mod attempt;
mod coding;
mod template;

pub use attempt::*;
pub use coding::*;
pub use template::*;
