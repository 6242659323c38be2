pub mod attempt;
pub mod request;
pub mod template;
pub mod verdict;

pub use attempt::*;
pub use request::*;
pub use template::*;
pub use verdict::*;
