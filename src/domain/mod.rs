pub mod reading;
pub mod validation;

pub use reading::*;
pub use validation::*;
