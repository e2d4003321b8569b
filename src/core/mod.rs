pub mod types;
pub mod interfaces;

pub use types::*;
pub use interfaces::*;
