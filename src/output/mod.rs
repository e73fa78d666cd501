// Output module for testbed

pub mod errors;
pub mod terminal;

pub use errors::*;
pub use terminal::*;
