pub mod battery;
pub mod grid;

pub use battery::*;
pub use grid::*;
