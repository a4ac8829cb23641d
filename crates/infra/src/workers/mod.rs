//! Background maintenance loops.

pub mod sweeper;

pub use sweeper::{Sweeper, SweeperHandle};
