mod controller;
pub mod loop_worker;

pub use controller::{Scheduler, TaskKey};
