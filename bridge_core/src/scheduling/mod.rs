pub mod scheduler;

pub use scheduler::{PollStats, Scheduler};
