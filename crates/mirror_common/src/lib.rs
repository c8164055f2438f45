pub mod average;
pub mod binary;
pub mod tick;

pub use average::RollingAverage;
pub use tick::Tick;
