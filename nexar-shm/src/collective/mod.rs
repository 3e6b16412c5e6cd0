mod allreduce;
mod barrier;
mod broadcast;
mod reduce;

pub use allreduce::hierarchical_allreduce;
pub use barrier::hierarchical_barrier;
pub use broadcast::hierarchical_broadcast;
pub use reduce::hierarchical_reduce;
