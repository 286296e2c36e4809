//! Behavior-cloning training for transformer robot policies.
//!
//! Facade over the workspace crates: numeric kernels, the policy model,
//! the dataset pipeline, and the trainer.

pub use policyforge_data as data;
pub use policyforge_kernels as kernels;
pub use policyforge_model as model;
pub use policyforge_train as train;
