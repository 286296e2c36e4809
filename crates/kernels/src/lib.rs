//! Numeric primitives for policy training.
//!
//! Every kernel comes with an explicit backward pass so that layers built on
//! top of them can accumulate gradients without an autodiff runtime.

pub mod attention;
pub mod config;
pub mod layernorm;
pub mod linear;
pub mod loss;
pub mod utils;

pub use attention::*;
pub use config::*;
pub use layernorm::*;
pub use linear::*;
pub use loss::*;
pub use utils::*;
