//! Kernel configuration structures.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    None,
    Relu,
    #[default]
    Gelu,
}

impl ActivationKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActivationKind::None => "none",
            ActivationKind::Relu => "relu",
            ActivationKind::Gelu => "gelu",
        }
    }
}
