//! Transformer robot policy.
//!
//! Tokenizers turn each input modality into token groups, the block
//! transformer mixes them under a group-aware causal mask, and action heads
//! read the readout tokens. Gradients are propagated by hand through every
//! layer's `backward`.

pub mod attention;
pub mod block_transformer;
pub mod checkpoint;
pub mod config;
pub mod heads;
pub mod nn;
pub mod param;
pub mod policy;
pub mod tokenizers;
pub mod transformer;

pub use block_transformer::{
    assemble_input_tokens, generate_attention_mask, BlockOutputs, BlockTransformer, PrefixGroup,
    TimestepGroup, TokenMetadata, TokenPosition,
};
pub use checkpoint::{load_checkpoint, load_params, save_checkpoint, save_params, CheckpointMeta, LoadReport};
pub use config::*;
pub use heads::{ActionHead, HeadMetrics};
pub use param::{Param, ParamMut, Parameterized};
pub use policy::{ActionTargets, PolicyInputs, PolicyMetrics, PolicyModel};
pub use tokenizers::{InputSpec, Tokenizer};
