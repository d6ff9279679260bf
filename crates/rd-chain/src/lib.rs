//! # rd-chain
//!
//! Runs processes in order, relocating selected outputs of each stage into
//! the inputs of the next one. Relocation is described with [`PortPath`]s
//! such as `a.b.c.d:e.f`: dots before the colon walk nested input/output
//! namespaces, dots after it walk into the value stored there.

mod chain;
mod path;

pub use chain::{Chain, ChainOutputs, Mapping};
pub use path::PortPath;
