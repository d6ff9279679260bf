//! The unit of external work: something that maps an input bundle to an
//! output bundle.

use async_trait::async_trait;
use std::sync::Arc;

use crate::errors::OptResult;
use crate::evaluation::Bundle;

/// A long-running computation that turns inputs into outputs.
///
/// Evaluation calculations and the stages of a chain both implement this.
#[async_trait]
pub trait Process: Send + Sync {
    /// Run the process to completion.
    async fn run(&self, inputs: Bundle) -> OptResult<Bundle>;

    /// Human-readable process name.
    fn name(&self) -> &str;
}

#[async_trait]
impl<P: Process + ?Sized> Process for Arc<P> {
    async fn run(&self, inputs: Bundle) -> OptResult<Bundle> {
        (**self).run(inputs).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Returns its inputs unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

#[async_trait]
impl Process for Echo {
    async fn run(&self, inputs: Bundle) -> OptResult<Bundle> {
        Ok(inputs)
    }

    fn name(&self) -> &str {
        "echo"
    }
}

/// Echoes input `x` as output `result`, the shape optimization engines
/// expect from a one-dimensional evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoResult;

#[async_trait]
impl Process for EchoResult {
    async fn run(&self, inputs: Bundle) -> OptResult<Bundle> {
        let x = inputs
            .get("x")
            .cloned()
            .ok_or_else(|| crate::OptError::Path("missing input 'x'".to_string()))?;
        let mut outputs = Bundle::new();
        outputs.insert("result".to_string(), x);
        Ok(outputs)
    }

    fn name(&self) -> &str {
        "echo_result"
    }
}
