//! Composable child input: the lazily-expanded source and the pump that
//! drains it into the child's stdin.

mod pump;
mod source;

pub(crate) use pump::{InputPump, PumpProgress, StdinSink};
pub use source::{Chunk, InputSource, IntoChunk};
