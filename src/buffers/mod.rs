mod buffer;
mod chain;

pub use buffer::{Buffer, BufferBuilder};
pub use chain::{BufferChain, ChainElement, OffsetUnsupported};
