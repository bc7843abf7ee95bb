// Purpose: lock-free cross-thread handoff of fixed-size byte chunks.
// This is the only subsystem in the crate that is safe for concurrent
// multi-writer/multi-reader use, and the sole sanctioned path for moving
// data between a control thread and the audio thread.

mod chunks;
mod stack;

pub use chunks::{ChannelConfig, Chunk, ChunkChannel};
