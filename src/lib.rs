//! Realtime resource management for polyphonic synthesizers.
//!
//! Everything in this crate is built to run inside a hard-realtime audio
//! callback: bounded worst-case time, no syscalls, no blocking, and no
//! calls into the global allocator on the hot path.
//!
//! The crate is organized leaf-to-root:
//!
//! - [`channel`]: a Treiber-stack based, fixed-capacity chunk channel.
//!   The only structure here that is safe for concurrent use; it is the
//!   sanctioned path for handing data between a control thread and the
//!   audio thread.
//! - [`alloc`]: a realtime-safe heap over pre-reserved memory pools,
//!   with typed construct/destroy helpers, speculative headroom probing,
//!   and transactional rollback.
//! - [`synth`]: the capability interface a synthesis engine exposes to
//!   the pool ([`synth::SynthNote`]), plus realtime portamento state.
//! - [`pool`]: the voice-lifecycle manager, which tracks every sounding
//!   note, enforces key/voice limits through prioritized eviction, and
//!   lazily compacts its arena.

pub mod alloc; // Realtime pool allocator
pub mod channel; // Lock-free cross-thread chunk handoff
pub mod pool; // Note/voice lifecycle and eviction
pub mod synth; // Synthesis-note capability interface

/// Maximum number of simultaneously tracked note descriptors.
pub const POLYPHONY: usize = 60;

/// Expected number of voices spawned per note (kit items, doubled
/// engines). Sizes the voice-slot arena at `POLYPHONY * VOICES_PER_NOTE`.
pub const VOICES_PER_NOTE: usize = 3;

/// Total number of voice slots in the pool arena.
pub const VOICE_SLOTS: usize = POLYPHONY * VOICES_PER_NOTE;
