use std::ptr::NonNull;

use crate::alloc::{Handle, RtAllocator};

/// Parameters forwarded to every live voice when a legato retrigger
/// repitches the sounding note.
#[derive(Debug, Clone, Copy)]
pub struct LegatoParams {
    pub velocity: f32,
    /// Whether a portamento glide applies to this retrigger.
    pub portamento: bool,
    /// Target pitch as a log2 frequency.
    pub note_log2_freq: f32,
    /// True when triggered from outside the engine (MIDI) rather than by
    /// internal legato bookkeeping.
    pub extern_call: bool,
    pub seed: u32,
}

/// Arena-owned, type-erased synthesis voice.
pub type NoteHandle<'a> = Handle<'a, dyn SynthNote + 'a>;

/// What the pool requires of a synthesis engine.
///
/// One implementor produces the audio for part of a note (one kit item,
/// one engine). The pool drives its lifecycle and owns it through a
/// [`NoteHandle`]; it never knows the concrete type.
pub trait SynthNote {
    /// Produce one audio block into `left`/`right`.
    fn note_out(&mut self, left: &mut [f32], right: &mut [f32]);

    /// True once the voice has fully decayed and can be reclaimed.
    fn finished(&self) -> bool;

    /// Key released: start the release portion of the envelopes.
    fn release_key(&mut self);

    /// Soft-kill: stop accepting input, die off over the natural decay
    /// tail.
    fn entomb(&mut self);

    /// Repitch in place for a legato transition.
    fn legato_note(&mut self, params: &LegatoParams);

    /// Clone this voice into `arena` for a legato mirror. `None` on
    /// exhaustion.
    fn clone_legato<'a>(&self, arena: &'a RtAllocator) -> Option<NoteHandle<'a>>;
}

/// Construct a voice in `arena` and erase its type.
pub fn note_handle<'a, T: SynthNote + 'a>(
    arena: &'a RtAllocator,
    note: T,
) -> Option<NoteHandle<'a>> {
    let ptr = arena.construct(note)?;
    let wide = ptr.as_ptr() as *mut (dyn SynthNote + 'a);
    // Same allocation, same arena; only the pointer type widens.
    Some(unsafe { Handle::from_raw_parts(NonNull::new_unchecked(wide), arena) })
}
