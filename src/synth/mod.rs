// Purpose: the capability interface between the voice pool and the
// synthesis engines it manages. The pool only ever sees `dyn SynthNote`;
// the concrete oscillator/effect math lives elsewhere.

mod note;
mod portamento;

pub use note::{note_handle, LegatoParams, NoteHandle, SynthNote};
pub use portamento::{Portamento, PortamentoConfig, PortamentoRealtime};
