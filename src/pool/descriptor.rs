use crate::alloc::Handle;
use crate::synth::{NoteHandle, PortamentoRealtime};

/// Lifecycle state of one note descriptor.
///
/// `Off → Playing → {Released, Sustained, Latched} → Entombed`, with the
/// memory itself reclaimed only by the pool's lazy compaction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoteStatus {
    #[default]
    Off,
    Playing,
    /// Key released while the sustain pedal was down.
    Sustained,
    Released,
    /// Soft-killed: still rendering its decay tail, no longer counted as
    /// running.
    Entombed,
    /// Key released in latch mode; holds until the latch is released.
    Latched,
}

/// Pool-level record of one logical key-press and the voices it spawned.
pub struct NoteDescriptor<'a> {
    /// Blocks elapsed since the descriptor was created.
    pub age: u32,
    /// Pitch/key id.
    pub note: u8,
    /// Effect-chain routing id.
    pub sendto: u8,
    /// Secondary descriptor cloned for legato pitch-glide continuity.
    pub legato_mirror: bool,
    pub(crate) size: usize,
    pub(crate) status: NoteStatus,
    pub(crate) can_sustain: bool,
    pub(crate) portamento: Option<Handle<'a, PortamentoRealtime>>,
}

impl Default for NoteDescriptor<'_> {
    fn default() -> Self {
        Self {
            age: 0,
            note: 0,
            sendto: 0,
            legato_mirror: false,
            size: 0,
            status: NoteStatus::Off,
            can_sustain: true,
            portamento: None,
        }
    }
}

impl<'a> NoteDescriptor<'a> {
    pub fn status(&self) -> NoteStatus {
        self.status
    }

    /// Number of voice slots this descriptor owns.
    pub fn voices(&self) -> usize {
        self.size
    }

    pub fn playing(&self) -> bool {
        self.status == NoteStatus::Playing
    }

    pub fn sustained(&self) -> bool {
        self.status == NoteStatus::Sustained
    }

    pub fn released(&self) -> bool {
        self.status == NoteStatus::Released
    }

    pub fn entombed(&self) -> bool {
        self.status == NoteStatus::Entombed
    }

    pub fn latched(&self) -> bool {
        self.status == NoteStatus::Latched
    }

    /// No longer playing, for whatever reason.
    pub fn dying(&self) -> bool {
        matches!(self.status, NoteStatus::Entombed | NoteStatus::Released)
    }

    pub fn off(&self) -> bool {
        self.status == NoteStatus::Off
    }

    pub(crate) fn set_status(&mut self, status: NoteStatus) {
        self.status = status;
    }

    pub(crate) fn do_sustain(&mut self) {
        self.status = NoteStatus::Sustained;
    }

    /// Whether the descriptor may (still) enter the sustained state.
    pub fn can_sustain(&self) -> bool {
        self.can_sustain
    }

    /// Permanently bar this descriptor from sustaining. Orthogonal to
    /// the status itself; survives every transition except reclamation.
    pub(crate) fn make_unsustainable(&mut self) {
        self.can_sustain = false;
    }

    pub fn portamento(&self) -> Option<&PortamentoRealtime> {
        self.portamento.as_deref()
    }

    pub fn portamento_mut(&mut self) -> Option<&mut Handle<'a, PortamentoRealtime>> {
        self.portamento.as_mut()
    }
}

/// One voice slot: an engine-type tag, the kit item that spawned the
/// voice, and the arena-owned voice itself. An empty `note` marks the
/// slot free (or a dead voice awaiting compaction).
#[derive(Default)]
pub struct VoiceSlot<'a> {
    pub kind: u8,
    pub kit: u8,
    pub note: Option<NoteHandle<'a>>,
}

/// A freshly constructed voice handed to the pool for insertion.
pub struct VoiceEntry<'a> {
    pub kind: u8,
    pub kit: u8,
    pub note: NoteHandle<'a>,
}
