// Purpose: track every currently-sounding note, enforce polyphony and
// voice limits through prioritized eviction, and lazily compact the
// descriptor/voice arena.

mod descriptor;

pub use descriptor::{NoteDescriptor, NoteStatus, VoiceEntry, VoiceSlot};

use thiserror::Error;
use tracing::{debug, warn};

use crate::alloc::{Handle, RtAllocator};
use crate::synth::{LegatoParams, PortamentoRealtime, SynthNote};
use crate::{POLYPHONY, VOICE_SLOTS};

/*
Arena Layout
============

Two fixed arrays back the pool:

    ndesc[POLYPHONY]      note descriptors (one per key-press)
    vslot[VOICE_SLOTS]    voice slots (POLYPHONY * VOICES_PER_NOTE)

Invariant: vslot is partitioned into contiguous runs matching ndesc
order. Descriptor i's voices live at

    offset(i) = sum(ndesc[0..i].size) .. offset(i) + ndesc[i].size

and everything past the last active run is empty. Killing a voice only
blanks its slot and marks the pool dirty; `cleanup` is the single
routine allowed to violate and then restore the invariant, sliding
surviving descriptors and their runs to the front in one linear pass
without reordering them.

Nothing here blocks, retries, or allocates outside the arena; every
operation is O(descriptors + voice slots) per call at worst, which is
what the audio callback's deadline requires.
*/

/// Why an insertion could not absorb the caller's voice.
///
/// On either variant the voice (and any portamento) passed to
/// [`NotePool::insert_note`] has already been released back through the
/// allocator; insertion never leaks what it does not absorb. The
/// surrounding layer logs and keeps playing without the new note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("no free note descriptor")]
    DescriptorsExhausted,
    #[error("no free voice slot")]
    VoiceSlotsExhausted,
}

/// Voice-lifecycle manager for one part.
///
/// Single-threaded by construction: it borrows its (`!Sync`) allocator,
/// so pool and arena live together on the audio thread.
pub struct NotePool<'a> {
    arena: &'a RtAllocator,
    ndesc: [NoteDescriptor<'a>; POLYPHONY],
    vslot: [VoiceSlot<'a>; VOICE_SLOTS],
    needs_cleaning: bool,
}

impl<'a> NotePool<'a> {
    pub fn new(arena: &'a RtAllocator) -> Self {
        Self {
            arena,
            ndesc: std::array::from_fn(|_| NoteDescriptor::default()),
            vslot: std::array::from_fn(|_| VoiceSlot::default()),
            needs_cleaning: false,
        }
    }

    /// The arena every voice and portamento in this pool is owned by.
    pub fn arena(&self) -> &'a RtAllocator {
        self.arena
    }

    /// Track a freshly constructed voice under (`note`, `sendto`).
    ///
    /// Reuses the most recently allocated descriptor when it was created
    /// this same tick for the same key (a kit spawning several voices for
    /// one key-press lands them all in one descriptor); otherwise takes
    /// the first free descriptor. Later voices of a merged key-press
    /// pass `portamento: None`, and the descriptor keeps the glide
    /// state the first voice brought.
    pub fn insert_note(
        &mut self,
        note: u8,
        sendto: u8,
        voice: VoiceEntry<'a>,
        portamento: Option<Handle<'a, PortamentoRealtime>>,
        legato: bool,
    ) -> Result<(), PoolError> {
        // Compact first so the new run lands at the end of the arena.
        self.cleanup();

        let Some(desc_id) = self.mergeable_descriptor(note, sendto, legato) else {
            // `voice` drops here and is freed through the allocator.
            return Err(PoolError::DescriptorsExhausted);
        };
        let Some(slot_id) = self.vslot.iter().position(|s| s.note.is_none()) else {
            return Err(PoolError::VoiceSlotsExhausted);
        };

        let desc = &mut self.ndesc[desc_id];
        desc.note = note;
        desc.sendto = sendto;
        desc.size += 1;
        desc.set_status(NoteStatus::Playing);
        desc.can_sustain = true;
        desc.legato_mirror = legato;
        if portamento.is_some() {
            desc.portamento = portamento;
        }

        self.vslot[slot_id] = VoiceSlot {
            kind: voice.kind,
            kit: voice.kit,
            note: Some(voice.note),
        };
        Ok(())
    }

    /// Either the last descriptor when the new voice can merge into it,
    /// or the first free one.
    fn mergeable_descriptor(&self, note: u8, sendto: u8, legato: bool) -> Option<usize> {
        let mut first_free = POLYPHONY;
        for (i, d) in self.ndesc.iter().enumerate() {
            if d.off() {
                first_free = i;
                break;
            }
        }

        if first_free != 0 {
            let prev = &self.ndesc[first_free - 1];
            if prev.age == 0
                && prev.note == note
                && prev.sendto == sendto
                && prev.playing()
                && prev.legato_mirror == legato
                && prev.can_sustain()
            {
                return Some(first_free - 1);
            }
        }

        if first_free == POLYPHONY {
            None
        } else {
            Some(first_free)
        }
    }

    /// Clone every playing voice into a parallel mirror descriptor in
    /// preparation for legato retriggering.
    pub fn upgrade_to_legato(&mut self) {
        self.cleanup();
        let active = self.active_len();
        for i in 0..active {
            if !self.ndesc[i].playing() {
                continue;
            }
            let (note, sendto) = (self.ndesc[i].note, self.ndesc[i].sendto);
            for slot in self.voice_run(i) {
                self.insert_legato_note(note, sendto, slot);
            }
        }
    }

    /// Clone the voice in `slot` as a legato mirror of (`note`,
    /// `sendto`). Mirrors never carry portamento state. Failure drops
    /// the clone and is logged, not propagated: the primary keeps
    /// sounding.
    pub fn insert_legato_note(&mut self, note: u8, sendto: u8, slot: usize) {
        let (kind, kit, cloned) = {
            let s = &self.vslot[slot];
            let Some(voice) = &s.note else { return };
            (s.kind, s.kit, voice.clone_legato(self.arena))
        };
        let Some(cloned) = cloned else {
            warn!(note, "failed to clone legato note");
            return;
        };
        let entry = VoiceEntry {
            kind,
            kit,
            note: cloned,
        };
        if let Err(err) = self.insert_note(note, sendto, entry, None, true) {
            warn!(note, %err, "failed to insert legato note");
        }
    }

    /// Repitch every non-dying descriptor in place and forward the
    /// legato parameters to each of its voices.
    ///
    /// Releasing legato pairs from an earlier transition may still sit
    /// in the pool; those are left untouched. Only a primary (non-
    /// mirror) descriptor adopts the new portamento (handing it to the
    /// mirror as well would double-update the glide), and an absent
    /// portamento never clears the state a descriptor already owns.
    pub fn apply_legato(
        &mut self,
        note: u8,
        params: &LegatoParams,
        portamento: Option<Handle<'a, PortamentoRealtime>>,
    ) {
        self.cleanup();
        let active = self.active_len();
        let mut portamento = portamento;
        for i in 0..active {
            if self.ndesc[i].dying() {
                continue;
            }
            self.ndesc[i].note = note;
            if !self.ndesc[i].legato_mirror {
                if let Some(p) = portamento.take() {
                    self.ndesc[i].portamento = Some(p);
                }
            }
            for slot in self.voice_run(i) {
                if let Some(voice) = &mut self.vslot[slot].note {
                    voice.legato_note(params);
                }
            }
        }
    }

    /// Permanently bar `note`'s descriptors from sustaining; a
    /// descriptor already sustained is released on the spot.
    pub fn make_unsustainable(&mut self, note: u8) {
        self.cleanup();
        for i in 0..self.active_len() {
            if self.ndesc[i].note != note {
                continue;
            }
            self.ndesc[i].make_unsustainable();
            if self.ndesc[i].sustained() {
                self.release(i);
            }
        }
    }

    /// Key released: matching playing descriptors move to `Released`.
    pub fn release_note(&mut self, note: u8) {
        self.cleanup();
        for i in 0..self.active_len() {
            if self.ndesc[i].note == note && self.ndesc[i].playing() {
                self.release(i);
            }
        }
    }

    /// Key released with the sustain pedal down: matching playing
    /// descriptors sustain if they still may, otherwise release.
    pub fn sustain_note(&mut self, note: u8) {
        self.cleanup();
        for i in 0..self.active_len() {
            if self.ndesc[i].note != note || !self.ndesc[i].playing() {
                continue;
            }
            if self.ndesc[i].can_sustain() {
                self.ndesc[i].do_sustain();
            } else {
                self.release(i);
            }
        }
    }

    /// Key released in latch mode: matching playing descriptors latch
    /// instead of releasing.
    pub fn latch_note(&mut self, note: u8) {
        self.cleanup();
        for i in 0..self.active_len() {
            if self.ndesc[i].note == note && self.ndesc[i].playing() {
                self.latch(i);
            }
        }
    }

    /// Release everything that still sounds (playing, sustained or
    /// latched).
    pub fn release_playing_notes(&mut self) {
        self.cleanup();
        for i in 0..self.active_len() {
            let d = &self.ndesc[i];
            if d.playing() || d.sustained() || d.latched() {
                self.release(i);
            }
        }
    }

    /// Sustain pedal lifted: release every sustained descriptor.
    pub fn release_sustaining_notes(&mut self) {
        self.cleanup();
        for i in 0..self.active_len() {
            if self.ndesc[i].sustained() {
                self.release(i);
            }
        }
    }

    /// Latch released: release every latched descriptor.
    pub fn release_latched(&mut self) {
        self.cleanup();
        for i in 0..self.active_len() {
            if self.ndesc[i].latched() {
                self.release(i);
            }
        }
    }

    /// Move descriptor `idx` to `Released` and start every owned
    /// voice's release phase.
    pub fn release(&mut self, idx: usize) {
        self.ndesc[idx].set_status(NoteStatus::Released);
        for slot in self.voice_run(idx) {
            if let Some(voice) = &mut self.vslot[slot].note {
                voice.release_key();
            }
        }
    }

    /// Latch descriptor `idx`; no voice-side effect.
    pub fn latch(&mut self, idx: usize) {
        self.ndesc[idx].set_status(NoteStatus::Latched);
    }

    /// Hard-kill descriptor `idx`: free every owned voice and any
    /// attached portamento through the allocator, then leave the slot
    /// for the next compaction pass.
    pub fn kill(&mut self, idx: usize) {
        for slot in self.voice_run(idx) {
            self.vslot[slot].note = None;
        }
        self.ndesc[idx].set_status(NoteStatus::Off);
        self.ndesc[idx].portamento = None;
        self.needs_cleaning = true;
    }

    /// Kill every descriptor sounding `note`.
    pub fn kill_note(&mut self, note: u8) {
        self.cleanup();
        for i in 0..self.active_len() {
            if self.ndesc[i].note == note {
                self.kill(i);
            }
        }
    }

    /// Kill the whole pool.
    pub fn kill_all_notes(&mut self) {
        self.cleanup();
        for i in 0..self.active_len() {
            self.kill(i);
        }
    }

    /// Soft-kill descriptor `idx`: voices stop accepting input but keep
    /// rendering until their decay tail reports `finished()`, at which
    /// point [`reap_finished`](Self::reap_finished) reclaims them.
    pub fn entomb(&mut self, idx: usize) {
        self.ndesc[idx].set_status(NoteStatus::Entombed);
        for slot in self.voice_run(idx) {
            if let Some(voice) = &mut self.vslot[slot].note {
                voice.entomb();
            }
        }
    }

    /// Advance every active glide by one block.
    pub fn update_portamentos(&mut self) {
        self.cleanup();
        for d in self.ndesc.iter_mut().take_while(|d| d.size != 0) {
            if let Some(glide) = d.portamento.as_mut() {
                glide.update();
            }
        }
    }

    /// Free every voice that reports `finished()`, marking the pool
    /// dirty for the next compaction. Called once per audio block after
    /// rendering.
    pub fn reap_finished(&mut self) {
        for slot in &mut self.vslot {
            if slot.note.as_ref().is_some_and(|v| v.finished()) {
                slot.note = None; // handle drop frees through the arena
                self.needs_cleaning = true;
            }
        }
    }

    /// Age every active descriptor by one block.
    pub fn tick(&mut self) {
        self.cleanup();
        for d in &mut self.ndesc {
            if d.size == 0 {
                break;
            }
            d.age += 1;
        }
    }

    /// Visit every live voice with its descriptor, in arena order; the
    /// per-block render loop.
    pub fn for_each_voice(&mut self, mut f: impl FnMut(&NoteDescriptor<'a>, &mut (dyn SynthNote + 'a))) {
        self.cleanup();
        let mut start = 0;
        for d in self.ndesc.iter().take_while(|d| d.size != 0) {
            for slot in &mut self.vslot[start..start + d.size] {
                if let Some(voice) = &mut slot.note {
                    f(d, &mut **voice);
                }
            }
            start += d.size;
        }
    }

    /// Lazy compaction. Runs only when a kill/reap has left holes:
    /// recounts each descriptor's surviving voices, slides surviving
    /// descriptors to the front (never reordering them), releases
    /// orphaned portamento state, slides the voice runs to match and
    /// blanks the freed tails.
    pub fn cleanup(&mut self) {
        if !self.needs_cleaning {
            return;
        }
        self.needs_cleaning = false;

        let mut last_valid = 0;
        for (i, d) in self.ndesc.iter().enumerate() {
            if !d.off() {
                last_valid = i;
            }
        }

        // Current run lengths, and the lengths after discarding dead
        // slots.
        let mut cur_len = [0usize; POLYPHONY];
        let mut new_len = [0usize; POLYPHONY];
        let mut cum_old = 0;
        for i in 0..=last_valid {
            cur_len[i] = self.ndesc[i].size;
            for _ in 0..cur_len[i] {
                if self.vslot[cum_old].note.is_some() {
                    new_len[i] += 1;
                }
                cum_old += 1;
            }
        }

        // Slide the descriptors.
        let mut cum_new = 0;
        for i in 0..=last_valid {
            self.ndesc[i].size = new_len[i];
            if new_len[i] != 0 {
                if cum_new != i {
                    self.ndesc[cum_new] = std::mem::take(&mut self.ndesc[i]);
                }
                cum_new += 1;
            } else {
                // Dropping the descriptor frees any orphaned portamento.
                self.ndesc[i] = NoteDescriptor::default();
            }
        }
        for i in cum_new..POLYPHONY {
            self.ndesc[i] = NoteDescriptor::default();
        }

        // Slide the voice runs to match.
        let total: usize = cur_len[..=last_valid].iter().sum();
        let mut slot_new = 0;
        for i in 0..total {
            if self.vslot[i].note.is_some() {
                if slot_new != i {
                    self.vslot[slot_new] = std::mem::take(&mut self.vslot[i]);
                }
                slot_new += 1;
            }
        }
        for i in slot_new..VOICE_SLOTS {
            self.vslot[i] = VoiceSlot::default();
        }
    }

    /// Count of distinct pitches currently playing, sustained or
    /// latched.
    pub fn running_notes(&mut self) -> usize {
        self.cleanup();
        let mut seen = [false; 256];
        let mut count = 0;
        for d in self.ndesc.iter().take_while(|d| d.size != 0) {
            if !(d.playing() || d.sustained() || d.latched()) {
                continue;
            }
            if seen[d.note as usize] {
                continue;
            }
            seen[d.note as usize] = true;
            count += 1;
        }
        count
    }

    pub fn has_running_note(&mut self) -> bool {
        self.running_notes() != 0
    }

    /// Evict at most one descriptor to move toward `limit` distinct
    /// running pitches. The victim is preferably a note that actually
    /// counts as running (killing an already-dying one would not lower
    /// the count), oldest first; it is killed outright when already
    /// dying or sustained, entombed for a graceful tail when it was
    /// actively playing.
    pub fn enforce_key_limit(&mut self, limit: usize) {
        if self.running_notes() <= limit {
            return;
        }

        let active = self.active_len();
        let mut to_kill: Option<usize> = None;
        let mut oldest = 0u32;
        for i in 0..active {
            let age = self.ndesc[i].age;
            match to_kill {
                None => {
                    // There must be something to kill
                    oldest = age;
                    to_kill = Some(i);
                }
                Some(k) => {
                    let victim_dying = self.ndesc[k].dying();
                    let victim_playing = self.ndesc[k].playing();
                    let nd = &self.ndesc[i];
                    if victim_dying && nd.playing() {
                        // Prefer to evict a running note
                        oldest = age;
                        to_kill = Some(i);
                    } else if age > oldest && !(victim_playing && nd.dying()) {
                        // Take an older note as long as that does not
                        // trade a running victim for a dying one
                        oldest = age;
                        to_kill = Some(i);
                    }
                }
            }
        }

        if let Some(k) = to_kill {
            if self.ndesc[k].dying() || self.ndesc[k].sustained() {
                self.kill(k);
            } else {
                self.entomb(k);
            }
        }
    }

    /// Count of non-entombed descriptors. Entombed ones are about to be
    /// dropped and no longer cost a limit slot; pitches are *not*
    /// deduplicated here; a kit-doubled note deliberately costs two.
    pub fn running_voices(&mut self) -> usize {
        self.cleanup();
        self.ndesc
            .iter()
            .take_while(|d| d.size != 0)
            .filter(|d| !d.entombed())
            .count()
    }

    /// Silence the one descriptor whose loss is least intrusive.
    ///
    /// Strict tier priority: released, then sustained, then latched,
    /// then playing. Within a tier, prefer the oldest descriptor
    /// sounding `preferred_note`, falling back to the oldest overall:
    /// stealing a repeat of the incoming note is less audible than
    /// cutting something still carrying distinct material.
    pub fn limit_voice(&mut self, preferred_note: u8) {
        self.cleanup();
        let active = self.active_len();

        let mut best: [Option<(usize, u32)>; 4] = [None; 4];
        let mut best_same: [Option<(usize, u32)>; 4] = [None; 4];
        for i in 0..active {
            let nd = &self.ndesc[i];
            let tier = if nd.released() {
                0
            } else if nd.sustained() {
                1
            } else if nd.latched() {
                2
            } else if nd.playing() {
                3
            } else {
                continue;
            };
            if best[tier].map_or(true, |(_, age)| nd.age > age) {
                best[tier] = Some((i, nd.age));
            }
            if nd.note == preferred_note && best_same[tier].map_or(true, |(_, age)| nd.age > age) {
                best_same[tier] = Some((i, nd.age));
            }
        }

        for tier in 0..4 {
            if let Some((victim, _)) = best_same[tier].or(best[tier]) {
                self.entomb(victim);
                return;
            }
        }
        // Nothing to take: a logical error upstream, but nothing useful
        // to do about it here.
    }

    /// Entomb victims until at most `limit` descriptors are running.
    pub fn enforce_voice_limit(&mut self, limit: usize, preferred_note: u8) {
        let mut excess = self.running_voices() as isize - limit as isize;
        while excess > 0 {
            self.limit_voice(preferred_note);
            excess -= 1;
        }
    }

    /// Compacted view of the active descriptors.
    pub fn descriptors(&mut self) -> &[NoteDescriptor<'a>] {
        self.cleanup();
        let n = self.active_len();
        &self.ndesc[..n]
    }

    /// Number of descriptors in use.
    pub fn used_note_desc(&mut self) -> usize {
        self.cleanup();
        self.ndesc.iter().filter(|d| d.size != 0).count()
    }

    /// Number of voice slots in use.
    pub fn used_voice_desc(&mut self) -> usize {
        self.cleanup();
        self.vslot.iter().filter(|s| s.note.is_some()).count()
    }

    /// No descriptor left for a new key-press.
    pub fn pool_full(&mut self) -> bool {
        self.cleanup();
        self.ndesc.iter().all(|d| !d.off())
    }

    /// Fewer than `needed` voice slots left.
    pub fn voice_pool_full(&mut self, needed: usize) -> bool {
        self.cleanup();
        let used: usize = self
            .ndesc
            .iter()
            .take_while(|d| d.size != 0)
            .map(|d| d.size)
            .sum();
        VOICE_SLOTS - used < needed
    }

    /// Log the compacted pool state, one line per voice.
    pub fn dump(&mut self) {
        self.cleanup();
        debug!("note pool dump");
        let mut start = 0;
        for (i, d) in self.ndesc.iter().take_while(|d| d.size != 0).enumerate() {
            for slot in &self.vslot[start..start + d.size] {
                debug!(
                    descriptor = i,
                    age = d.age,
                    note = d.note,
                    sendto = d.sendto,
                    status = ?d.status(),
                    legato = d.legato_mirror,
                    kind = slot.kind,
                    kit = slot.kit,
                    live = slot.note.is_some(),
                    "voice"
                );
            }
            start += d.size;
        }
    }

    fn active_len(&self) -> usize {
        self.ndesc.iter().take_while(|d| d.size != 0).count()
    }

    /// Slot range owned by descriptor `idx`: the running prefix sum of
    /// the preceding descriptors' sizes.
    fn voice_run(&self, idx: usize) -> std::ops::Range<usize> {
        let start: usize = self.ndesc[..idx].iter().map(|d| d.size).sum();
        start..start + self.ndesc[idx].size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use crate::synth::{note_handle, NoteHandle, Portamento, PortamentoConfig};

    #[derive(Default)]
    struct VoiceLog {
        released: u32,
        entombed: u32,
        dropped: u32,
        legato: u32,
        cloned: u32,
    }

    struct TestNote {
        log: Rc<RefCell<VoiceLog>>,
        finished: Rc<Cell<bool>>,
        log2_freq: f32,
    }

    impl Drop for TestNote {
        fn drop(&mut self) {
            self.log.borrow_mut().dropped += 1;
        }
    }

    impl SynthNote for TestNote {
        fn note_out(&mut self, _left: &mut [f32], _right: &mut [f32]) {}
        fn finished(&self) -> bool {
            self.finished.get()
        }
        fn release_key(&mut self) {
            self.log.borrow_mut().released += 1;
        }
        fn entomb(&mut self) {
            self.log.borrow_mut().entombed += 1;
        }
        fn legato_note(&mut self, params: &LegatoParams) {
            self.log.borrow_mut().legato += 1;
            self.log2_freq = params.note_log2_freq;
        }
        fn clone_legato<'a>(&self, arena: &'a RtAllocator) -> Option<NoteHandle<'a>> {
            self.log.borrow_mut().cloned += 1;
            note_handle(
                arena,
                TestNote {
                    log: self.log.clone(),
                    finished: self.finished.clone(),
                    log2_freq: self.log2_freq,
                },
            )
        }
    }

    fn voice<'a>(
        mem: &'a RtAllocator,
        log: &Rc<RefCell<VoiceLog>>,
        finished: &Rc<Cell<bool>>,
    ) -> VoiceEntry<'a> {
        VoiceEntry {
            kind: 0,
            kit: 0,
            note: note_handle(
                mem,
                TestNote {
                    log: log.clone(),
                    finished: finished.clone(),
                    log2_freq: 8.0,
                },
            )
            .unwrap(),
        }
    }

    fn glide(mem: &RtAllocator) -> Handle<'_, PortamentoRealtime> {
        let config = PortamentoConfig {
            enabled: true,
            auto_mode: false,
            time: 0.1,
            threshold_log2: 4.0,
            threshold_above: false,
        };
        let p = Portamento::new(&config, 48_000.0, 256, false, 9.0, 9.0, 8.0);
        Handle::new(mem, PortamentoRealtime::new(p)).unwrap()
    }

    #[test]
    fn distinct_notes_get_distinct_descriptors() {
        let mem = RtAllocator::new();
        let log = Rc::new(RefCell::new(VoiceLog::default()));
        let fin = Rc::new(Cell::new(false));
        let mut pool = NotePool::new(&mem);

        for n in [60u8, 64, 67] {
            pool.insert_note(n, 0, voice(&mem, &log, &fin), None, false)
                .unwrap();
        }
        assert_eq!(pool.used_note_desc(), 3);
        assert_eq!(pool.used_voice_desc(), 3);
        assert_eq!(pool.running_notes(), 3);
        assert!(pool.descriptors().iter().all(|d| d.playing()));
    }

    #[test]
    fn same_tick_kit_voices_merge_into_one_descriptor() {
        let mem = RtAllocator::new();
        let log = Rc::new(RefCell::new(VoiceLog::default()));
        let fin = Rc::new(Cell::new(false));
        let mut pool = NotePool::new(&mem);

        pool.insert_note(60, 0, voice(&mem, &log, &fin), Some(glide(&mem)), false)
            .unwrap();
        pool.insert_note(60, 0, voice(&mem, &log, &fin), None, false)
            .unwrap();

        assert_eq!(pool.used_note_desc(), 1);
        assert_eq!(pool.used_voice_desc(), 2);
        assert_eq!(pool.descriptors()[0].voices(), 2);
        assert!(pool.descriptors()[0].portamento().is_some());
    }

    #[test]
    fn aged_descriptor_is_never_merged_into() {
        let mem = RtAllocator::new();
        let log = Rc::new(RefCell::new(VoiceLog::default()));
        let fin = Rc::new(Cell::new(false));
        let mut pool = NotePool::new(&mem);

        pool.insert_note(60, 0, voice(&mem, &log, &fin), None, false)
            .unwrap();
        pool.tick();
        pool.insert_note(60, 0, voice(&mem, &log, &fin), None, false)
            .unwrap();

        assert_eq!(pool.used_note_desc(), 2);
    }

    #[test]
    fn descriptor_exhaustion_frees_the_rejected_voice() {
        let mem = RtAllocator::new();
        let log = Rc::new(RefCell::new(VoiceLog::default()));
        let fin = Rc::new(Cell::new(false));
        let mut pool = NotePool::new(&mem);

        for n in 0..POLYPHONY {
            pool.insert_note(n as u8, 0, voice(&mem, &log, &fin), None, false)
                .unwrap();
        }
        assert!(pool.pool_full());

        let err = pool
            .insert_note(200, 0, voice(&mem, &log, &fin), None, false)
            .unwrap_err();
        assert_eq!(err, PoolError::DescriptorsExhausted);
        assert_eq!(log.borrow().dropped, 1);
    }

    #[test]
    fn voice_slot_exhaustion_frees_the_rejected_voice() {
        let mem = RtAllocator::new();
        let log = Rc::new(RefCell::new(VoiceLog::default()));
        let fin = Rc::new(Cell::new(false));
        let mut pool = NotePool::new(&mem);

        for _ in 0..VOICE_SLOTS {
            pool.insert_note(60, 0, voice(&mem, &log, &fin), None, false)
                .unwrap();
        }
        assert_eq!(pool.used_note_desc(), 1);
        assert!(pool.voice_pool_full(1));

        let err = pool
            .insert_note(60, 0, voice(&mem, &log, &fin), None, false)
            .unwrap_err();
        assert_eq!(err, PoolError::VoiceSlotsExhausted);
        assert_eq!(log.borrow().dropped, 1);
    }

    #[test]
    fn kill_frees_voices_and_portamento_back_to_the_arena() {
        let mem = RtAllocator::new();
        let baseline = mem.free_bytes();
        let log = Rc::new(RefCell::new(VoiceLog::default()));
        let fin = Rc::new(Cell::new(false));
        let mut pool = NotePool::new(&mem);

        pool.insert_note(60, 0, voice(&mem, &log, &fin), Some(glide(&mem)), false)
            .unwrap();
        pool.insert_note(60, 0, voice(&mem, &log, &fin), None, false)
            .unwrap();

        pool.release_note(60);
        assert_eq!(log.borrow().released, 2);
        assert!(pool.descriptors()[0].released());

        pool.kill_all_notes();
        assert_eq!(pool.used_note_desc(), 0);
        assert_eq!(pool.used_voice_desc(), 0);
        assert_eq!(log.borrow().dropped, 2);
        assert_eq!(mem.free_bytes(), baseline);
    }

    #[test]
    fn compaction_preserves_descriptor_order() {
        let mem = RtAllocator::new();
        let log = Rc::new(RefCell::new(VoiceLog::default()));
        let fin = Rc::new(Cell::new(false));
        let mut pool = NotePool::new(&mem);

        for n in [60u8, 64, 67] {
            pool.insert_note(n, 0, voice(&mem, &log, &fin), None, false)
                .unwrap();
            pool.tick();
        }
        pool.kill_note(64);

        let notes: Vec<u8> = pool.descriptors().iter().map(|d| d.note).collect();
        assert_eq!(notes, vec![60, 67]);
        assert!(pool.descriptors()[0].age > pool.descriptors()[1].age);
        assert_eq!(pool.used_voice_desc(), 2);
    }

    #[test]
    fn compaction_packs_voices_into_exact_descriptor_runs() {
        let mem = RtAllocator::new();
        let log = Rc::new(RefCell::new(VoiceLog::default()));
        let fin_early = Rc::new(Cell::new(false));
        let fin = Rc::new(Cell::new(false));
        let mut pool = NotePool::new(&mem);

        let entry = |kit: u8, fin: &Rc<Cell<bool>>| VoiceEntry {
            kind: 0,
            kit,
            note: note_handle(
                &mem,
                TestNote {
                    log: log.clone(),
                    finished: fin.clone(),
                    log2_freq: 8.0,
                },
            )
            .unwrap(),
        };

        pool.insert_note(60, 0, entry(1, &fin_early), None, false).unwrap();
        pool.insert_note(60, 0, entry(2, &fin), None, false).unwrap();
        pool.tick();
        pool.insert_note(64, 0, entry(3, &fin), None, false).unwrap();
        pool.insert_note(64, 0, entry(4, &fin), None, false).unwrap();
        pool.tick();
        pool.insert_note(67, 0, entry(5, &fin), None, false).unwrap();
        pool.insert_note(67, 0, entry(6, &fin), None, false).unwrap();

        // Punch holes at both ends of the arena: kill the middle run
        // outright and reap one voice out of the first.
        pool.kill_note(64);
        fin_early.set(true);
        pool.reap_finished();
        pool.cleanup();

        // Survivors occupy an exact descriptor prefix.
        assert_eq!(pool.active_len(), 2);
        assert_eq!((pool.ndesc[0].note, pool.ndesc[0].size), (60, 1));
        assert_eq!((pool.ndesc[1].note, pool.ndesc[1].size), (67, 2));
        assert!(pool.ndesc[2..].iter().all(|d| d.off() && d.size == 0));

        // Every surviving voice sits in the slot run its descriptor's
        // (offset, size) predicts, in insertion order, and nothing lives
        // past the packed prefix.
        let expected_kits: [&[u8]; 2] = [&[2], &[5, 6]];
        let mut offset = 0;
        for (d, kits) in pool.ndesc[..2].iter().zip(expected_kits) {
            for (slot, kit) in pool.vslot[offset..offset + d.size].iter().zip(kits) {
                assert!(slot.note.is_some());
                assert_eq!(slot.kit, *kit);
            }
            offset += d.size;
        }
        assert!(pool.vslot[offset..].iter().all(|s| s.note.is_none()));
    }

    #[test]
    fn finished_voices_are_reaped_and_compacted() {
        let mem = RtAllocator::new();
        let log = Rc::new(RefCell::new(VoiceLog::default()));
        let fin_a = Rc::new(Cell::new(false));
        let fin_b = Rc::new(Cell::new(false));
        let mut pool = NotePool::new(&mem);

        pool.insert_note(60, 0, voice(&mem, &log, &fin_a), None, false)
            .unwrap();
        pool.insert_note(60, 0, voice(&mem, &log, &fin_a), None, false)
            .unwrap();
        pool.tick();
        pool.insert_note(64, 0, voice(&mem, &log, &fin_b), None, false)
            .unwrap();

        fin_a.set(true);
        pool.reap_finished();

        assert_eq!(pool.used_note_desc(), 1);
        assert_eq!(pool.descriptors()[0].note, 64);
        assert_eq!(log.borrow().dropped, 2);
    }

    #[test]
    fn sustain_pedal_and_unsustainable_notes() {
        let mem = RtAllocator::new();
        let log = Rc::new(RefCell::new(VoiceLog::default()));
        let fin = Rc::new(Cell::new(false));
        let mut pool = NotePool::new(&mem);

        pool.insert_note(60, 0, voice(&mem, &log, &fin), None, false)
            .unwrap();
        pool.tick();
        pool.insert_note(64, 0, voice(&mem, &log, &fin), None, false)
            .unwrap();

        pool.sustain_note(60);
        assert!(pool.descriptors()[0].sustained());
        assert_eq!(pool.running_notes(), 2);

        pool.make_unsustainable(64);
        pool.sustain_note(64);
        assert!(pool.descriptors()[1].released());

        pool.release_sustaining_notes();
        assert!(pool.descriptors()[0].released());
        assert_eq!(log.borrow().released, 2);
    }

    #[test]
    fn latched_notes_hold_until_latch_release() {
        let mem = RtAllocator::new();
        let log = Rc::new(RefCell::new(VoiceLog::default()));
        let fin = Rc::new(Cell::new(false));
        let mut pool = NotePool::new(&mem);

        pool.insert_note(60, 0, voice(&mem, &log, &fin), None, false)
            .unwrap();
        pool.latch_note(60);
        assert!(pool.descriptors()[0].latched());
        assert_eq!(pool.running_notes(), 1);

        pool.release_latched();
        assert!(pool.descriptors()[0].released());
        assert_eq!(log.borrow().released, 1);
    }

    #[test]
    fn key_limit_evicts_oldest_running_notes() {
        let mem = RtAllocator::new();
        let log = Rc::new(RefCell::new(VoiceLog::default()));
        let fin = Rc::new(Cell::new(false));
        let mut pool = NotePool::new(&mem);

        for n in [60u8, 61, 62, 63, 64] {
            pool.insert_note(n, 0, voice(&mem, &log, &fin), None, false)
                .unwrap();
            pool.tick();
        }

        pool.enforce_key_limit(3);
        pool.enforce_key_limit(3);
        assert_eq!(pool.running_notes(), 3);
        assert_eq!(log.borrow().entombed, 2);

        let playing: Vec<u8> = pool
            .descriptors()
            .iter()
            .filter(|d| d.playing())
            .map(|d| d.note)
            .collect();
        assert_eq!(playing, vec![62, 63, 64]);

        // At the limit: a further call takes nothing.
        pool.enforce_key_limit(3);
        assert_eq!(log.borrow().entombed, 2);
    }

    #[test]
    fn voice_limit_takes_released_before_playing() {
        let mem = RtAllocator::new();
        let log = Rc::new(RefCell::new(VoiceLog::default()));
        let fin = Rc::new(Cell::new(false));
        let mut pool = NotePool::new(&mem);

        pool.insert_note(60, 0, voice(&mem, &log, &fin), None, false)
            .unwrap();
        pool.tick();
        pool.insert_note(64, 0, voice(&mem, &log, &fin), None, false)
            .unwrap();
        pool.release_note(60);

        pool.enforce_voice_limit(1, 70);
        assert!(pool.descriptors()[0].entombed());
        assert!(pool.descriptors()[1].playing());
        assert_eq!(pool.running_voices(), 1);
    }

    #[test]
    fn voice_limit_prefers_oldest_same_note() {
        let mem = RtAllocator::new();
        let log = Rc::new(RefCell::new(VoiceLog::default()));
        let fin = Rc::new(Cell::new(false));
        let mut pool = NotePool::new(&mem);

        pool.insert_note(71, 0, voice(&mem, &log, &fin), None, false)
            .unwrap();
        for _ in 0..4 {
            pool.tick();
        }
        pool.insert_note(69, 0, voice(&mem, &log, &fin), None, false)
            .unwrap();
        for _ in 0..4 {
            pool.tick();
        }
        pool.insert_note(69, 0, voice(&mem, &log, &fin), None, false)
            .unwrap();
        pool.tick();

        // Ages: 71 -> 9, first 69 -> 5, second 69 -> 1. All released and
        // the new key-press is another 69: the oldest *same-note*
        // descriptor goes, not the oldest overall.
        pool.release_playing_notes();
        pool.limit_voice(69);

        let entombed: Vec<(u8, u32)> = pool
            .descriptors()
            .iter()
            .filter(|d| d.entombed())
            .map(|d| (d.note, d.age))
            .collect();
        assert_eq!(entombed, vec![(69, 5)]);
    }

    #[test]
    fn legato_transition_mirrors_and_repitches() {
        let mem = RtAllocator::new();
        let log = Rc::new(RefCell::new(VoiceLog::default()));
        let fin = Rc::new(Cell::new(false));
        let mut pool = NotePool::new(&mem);

        pool.insert_note(60, 0, voice(&mem, &log, &fin), Some(glide(&mem)), false)
            .unwrap();
        pool.upgrade_to_legato();

        assert_eq!(pool.used_note_desc(), 2);
        assert_eq!(log.borrow().cloned, 1);
        {
            let descs = pool.descriptors();
            assert!(!descs[0].legato_mirror);
            assert!(descs[1].legato_mirror);
            assert!(descs[0].portamento().is_some());
            assert!(descs[1].portamento().is_none());
        }

        let params = LegatoParams {
            velocity: 0.8,
            portamento: false,
            note_log2_freq: 7.5,
            extern_call: true,
            seed: 1,
        };
        pool.apply_legato(64, &params, None);

        assert_eq!(log.borrow().legato, 2);
        assert!(pool.descriptors().iter().all(|d| d.note == 64));
        // An absent portamento does not clear the glide the primary owns.
        assert!(pool.descriptors()[0].portamento().is_some());
    }

    #[test]
    fn apply_legato_skips_dying_descriptors() {
        let mem = RtAllocator::new();
        let log = Rc::new(RefCell::new(VoiceLog::default()));
        let fin = Rc::new(Cell::new(false));
        let mut pool = NotePool::new(&mem);

        pool.insert_note(60, 0, voice(&mem, &log, &fin), None, false)
            .unwrap();
        pool.tick();
        pool.insert_note(64, 0, voice(&mem, &log, &fin), None, false)
            .unwrap();
        pool.release_note(60);

        let params = LegatoParams {
            velocity: 0.8,
            portamento: false,
            note_log2_freq: 7.5,
            extern_call: true,
            seed: 1,
        };
        pool.apply_legato(65, &params, None);

        assert_eq!(pool.descriptors()[0].note, 60);
        assert_eq!(pool.descriptors()[1].note, 65);
        assert_eq!(log.borrow().legato, 1);
    }

    #[test]
    fn render_loop_visits_voices_in_arena_order() {
        let mem = RtAllocator::new();
        let log = Rc::new(RefCell::new(VoiceLog::default()));
        let fin = Rc::new(Cell::new(false));
        let mut pool = NotePool::new(&mem);

        pool.insert_note(60, 0, voice(&mem, &log, &fin), None, false)
            .unwrap();
        pool.insert_note(60, 0, voice(&mem, &log, &fin), None, false)
            .unwrap();
        pool.tick();
        pool.insert_note(64, 0, voice(&mem, &log, &fin), None, false)
            .unwrap();

        let mut seen = Vec::new();
        let mut left = [0.0f32; 8];
        let mut right = [0.0f32; 8];
        pool.for_each_voice(|d, v| {
            v.note_out(&mut left, &mut right);
            seen.push(d.note);
        });
        assert_eq!(seen, vec![60, 60, 64]);
    }
}
