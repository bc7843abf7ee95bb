#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// User-facing portamento settings, normally sourced from the part's
/// controller state.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PortamentoConfig {
    pub enabled: bool,
    /// Glide only when another note is already sounding.
    pub auto_mode: bool,
    /// Glide time in seconds.
    pub time: f32,
    /// Pitch-distance gate in octaves (log2 frequency distance).
    pub threshold_log2: f32,
    /// When true the glide applies only to jumps larger than the
    /// threshold; when false only to jumps smaller than it.
    pub threshold_above: bool,
}

impl Default for PortamentoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_mode: false,
            time: 0.1,
            threshold_log2: 0.25,
            threshold_above: false,
        }
    }
}

/// Live pitch-glide state, read by synth engines once per block.
///
/// `freqdelta_log2` is the log2-frequency adjustment that bends the new
/// note toward the old pitch; it ramps linearly to zero over the glide
/// time, at which point the portamento deactivates itself.
#[derive(Debug, Clone, Copy)]
pub struct Portamento {
    /// Whether the glide is still in progress.
    pub active: bool,
    /// Current pitch offset, log2 frequency.
    pub freqdelta_log2: f32,
    /// Ramp position, 0 (start) to 1 (done).
    x: f32,
    /// Ramp increment per update.
    dx: f32,
    origfreqdelta_log2: f32,
}

impl Portamento {
    /// Plan a glide from `old_log2_freq` (where the previous glide had
    /// reached `old_glide_log2_freq`) to `new_log2_freq`. Returns an
    /// inactive portamento when the config or the thresholds say no
    /// glide applies.
    pub fn new(
        config: &PortamentoConfig,
        sample_rate: f32,
        buffer_size: usize,
        is_running_note: bool,
        old_log2_freq: f32,
        old_glide_log2_freq: f32,
        new_log2_freq: f32,
    ) -> Self {
        let inactive = Self {
            active: false,
            freqdelta_log2: 0.0,
            x: 0.0,
            dx: 0.0,
            origfreqdelta_log2: 0.0,
        };

        if !config.enabled || (config.auto_mode && !is_running_note) {
            return inactive;
        }
        if old_log2_freq == new_log2_freq {
            return inactive;
        }

        let jump = (old_log2_freq - new_log2_freq).abs();
        if config.threshold_above && jump + 0.00001 < config.threshold_log2 {
            return inactive;
        }
        if !config.threshold_above && jump - 0.00001 > config.threshold_log2 {
            return inactive;
        }

        let delta = old_glide_log2_freq - new_log2_freq;
        let time = config.time.max(1.0e-3);
        Self {
            active: true,
            freqdelta_log2: delta,
            x: 0.0,
            dx: buffer_size as f32 / (time * sample_rate),
            origfreqdelta_log2: delta,
        }
    }

    /// Advance the ramp by one block.
    pub fn update(&mut self) {
        if !self.active {
            return;
        }
        self.x += self.dx;
        if self.x >= 1.0 {
            self.x = 1.0;
            self.active = false;
        }
        self.freqdelta_log2 = self.origfreqdelta_log2 * (1.0 - self.x);
    }
}

/// Allocator-owned wrapper attaching a [`Portamento`] to a note
/// descriptor.
///
/// Kept separate from the descriptor itself so its release can be
/// deferred independently of the note (a dying note's glide state may
/// outlive the key-press record). Only the primary descriptor of a
/// legato pair owns one; mirrors never do.
#[derive(Debug)]
pub struct PortamentoRealtime {
    pub portamento: Portamento,
}

impl PortamentoRealtime {
    pub fn new(portamento: Portamento) -> Self {
        Self { portamento }
    }

    pub fn update(&mut self) {
        self.portamento.update();
    }
}
