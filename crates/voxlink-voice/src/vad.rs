use voxlink_types::AudioFrame;

/// Decides whether an inbound frame carries speech.
///
/// One detector instance belongs to one session, so implementations may keep
/// per-connection state between calls.
pub trait VoiceActivityDetector: Send {
    fn is_voice(&mut self, frame: &AudioFrame) -> bool;

    /// Forgets any state accumulated for the current utterance.
    fn reset(&mut self) {}
}

/// Frame-size gate for DTX-encoded audio.
///
/// Encoders running with discontinuous transmission emit silent frames of a
/// few bytes, so payload size alone separates silence from speech. `onset`
/// consecutive large frames are required before voice is reported.
#[derive(Debug, Clone)]
pub struct FrameSizeVad {
    min_voice_bytes: usize,
    onset: u32,
    run: u32,
}

impl FrameSizeVad {
    pub const DEFAULT_MIN_VOICE_BYTES: usize = 12;

    pub fn new(min_voice_bytes: usize, onset: u32) -> Self {
        Self {
            min_voice_bytes,
            onset: onset.max(1),
            run: 0,
        }
    }
}

impl Default for FrameSizeVad {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MIN_VOICE_BYTES, 1)
    }
}

impl VoiceActivityDetector for FrameSizeVad {
    fn is_voice(&mut self, frame: &AudioFrame) -> bool {
        if frame.len() >= self.min_voice_bytes {
            self.run = self.run.saturating_add(1);
        } else {
            self.run = 0;
        }
        self.run >= self.onset
    }

    fn reset(&mut self) {
        self.run = 0;
    }
}
