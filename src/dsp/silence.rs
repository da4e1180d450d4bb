use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use crate::{
    dsp::rms::Rms,
    utils::{unix_now, AtomicF32},
    Sample,
};

// -------------------------------------------------------------------------------------------------

const RMS_CYCLE_COUNT: usize = 4;

// -------------------------------------------------------------------------------------------------

/// State shared between the audio-thread half of the detector and its observers.
pub struct SilenceState {
    threshold_db: f32,
    start_duration: i64,
    stop_duration: i64,
    current_rms: AtomicF32,
    /// Unix second the current silence began, 0 while signal is present.
    silence_since: AtomicI64,
    /// Unix second the current signal began, 0 while silence lasts.
    signal_since: AtomicI64,
    /// Unix second the detector latched, 0 while not latched.
    latched_since: AtomicI64,
}

impl SilenceState {
    pub fn current_rms(&self) -> f32 {
        self.current_rms.load(Ordering::Relaxed)
    }

    /// True once the output was silent for longer than `start_duration`; stays true until
    /// signal has been back for longer than `stop_duration`. The asymmetry gives the
    /// fallback interlock its hysteresis.
    pub fn silence_detected(&self) -> bool {
        self.latched_since.load(Ordering::Relaxed) != 0
    }
}

// -------------------------------------------------------------------------------------------------

/// Watches the engine output for prolonged silence.
///
/// `process` runs on the audio thread and only touches atomics; `silence_detected` is read
/// from the engine worker each tick to drive the fallback.
pub struct SilenceDetector {
    state: Arc<SilenceState>,
    rms: Rms,
}

impl SilenceDetector {
    pub fn new(threshold_db: f32, start_duration: i64, stop_duration: i64) -> Self {
        let state = Arc::new(SilenceState {
            threshold_db,
            start_duration,
            stop_duration,
            current_rms: AtomicF32::new(f32::NEG_INFINITY),
            silence_since: AtomicI64::new(0),
            signal_since: AtomicI64::new(0),
            latched_since: AtomicI64::new(0),
        });
        Self {
            state,
            rms: Rms::new(RMS_CYCLE_COUNT),
        }
    }

    pub fn state(&self) -> Arc<SilenceState> {
        Arc::clone(&self.state)
    }

    pub fn process(&mut self, samples: &[Sample]) {
        self.process_at(samples, unix_now());
    }

    fn process_at(&mut self, samples: &[Sample], now: i64) {
        let rms = self.rms.process(samples);
        let state = &self.state;
        state.current_rms.store(rms, Ordering::Relaxed);

        let silent = rms <= state.threshold_db;
        if silent {
            state.signal_since.store(0, Ordering::Relaxed);
            if state.silence_since.load(Ordering::Relaxed) == 0 {
                state.silence_since.store(now, Ordering::Relaxed);
            }
            let since = state.silence_since.load(Ordering::Relaxed);
            if now - since > state.start_duration {
                state.latched_since.store(since, Ordering::Relaxed);
            }
        } else {
            state.silence_since.store(0, Ordering::Relaxed);
            if state.signal_since.load(Ordering::Relaxed) == 0 {
                state.signal_since.store(now, Ordering::Relaxed);
            }
            let since = state.signal_since.load(Ordering::Relaxed);
            if now - since > state.stop_duration {
                state.latched_since.store(0, Ordering::Relaxed);
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const LOUD: Sample = Sample::MAX / 2;

    fn feed(detector: &mut SilenceDetector, level: Sample, from: i64, to: i64) {
        // several blocks per second so the rolling window settles
        for second in from..to {
            for _ in 0..8 {
                detector.process_at(&[level; 128], second);
            }
        }
    }

    #[test]
    fn latches_after_start_duration_only() {
        let mut detector = SilenceDetector::new(-90.0, 10, 1);
        let state = detector.state();
        feed(&mut detector, 0, 100, 110);
        assert!(!state.silence_detected());
        feed(&mut detector, 0, 110, 113);
        assert!(state.silence_detected());
    }

    #[test]
    fn short_dropout_does_not_latch() {
        let mut detector = SilenceDetector::new(-90.0, 10, 1);
        let state = detector.state();
        feed(&mut detector, LOUD, 100, 105);
        feed(&mut detector, 0, 105, 110);
        feed(&mut detector, LOUD, 110, 115);
        assert!(!state.silence_detected());
    }

    #[test]
    fn unlatches_after_stop_duration() {
        let mut detector = SilenceDetector::new(-90.0, 10, 1);
        let state = detector.state();
        feed(&mut detector, 0, 100, 115);
        assert!(state.silence_detected());
        // signal returns: still latched within the stop window
        feed(&mut detector, LOUD, 115, 116);
        assert!(state.silence_detected());
        feed(&mut detector, LOUD, 116, 119);
        assert!(!state.silence_detected());
    }
}
