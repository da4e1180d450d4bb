use crate::Sample;

// -------------------------------------------------------------------------------------------------

/// Plain phase-accumulator sine generator for the emergency tone.
pub struct SineOscillator {
    sample_rate: u32,
    omega: f64,
    delta_omega: f64,
}

impl SineOscillator {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            omega: 0.0,
            delta_omega: 0.0,
        }
    }

    pub fn set_frequency(&mut self, frequency: f64) {
        self.delta_omega = frequency / self.sample_rate as f64;
    }

    pub fn reset(&mut self) {
        self.omega = 0.0;
    }

    pub fn process_f64(&mut self) -> f64 {
        let sample = (self.omega * std::f64::consts::TAU).sin();
        self.omega += self.delta_omega;
        if self.omega >= 1.0 {
            self.omega -= 1.0;
        }
        sample
    }

    pub fn process(&mut self) -> Sample {
        (self.process_f64() * Sample::MAX as f64).round() as Sample
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_a_full_scale_sine() {
        let mut osc = SineOscillator::new(44100);
        osc.set_frequency(1000.0);
        let mut min = Sample::MAX;
        let mut max = Sample::MIN;
        for _ in 0..44100 {
            let sample = osc.process();
            min = min.min(sample);
            max = max.max(sample);
        }
        assert!(max >= Sample::MAX - 50);
        assert!(min <= Sample::MIN + 50);
    }

    #[test]
    fn completes_the_expected_number_of_cycles() {
        let mut osc = SineOscillator::new(44100);
        osc.set_frequency(1000.0);
        // count positive zero crossings over exactly one second
        let mut crossings = 0;
        let mut last = 0.0f64;
        for _ in 0..44100 {
            let sample = osc.process_f64();
            if last < 0.0 && sample >= 0.0 {
                crossings += 1;
            }
            last = sample;
        }
        assert!((999..=1001).contains(&crossings), "{}", crossings);
    }
}
