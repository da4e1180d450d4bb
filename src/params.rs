use std::sync::{atomic::Ordering, Mutex};

use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    utils::{db_to_linear, AtomicF32},
};

// -------------------------------------------------------------------------------------------------

/// Gains are bounded to +/-24 dB.
pub const MAX_GAIN_DB: f32 = 24.0;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ParameterFile {
    input_gain: f32,
    output_gain: f32,
}

// -------------------------------------------------------------------------------------------------

/// Persisted runtime parameters: input and output gain in dB.
///
/// The dB values are what is stored and reported; the linear factors are kept alongside so
/// the render callback never converts.
pub struct Parameters {
    path: Mutex<String>,
    input_gain_db: AtomicF32,
    output_gain_db: AtomicF32,
    input_gain_linear: AtomicF32,
    output_gain_linear: AtomicF32,
}

impl Parameters {
    pub fn new(path: &str) -> Self {
        let parameters = Self {
            path: Mutex::new(path.to_string()),
            input_gain_db: AtomicF32::new(0.0),
            output_gain_db: AtomicF32::new(0.0),
            input_gain_linear: AtomicF32::new(1.0),
            output_gain_linear: AtomicF32::new(1.0),
        };
        parameters.load();
        parameters
    }

    /// Re-read the backing file; keeps current values on failure.
    pub fn load(&self) {
        let path = self.path.lock().unwrap().clone();
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<ParameterFile>(&content) {
                Ok(file) => {
                    self.set_input_gain(file.input_gain);
                    self.set_output_gain(file.output_gain);
                }
                Err(err) => log::error!("invalid parameters '{}': {}", path, err),
            },
            Err(err) => log::debug!("no stored parameters at '{}': {}", path, err),
        }
    }

    /// Persist the current values.
    pub fn save(&self) -> Result<(), Error> {
        let path = self.path.lock().unwrap().clone();
        let file = ParameterFile {
            input_gain: self.input_gain(),
            output_gain: self.output_gain(),
        };
        let content =
            serde_json::to_string_pretty(&file).map_err(|err| Error::Parameter(err.to_string()))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    pub fn input_gain(&self) -> f32 {
        self.input_gain_db.load(Ordering::Relaxed)
    }

    pub fn output_gain(&self) -> f32 {
        self.output_gain_db.load(Ordering::Relaxed)
    }

    pub fn set_input_gain(&self, db: f32) {
        let clamped = clamp_gain(db);
        self.input_gain_db.store(clamped, Ordering::Relaxed);
        self.input_gain_linear
            .store(db_to_linear(clamped), Ordering::Relaxed);
    }

    pub fn set_output_gain(&self, db: f32) {
        let clamped = clamp_gain(db);
        self.output_gain_db.store(clamped, Ordering::Relaxed);
        self.output_gain_linear
            .store(db_to_linear(clamped), Ordering::Relaxed);
    }

    /// Linear input factor, for the render callback.
    pub fn input_gain_linear(&self) -> f32 {
        self.input_gain_linear.load(Ordering::Relaxed)
    }

    /// Linear output factor, for the render callback.
    pub fn output_gain_linear(&self) -> f32 {
        self.output_gain_linear.load(Ordering::Relaxed)
    }
}

fn clamp_gain(db: f32) -> f32 {
    if db.is_nan() {
        return 0.0;
    }
    db.clamp(-MAX_GAIN_DB, MAX_GAIN_DB)
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gains_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        let parameters = Parameters::new(path.to_str().unwrap());
        parameters.set_input_gain(99.0);
        assert_eq!(parameters.input_gain(), MAX_GAIN_DB);
        parameters.set_output_gain(-99.0);
        assert_eq!(parameters.output_gain(), -MAX_GAIN_DB);
        parameters.set_input_gain(f32::NAN);
        assert_eq!(parameters.input_gain(), 0.0);
    }

    #[test]
    fn round_trips_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        let parameters = Parameters::new(path.to_str().unwrap());
        parameters.set_input_gain(-6.0);
        parameters.set_output_gain(3.0);
        parameters.save().unwrap();

        let reloaded = Parameters::new(path.to_str().unwrap());
        assert_eq!(reloaded.input_gain(), -6.0);
        assert_eq!(reloaded.output_gain(), 3.0);
        assert!((reloaded.input_gain_linear() - 0.501).abs() < 0.01);
    }

    #[test]
    fn missing_file_means_unity_gain() {
        let parameters = Parameters::new("/nonexistent/params.json");
        assert_eq!(parameters.input_gain(), 0.0);
        assert_eq!(parameters.input_gain_linear(), 1.0);
        assert_eq!(parameters.output_gain_linear(), 1.0);
    }
}
