//! Borrowed view of one inference window and its place on the session timeline.

/// A fixed-length slice of mono PCM handed to inference.
///
/// `start_sample` counts samples consumed since the pipeline was created (or
/// last reset), so the window's time stays correct across stride consumes.
#[derive(Debug, Clone, Copy)]
pub struct AudioWindow<'a> {
    pub samples: &'a [f32],
    pub start_sample: u64,
    pub sample_rate: u32,
}

impl<'a> AudioWindow<'a> {
    pub fn new(samples: &'a [f32], start_sample: u64, sample_rate: u32) -> Self {
        Self {
            samples,
            start_sample,
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Session time of the first sample, in seconds.
    pub fn start_secs(&self) -> f64 {
        self.start_sample as f64 / self.sample_rate as f64
    }

    /// Duration of the window in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Session time of the window center. Results are stamped with this.
    pub fn center_secs(&self) -> f64 {
        self.start_secs() + self.duration_secs() / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn center_accounts_for_start_offset() {
        let samples = vec![0.0f32; 16_000];
        let window = AudioWindow::new(&samples, 8_000, 16_000);
        assert_relative_eq!(window.start_secs(), 0.5);
        assert_relative_eq!(window.duration_secs(), 1.0);
        assert_relative_eq!(window.center_secs(), 1.0);
    }
}
