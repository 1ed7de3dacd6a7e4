//! Sliding signal window and classification state.

use std::collections::VecDeque;
use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::weights::{INTERCEPT, WEIGHTS};

/// Samples held in the sliding window (FFT length).
pub const WINDOW_SIZE: usize = 178;

/// Spectrum bins folded into the score.
pub const SPECTRUM_BINS: usize = 45;

/// Default number of past classifications kept for confidence weighting.
pub const DEFAULT_PREDICTION_CAPACITY: usize = 5;

/// Default number of new samples between classifications.
pub const DEFAULT_SAMPLE_RATE: u32 = 2;

/// Sliding window of microvolt samples plus a bounded history of past
/// classifications.
///
/// Owned by the detector task; all methods are single-threaded.
pub struct SignalWindow {
    samples: VecDeque<f64>,
    predictions: VecDeque<i8>,
    prediction_capacity: usize,
    sample_rate: u32,
    current_sample: u32,
    predict_ready: bool,
    total_samples: u64,
    fft: Arc<dyn Fft<f64>>,
}

impl SignalWindow {
    pub fn new() -> Self {
        Self::with_params(DEFAULT_SAMPLE_RATE, DEFAULT_PREDICTION_CAPACITY)
    }

    /// `sample_rate` is the number of newly-arrived samples required between
    /// classifications; `prediction_capacity` bounds the history used by
    /// [`confidence`](Self::confidence).
    pub fn with_params(sample_rate: u32, prediction_capacity: usize) -> Self {
        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(WINDOW_SIZE);
        Self {
            samples: VecDeque::with_capacity(WINDOW_SIZE),
            predictions: VecDeque::with_capacity(prediction_capacity),
            prediction_capacity: prediction_capacity.max(1),
            sample_rate: sample_rate.max(1),
            current_sample: 0,
            predict_ready: false,
            total_samples: 0,
            fft,
        }
    }

    /// Append one sample, dropping the oldest when the window is full.
    pub fn add(&mut self, microvolts: f64) {
        if self.samples.len() == WINDOW_SIZE {
            self.samples.pop_front();
        }
        self.samples.push_back(microvolts);
        self.total_samples += 1;
        self.current_sample += 1;
        if self.current_sample >= self.sample_rate {
            self.predict_ready = true;
        }
    }

    /// Whether enough new samples have arrived for another classification.
    ///
    /// Gated on a completely filled window: the classifier never scores a
    /// partial spectrum.
    pub fn predict_ready(&self) -> bool {
        self.predict_ready && self.samples.len() == WINDOW_SIZE
    }

    /// Classify the current window.
    ///
    /// Returns `true` when the weighted spectrum score clears the intercept.
    /// The result is appended to the prediction history (dropping the oldest
    /// entry at capacity) and the new-sample counter is reset. Returns
    /// `false` without recording anything when the window is not yet full.
    pub fn predict(&mut self) -> bool {
        if self.samples.len() < WINDOW_SIZE {
            return false;
        }
        let positive = self.score() + INTERCEPT > 0.0;
        if self.predictions.len() == self.prediction_capacity {
            self.predictions.pop_front();
        }
        self.predictions.push_back(if positive { 1 } else { -1 });
        self.current_sample = 0;
        self.predict_ready = false;
        positive
    }

    /// Recency-weighted vote over the prediction history.
    ///
    /// With `n` stored predictions and `w = 1/n`, prediction `i` (insertion
    /// order) contributes `p_i · w · (i + 1)`, so the newest classification
    /// carries the largest weight. The result lies in roughly
    /// `[-(n+1)/2, +(n+1)/2]`; zero when no predictions exist yet.
    pub fn confidence(&self) -> f64 {
        let n = self.predictions.len();
        if n == 0 {
            return 0.0;
        }
        let w = 1.0 / n as f64;
        self.predictions
            .iter()
            .enumerate()
            .map(|(i, &p)| f64::from(p) * w * (i as f64 + 1.0))
            .sum()
    }

    /// Weighted sum of the first [`SPECTRUM_BINS`] magnitudes of the
    /// unscaled forward FFT of the current window.
    fn score(&self) -> f64 {
        let mut buffer: Vec<Complex<f64>> = self
            .samples
            .iter()
            .map(|&v| Complex::new(v, 0.0))
            .collect();
        self.fft.process(&mut buffer);
        buffer
            .iter()
            .take(SPECTRUM_BINS)
            .zip(WEIGHTS.iter())
            .map(|(bin, weight)| weight * (bin.re * bin.re + bin.im * bin.im).sqrt())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Total samples ever appended.
    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    /// Number of stored past classifications.
    pub fn prediction_count(&self) -> usize {
        self.predictions.len()
    }
}

impl Default for SignalWindow {
    fn default() -> Self {
        Self::new()
    }
}
