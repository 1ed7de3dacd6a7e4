//! Power-spectrum seizure classifier
//!
//! A sliding 178-sample window over the incoming microvolt stream is scored
//! with an unscaled length-178 FFT: the magnitudes of the first 45 spectrum
//! bins are weighted by a trained linear model and compared against the
//! model intercept. A short history of past classifications is folded into a
//! recency-weighted confidence value that smooths therapy decisions.

pub mod weights;
pub mod window;

pub use weights::{INTERCEPT, WEIGHTS};
pub use window::{
    SignalWindow, DEFAULT_PREDICTION_CAPACITY, DEFAULT_SAMPLE_RATE, SPECTRUM_BINS, WINDOW_SIZE,
};
