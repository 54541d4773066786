//! Storage footprint estimates.
//!
//! These are estimates, not exact sizes: image payloads are often not held
//! in memory, so sensors without a recorded size count as a fixed amount
//! per image.

use serde_json::Value;

use crate::types::{Iteration, Session};

/// Per-image estimate used when a reading has no recorded size.
pub const DEFAULT_IMAGE_ESTIMATE_BYTES: u64 = 100 * 1024;

/// Base64 text decodes to roughly three quarters of its length.
const BASE64_DECODED_RATIO: f64 = 0.75;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Estimated bytes for one iteration.
pub fn iteration_bytes(iteration: &Iteration, image_estimate: u64) -> u64 {
    // Serialized size without image payloads
    let mut stripped = iteration.clone();
    for sensor in stripped.sensors.iter_mut().filter(|s| s.kind.is_image()) {
        sensor.content = Value::Null;
    }
    stripped.model_images = None;
    let base = serde_json::to_vec(&stripped)
        .map(|bytes| bytes.len() as u64)
        .unwrap_or(0);

    let sensor_images: u64 = iteration
        .sensors
        .iter()
        .filter(|s| s.kind.is_image())
        .map(|s| {
            s.byte_size
                .unwrap_or_else(|| image_estimate * u64::from(s.image_count.unwrap_or(1)))
        })
        .sum();

    let model_images: u64 = iteration
        .model_images
        .iter()
        .flatten()
        .map(|img| (img.len() as f64 * BASE64_DECODED_RATIO) as u64)
        .sum();

    base + sensor_images + model_images
}

pub fn iterations_bytes<'a>(
    iterations: impl IntoIterator<Item = &'a Iteration>,
    image_estimate: u64,
) -> u64 {
    iterations
        .into_iter()
        .map(|i| iteration_bytes(i, image_estimate))
        .sum()
}

pub fn sessions_bytes(sessions: &[Session], image_estimate: u64) -> u64 {
    sessions
        .iter()
        .map(|s| iterations_bytes(&s.iterations, image_estimate))
        .sum()
}

/// Megabytes rounded to two decimals.
pub fn bytes_to_mb(bytes: u64) -> f64 {
    (bytes as f64 / BYTES_PER_MB * 100.0).round() / 100.0
}
