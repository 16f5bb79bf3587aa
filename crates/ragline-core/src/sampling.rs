//! Deterministic sampling of requests for offline evaluation.
//!
//! A request is sampled when it is forced (by configuration or by a force
//! header) or when its bucket falls below the configured rate. The bucket is
//! derived from a SHA-256 of the trace id (or, without one, the user id), so
//! the same key always gets the same decision.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const BUCKETS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Fraction of requests to sample, in `[0, 1]`.
    pub rate: f64,
    /// Header that forces sampling when set to a truthy value.
    pub force_header: String,
    /// Sample every request.
    pub force: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            rate: 0.1,
            force_header: "X-Eval-Force".to_string(),
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SamplingDecider {
    config: SamplingConfig,
}

impl SamplingDecider {
    pub fn new(config: SamplingConfig) -> Result<Self> {
        if !(0.0..=1.0).contains(&config.rate) {
            return Err(Error::InvalidConfiguration(format!(
                "sampling.rate must be within [0, 1], got {}",
                config.rate
            )));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Decide from the trace id, falling back to the user id. Without either
    /// key the request is not sampled unless sampling is forced.
    pub fn should_sample(&self, trace_id: Option<&str>, user_id: Option<&str>) -> bool {
        if self.config.force {
            return true;
        }
        let key = [trace_id, user_id]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|k| !k.is_empty());
        match key {
            Some(k) => bucket(k) < self.config.rate,
            None => false,
        }
    }

    /// [`should_sample`](Self::should_sample) with request headers taken into
    /// account.
    pub fn should_sample_request<'a, I>(
        &self,
        headers: I,
        trace_id: Option<&str>,
        user_id: Option<&str>,
    ) -> bool
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.is_forced(headers) || self.should_sample(trace_id, user_id)
    }

    /// Whether the force header is present with a truthy value. Header names
    /// compare case-insensitively.
    pub fn is_forced<'a, I>(&self, headers: I) -> bool
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let wanted = self.config.force_header.as_str();
        !wanted.is_empty()
            && headers
                .into_iter()
                .any(|(name, value)| name.eq_ignore_ascii_case(wanted) && is_truthy(value))
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Bucket of `key` in `[0, 1)`.
pub fn bucket(key: &str) -> f64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(first) % BUCKETS) as f64 / BUCKETS as f64
}
