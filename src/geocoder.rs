//! Reverse geocoder and snow-cover archive contracts (§6). Both are
//! out-of-process services the surrounding application wires in; this
//! engine treats them as pure functions it may call zero times and never
//! implements caching or retry for them beyond what [`crate::retry`]
//! already offers callers.

use async_trait::async_trait;

use crate::error::ClusterError;

/// `geocode(lon, lat)` resolves to a JSON blob (country/region/locality/iso
/// codes) or `None` when nothing is known for that point. Failures are
/// non-fatal; callers log and leave the SkiArea's `location` unset.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, lon: f64, lat: f64) -> Result<Option<serde_json::Value>, ClusterError>;
}

/// Per-point snow cover history, keyed by day. Used by downstream
/// augmentation that this engine's Non-goals exclude from clustering
/// proper; kept as a contract so the surrounding app can supply it.
#[async_trait]
pub trait SnowCoverArchive: Send + Sync {
    async fn lookup(&self, lon: f64, lat: f64, day: &str) -> Result<Option<f64>, ClusterError>;
}

/// Always returns `None`, never errors. The default when no `--geocoder`
/// flag is passed (§10.3).
pub struct NullGeocoder;

#[async_trait]
impl Geocoder for NullGeocoder {
    async fn geocode(&self, _lon: f64, _lat: f64) -> Result<Option<serde_json::Value>, ClusterError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_geocoder_always_resolves_to_none() {
        let g = NullGeocoder;
        assert!(g.geocode(10.0, 45.0).await.unwrap().is_none());
    }
}
