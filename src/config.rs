//! Session configuration.
//!
//! Every module owns its own config struct; [`SlamConfig`] aggregates them
//! so a whole session can be described by one JSON file. The validated
//! config is wrapped in an `Arc` at session start and never mutated.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SlamError};
use crate::imu::ImuConfig;
use crate::local_mapping::MappingConfig;
use crate::loop_closing::LoopClosingConfig;
use crate::optimizer::pose_graph::PoseGraphConfig;
use crate::relocalization::RelocalizationConfig;
use crate::tracking::frame::ExtractorConfig;
use crate::tracking::matching::MatcherConfig;
use crate::tracking::tracker::TrackingConfig;
use crate::tracking::tracking_frame::{DepthConfig, DepthSource};
use crate::vocabulary::VocabularyConfig;

/// How the session drives the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProcessingMode {
    /// Dedicated tracking thread behind a bounded queue. Frames are dropped
    /// when tracking falls behind.
    #[default]
    Realtime,
    /// Tracking runs on the caller's thread and waits for every keyframe to
    /// be mapped. Deterministic; used for recorded sessions.
    Offline,
}

/// Session plumbing: threads, queues and ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Default: Realtime
    pub mode: ProcessingMode,

    /// Whether depth images are used when present.
    /// Default: Trusted
    pub depth_source: DepthSource,

    /// Frames up to this much older than the newest one are reordered;
    /// older ones are dropped.
    /// Default: 50_000_000 (50 ms)
    pub reorder_window_ns: u64,

    /// Frames held by the reorder buffer at most.
    /// Default: 8
    pub reorder_capacity: usize,

    /// Frames queued for the tracking thread (Realtime only).
    /// Default: 4
    pub frame_queue_capacity: usize,

    /// Keyframes queued for local mapping.
    /// Default: 16
    pub keyframe_queue_capacity: usize,

    /// Keyframes queued for loop closing.
    /// Default: 8
    pub loop_queue_capacity: usize,

    /// How long Offline tracking waits for a keyframe to be mapped.
    /// Default: 10_000
    pub mapped_wait_ms: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            mode: ProcessingMode::Realtime,
            depth_source: DepthSource::Trusted,
            reorder_window_ns: 50_000_000,
            reorder_capacity: 8,
            frame_queue_capacity: 4,
            keyframe_queue_capacity: 16,
            loop_queue_capacity: 8,
            mapped_wait_ms: 10_000,
        }
    }
}

impl SystemConfig {
    pub fn validate(&self) -> Result<()> {
        if self.reorder_capacity == 0
            || self.frame_queue_capacity == 0
            || self.keyframe_queue_capacity == 0
            || self.loop_queue_capacity == 0
        {
            return Err(SlamError::Config("system queue capacities must be positive".into()));
        }
        Ok(())
    }
}

/// Complete configuration of a mapping session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlamConfig {
    pub extractor: ExtractorConfig,
    pub matcher: MatcherConfig,
    pub vocabulary: VocabularyConfig,
    pub tracking: TrackingConfig,
    pub depth: DepthConfig,
    pub mapping: MappingConfig,
    pub loop_closing: LoopClosingConfig,
    pub pose_graph: PoseGraphConfig,
    pub relocalization: RelocalizationConfig,
    pub system: SystemConfig,
    pub imu: ImuConfig,
}

impl SlamConfig {
    /// Check every section and the constraints between them.
    pub fn validate(&self) -> Result<()> {
        self.extractor.validate()?;
        self.matcher.validate()?;
        self.vocabulary.validate()?;
        self.tracking.validate()?;
        self.depth.validate()?;
        self.mapping.validate()?;
        self.loop_closing.validate()?;
        self.pose_graph.validate()?;
        self.relocalization.validate()?;
        self.system.validate()?;
        self.imu.validate()?;

        if self.loop_closing.min_inliers <= self.tracking.min_inliers {
            return Err(SlamError::Config(format!(
                "loop_closing.min_inliers ({}) must be stricter than tracking.min_inliers ({})",
                self.loop_closing.min_inliers, self.tracking.min_inliers
            )));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SlamConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        SlamConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SlamConfig::from_json_str(r#"{ "extractor": { "descriptor_len": 64 }, "system": { "mode": "Offline" } }"#)
            .unwrap();
        assert_eq!(config.extractor.descriptor_len, 64);
        assert_eq!(config.extractor.n_levels, 8);
        assert_eq!(config.system.mode, ProcessingMode::Offline);
        assert_eq!(config.loop_closing.exclude_recent, 30);
    }

    #[test]
    fn test_bad_descriptor_len_rejected() {
        let err = SlamConfig::from_json_str(r#"{ "extractor": { "descriptor_len": 48 } }"#).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_loop_threshold_must_be_stricter() {
        let mut config = SlamConfig::default();
        config.loop_closing.min_inliers = config.tracking.min_inliers;
        assert!(matches!(config.validate(), Err(SlamError::Config(_))));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = SlamConfig::default();
        config.system.frame_queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        assert!(matches!(SlamConfig::from_json_str("{ nope"), Err(SlamError::Config(_))));
    }
}
