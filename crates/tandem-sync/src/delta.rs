//! Threshold-based send policy.
//!
//! An entity is dirty when its pose has moved past any threshold relative to
//! the last pose sent (or last inbound pose fully applied), or when its
//! extra state bytes changed. Clean entities send nothing.

use tandem_config::SyncConfig;
use tandem_net::Pose;

/// The last state put on the wire or fully applied from the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct SendCache {
    pose: Pose,
    extra: Vec<u8>,
}

impl SendCache {
    /// Cache seeded with a known-synchronized state.
    pub fn new(pose: Pose, extra: Vec<u8>) -> Self {
        Self { pose, extra }
    }

    /// Record `pose` and `extra` as synchronized.
    pub fn record(&mut self, pose: Pose, extra: &[u8]) {
        self.pose = pose;
        self.extra.clear();
        self.extra.extend_from_slice(extra);
    }

    /// Last synchronized pose.
    pub fn pose(&self) -> &Pose {
        &self.pose
    }
}

/// Per-field thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaSyncPolicy {
    /// Position distance, in world units.
    pub position_threshold: f32,
    /// Rotation angle, in degrees.
    pub rotation_threshold_deg: f32,
    /// Scale distance.
    pub scale_threshold: f32,
}

impl Default for DeltaSyncPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl DeltaSyncPolicy {
    /// Thresholds from the sync configuration.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            position_threshold: config.position_threshold,
            rotation_threshold_deg: config.rotation_threshold_deg,
            scale_threshold: config.scale_threshold,
        }
    }

    /// Whether the current state differs enough from `cache` to send.
    pub fn is_dirty(&self, cache: &SendCache, pose: &Pose, extra: &[u8]) -> bool {
        let last = &cache.pose;
        last.position_delta(pose) > self.position_threshold
            || last.rotation_delta_deg(pose) > self.rotation_threshold_deg
            || last.scale_delta(pose) > self.scale_threshold
            || cache.extra != extra
    }

    /// Whether to send this tick: dirty or forced.
    pub fn should_send(&self, cache: &SendCache, pose: &Pose, extra: &[u8], force: bool) -> bool {
        force || self.is_dirty(cache, pose, extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    fn cache_at(pose: Pose) -> SendCache {
        SendCache::new(pose, Vec::new())
    }

    #[test]
    fn test_sub_threshold_move_is_clean() {
        let policy = DeltaSyncPolicy::default();
        let cache = cache_at(Pose::IDENTITY);
        let moved = Pose::from_position(Vec3::new(0.0005, 0.0, 0.0));
        assert!(!policy.is_dirty(&cache, &moved, &[]));
    }

    #[test]
    fn test_each_threshold_alone_marks_dirty() {
        let policy = DeltaSyncPolicy::default();
        let cache = cache_at(Pose::IDENTITY);

        let moved = Pose::from_position(Vec3::new(0.002, 0.0, 0.0));
        assert!(policy.is_dirty(&cache, &moved, &[]));

        let turned = Pose {
            rotation: Quat::from_rotation_z(1.0f32.to_radians()),
            ..Pose::IDENTITY
        };
        assert!(policy.is_dirty(&cache, &turned, &[]));

        let scaled = Pose {
            scale: Vec3::splat(1.01),
            ..Pose::IDENTITY
        };
        assert!(policy.is_dirty(&cache, &scaled, &[]));

        assert!(policy.is_dirty(&cache, &Pose::IDENTITY, &[1]));
    }

    #[test]
    fn test_small_rotation_is_clean() {
        let policy = DeltaSyncPolicy::default();
        let cache = cache_at(Pose::IDENTITY);
        let turned = Pose {
            rotation: Quat::from_rotation_x(0.2f32.to_radians()),
            ..Pose::IDENTITY
        };
        assert!(!policy.is_dirty(&cache, &turned, &[]));
    }

    #[test]
    fn test_force_overrides_clean_state() {
        let policy = DeltaSyncPolicy::default();
        let cache = cache_at(Pose::IDENTITY);
        assert!(!policy.should_send(&cache, &Pose::IDENTITY, &[], false));
        assert!(policy.should_send(&cache, &Pose::IDENTITY, &[], true));
    }

    #[test]
    fn test_drift_accumulates_against_last_sent() {
        let policy = DeltaSyncPolicy::default();
        let mut cache = cache_at(Pose::IDENTITY);
        let mut sends = 0;
        for i in 1..=10 {
            let pose = Pose::from_position(Vec3::new(0.0004 * i as f32, 0.0, 0.0));
            if policy.is_dirty(&cache, &pose, &[]) {
                sends += 1;
                cache.record(pose, &[]);
            }
        }
        // 0.0012 crosses at i = 3, then again at i = 6 and i = 9.
        assert_eq!(sends, 3);
    }
}
