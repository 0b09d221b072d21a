//! Smoothing of inbound remote state.
//!
//! In [`InterpolationMode::Step`] a received pose starts a session that
//! blends from the current local pose to the target over a fixed number of
//! local ticks. The step count scales with the local tick rate so the visual
//! speed does not depend on frame rate. A new update during a session
//! restarts it from the pose currently shown.

use tandem_config::{InterpolationMode, SyncConfig};
use tandem_net::Pose;

/// Tick rate the configured base step count refers to.
pub const BASE_TICK_RATE: f32 = 60.0;

/// `max(1, base_step * round(local_tick_rate / BASE_TICK_RATE))`.
pub fn step_count(base_step: u32, local_tick_rate: f32) -> u32 {
    let scale = (local_tick_rate / BASE_TICK_RATE).round();
    let scale = if scale.is_finite() && scale > 0.0 { scale as u32 } else { 0 };
    base_step.saturating_mul(scale).max(1)
}

/// One running blend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterpolationSession {
    start: Pose,
    target: Pose,
    steps: u32,
    remaining: u32,
}

impl InterpolationSession {
    /// Blend from `start` to `target` over `steps` ticks.
    pub fn new(start: Pose, target: Pose, steps: u32) -> Self {
        let steps = steps.max(1);
        Self {
            start,
            target,
            steps,
            remaining: steps,
        }
    }

    /// Fraction of the blend applied so far.
    pub fn fraction(&self) -> f32 {
        (self.steps - self.remaining) as f32 / self.steps as f32
    }

    /// Pose at the current fraction.
    pub fn current(&self) -> Pose {
        self.start.interpolate(&self.target, self.fraction())
    }

    /// Target pose.
    pub fn target(&self) -> &Pose {
        &self.target
    }

    /// Ticks left.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

/// Per-entity interpolation slot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InterpolationState {
    session: Option<InterpolationSession>,
}

impl InterpolationState {
    /// Whether a session is running.
    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// The running session.
    pub fn session(&self) -> Option<&InterpolationSession> {
        self.session.as_ref()
    }

    /// Drop any running session.
    pub fn cancel(&mut self) {
        self.session = None;
    }
}

/// What to do with an inbound pose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Received {
    /// Apply this pose now.
    Apply(Pose),
    /// A session was started; poses follow from [`InterpolationEngine::advance`].
    Smoothing,
}

/// Output of one [`InterpolationEngine::advance`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Advance {
    /// Intermediate pose.
    Step(Pose),
    /// Final pose; the session ended.
    Arrived(Pose),
}

impl Advance {
    /// The pose to apply.
    pub fn pose(&self) -> Pose {
        match self {
            Self::Step(pose) | Self::Arrived(pose) => *pose,
        }
    }
}

/// Applies the configured smoothing mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterpolationEngine {
    mode: InterpolationMode,
    steps: u32,
}

impl Default for InterpolationEngine {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl InterpolationEngine {
    /// Engine for `mode`, blending over `steps` ticks.
    pub fn new(mode: InterpolationMode, steps: u32) -> Self {
        Self {
            mode,
            steps: steps.max(1),
        }
    }

    /// Engine using the mode, base step, and tick rate from `config`.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.interpolation, step_count(config.base_step, config.local_tick_rate))
    }

    /// Ticks per session.
    pub fn steps(&self) -> u32 {
        self.steps
    }

    /// Smoothing mode.
    pub fn mode(&self) -> InterpolationMode {
        self.mode
    }

    /// Handle an inbound `target`. `current` is the pose the entity shows now.
    pub fn receive(&self, state: &mut InterpolationState, current: Pose, target: Pose, immediate: bool) -> Received {
        if immediate || self.mode == InterpolationMode::None {
            state.session = None;
            return Received::Apply(target);
        }
        // Restart from what is on screen, not from the old start.
        let start = state.session.as_ref().map_or(current, InterpolationSession::current);
        state.session = Some(InterpolationSession::new(start, target, self.steps));
        Received::Smoothing
    }

    /// Advance the running session by one tick.
    pub fn advance(&self, state: &mut InterpolationState) -> Option<Advance> {
        let session = state.session.as_mut()?;
        session.remaining = session.remaining.saturating_sub(1);
        if session.remaining == 0 {
            let target = session.target;
            state.session = None;
            return Some(Advance::Arrived(target));
        }
        Some(Advance::Step(session.current()))
    }
}
