//! Editing-mode enums and brush configuration
//!
//! These replace the host-editor property panels of a typical paint tool:
//! a plain configuration struct handed to the engine by whatever front end
//! drives it (CLI, GUI, test harness).

use serde::{Deserialize, Serialize};

/// Operation applied by a brush stamp or a direct numeric edit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WeightEditOperation {
    /// Add a signed delta to the weight.
    Add,
    /// Blend the weight toward a target value.
    Replace,
    /// Scale the weight by a factor.
    Multiply,
    /// Smooth weights toward the neighborhood average (topology aware).
    Relax,
    /// Scale the weight relative to its current value, toward 1 or 0.
    RelativeScale,
}

/// How brush falloff distance is measured.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FalloffMode {
    /// Geodesic distance along the surface; does not bleed across
    /// disconnected patches.
    #[default]
    Surface,
    /// Straight-line distance through space.
    Volume,
}

/// Axis of the mirror plane, in component space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MirrorAxis {
    #[default]
    X,
    Y,
    Z,
}

impl MirrorAxis {
    /// Component index into a position vector.
    pub fn component(self) -> usize {
        match self {
            MirrorAxis::X => 0,
            MirrorAxis::Y => 1,
            MirrorAxis::Z => 2,
        }
    }
}

/// Which side of the mirror plane weights are copied from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MirrorDirection {
    #[default]
    PositiveToNegative,
    NegativeToPositive,
}

/// Per-operation brush parameters.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BrushConfig {
    /// Base strength of the operation, in [0..1] for blend-style
    /// operations; Add treats it as a signed delta magnitude.
    pub strength: f32,
    /// World-space brush radius.
    pub radius: f32,
    /// Portion of the radius over which falloff ramps from 1 to 0.
    /// 0 = hard brush, 1 = falloff starts at the center.
    pub falloff: f32,
    pub falloff_mode: FalloffMode,
}

impl Default for BrushConfig {
    fn default() -> Self {
        Self {
            strength: 1.0,
            radius: 20.0,
            falloff: 1.0,
            falloff_mode: FalloffMode::Surface,
        }
    }
}

/// Brush settings saved and restored separately for each brush operation,
/// so switching between Add and Relax keeps each one's tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrushSettings {
    pub operation: WeightEditOperation,
    pub add: BrushConfig,
    pub replace: BrushConfig,
    pub multiply: BrushConfig,
    pub relax: BrushConfig,
}

impl Default for BrushSettings {
    fn default() -> Self {
        Self {
            operation: WeightEditOperation::Add,
            add: BrushConfig::default(),
            replace: BrushConfig::default(),
            multiply: BrushConfig::default(),
            relax: BrushConfig {
                strength: 0.5,
                ..BrushConfig::default()
            },
        }
    }
}

impl BrushSettings {
    /// Config for the active operation. RelativeScale has no dedicated
    /// brush tuning and shares the Add config.
    pub fn config(&self) -> &BrushConfig {
        match self.operation {
            WeightEditOperation::Add | WeightEditOperation::RelativeScale => &self.add,
            WeightEditOperation::Replace => &self.replace,
            WeightEditOperation::Multiply => &self.multiply,
            WeightEditOperation::Relax => &self.relax,
        }
    }

    pub fn config_mut(&mut self) -> &mut BrushConfig {
        match self.operation {
            WeightEditOperation::Add | WeightEditOperation::RelativeScale => &mut self.add,
            WeightEditOperation::Replace => &mut self.replace,
            WeightEditOperation::Multiply => &mut self.multiply,
            WeightEditOperation::Relax => &mut self.relax,
        }
    }
}
