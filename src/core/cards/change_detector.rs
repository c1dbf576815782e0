use serde::{Deserialize, Serialize};

use super::frame::DetectedObject;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeConfig {
    /// 量化网格 G，0 表示不量化
    pub grid_size: f32,
    /// 移动容差 T
    pub movement_tolerance: f32,
}

impl Default for ChangeConfig {
    fn default() -> Self {
        Self {
            grid_size: 30.0,
            movement_tolerance: 60.0,
        }
    }
}

impl ChangeConfig {
    /// 手持拍摄抖动更大
    pub fn for_handheld() -> Self {
        Self {
            grid_size: 40.0,
            movement_tolerance: 80.0,
        }
    }

    pub fn for_fixed_mount() -> Self {
        Self {
            grid_size: 20.0,
            movement_tolerance: 40.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantizedBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl QuantizedBox {
    pub fn distance(&self, other: &QuantizedBox) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// 量化后的检测快照
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectState {
    pub count: usize,
    pub positions: Vec<QuantizedBox>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeDecision {
    pub changed: bool,
    pub state: ObjectState,
}

pub struct ChangeDetector {
    config: ChangeConfig,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::with_config(ChangeConfig::default())
    }

    pub fn with_config(config: ChangeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChangeConfig {
        &self.config
    }

    pub fn quantize(&self, value: f32) -> f32 {
        let g = self.config.grid_size;
        if g <= 0.0 {
            value
        } else {
            (value / g).round() * g
        }
    }

    pub fn snapshot(&self, objects: &[DetectedObject]) -> ObjectState {
        let positions: Vec<QuantizedBox> = objects
            .iter()
            .map(|o| QuantizedBox {
                x: self.quantize(o.bbox.x),
                y: self.quantize(o.bbox.y),
                w: self.quantize(o.bbox.w),
                h: self.quantize(o.bbox.h),
            })
            .collect();
        ObjectState {
            count: positions.len(),
            positions,
        }
    }

    /// Compares the current detections with the last reported snapshot. The
    /// caller stores `state` only when `changed` is true.
    pub fn has_changed(&self, current: &[DetectedObject], previous: Option<&ObjectState>) -> ChangeDecision {
        let state = self.snapshot(current);

        let changed = match previous {
            None => state.count > 0,
            Some(prev) if prev.count != state.count => true,
            Some(_) if state.count == 0 => false,
            Some(prev) => state.positions.iter().enumerate().any(|(i, pos)| {
                prev.positions
                    .get(i)
                    .map_or(true, |p| pos.distance(p) >= self.config.movement_tolerance)
            }),
        };

        ChangeDecision { changed, state }
    }
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new()
    }
}
