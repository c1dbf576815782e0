use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::change_detector::ChangeConfig;
use super::classifier::DEFAULT_TOP_K;
use super::model::LoaderKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub change: ChangeConfig,
    pub top_k: usize,
    /// 预处理线程数
    pub worker_threads: usize,
    /// 自动模式采集间隔
    pub capture_interval_ms: u64,
    pub strategies: Vec<LoaderKind>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            change: ChangeConfig::default(),
            top_k: DEFAULT_TOP_K,
            worker_threads: num_cpus::get().min(4),
            capture_interval_ms: 1500,
            strategies: LoaderKind::all(),
        }
    }
}

impl PipelineConfig {
    pub fn for_handheld() -> Self {
        Self {
            change: ChangeConfig::for_handheld(),
            capture_interval_ms: 1000,
            ..Default::default()
        }
    }

    pub fn for_fixed_mount() -> Self {
        Self {
            change: ChangeConfig::for_fixed_mount(),
            capture_interval_ms: 2000,
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms)
    }
}
