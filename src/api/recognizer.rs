//! 扑克牌识别器

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use flutter_rust_bridge::frb;
use log::{error, info};

use crate::api::models::cards::{CardBox, CardPrediction, RecognizerError, RecognizerStatus};
use crate::core::cards::{
    CardPipeline, CycleOptions, CycleOutcome, DetectedObject, Frame, PipelineConfig, PipelineStats,
};

/// 扑克牌识别器 - 变化门控 + 分类 + 去重
///
/// ```dart
/// final recognizer = await CardRecognizer.create(modelsDir: "/path/to/models");
/// final card = recognizer.recognize(imageBytes: jpeg, manual: true);
/// final status = recognizer.status;
/// ```
#[frb(opaque)]
pub struct CardRecognizer {
    models_dir: String,
    pipeline: Arc<CardPipeline>,
}

impl CardRecognizer {
    /// 创建识别器并加载 models_dir 下的模型
    ///
    /// 模型加载失败不会返回错误：识别器保持不可用，每次识别都跳过，
    /// 原因可通过 status 查询。
    #[frb(dart_async)]
    pub async fn create(models_dir: String, config_json: Option<String>) -> Result<Self, RecognizerError> {
        Self::open(models_dir, config_json)
    }

    fn open(models_dir: String, config_json: Option<String>) -> Result<Self, RecognizerError> {
        crate::init_logging();
        info!("🃏 CardRecognizer: initializing with models_dir: {}", models_dir);

        let config = match config_json.as_deref() {
            Some(json) => PipelineConfig::from_json(json).map_err(|e| RecognizerError {
                error_type: "Config".to_string(),
                message: e.to_string(),
            })?,
            None => PipelineConfig::default(),
        };

        let pipeline = CardPipeline::with_config(config)?;
        if let Err(e) = pipeline.load_from_dir(Path::new(&models_dir)) {
            error!("❌ CardRecognizer: model unavailable: {}", e);
        }

        Ok(Self {
            models_dir,
            pipeline: Arc::new(pipeline),
        })
    }

    /// 识别一帧图像
    ///
    /// `manual` 为 true 时是用户拍照，不做变化门控。返回 None 表示本帧被跳过
    /// （模型未就绪、正在识别、画面无变化或与上次结果相同）。
    #[frb]
    pub fn recognize(&self, image_bytes: Vec<u8>, manual: bool) -> Result<Option<CardPrediction>, RecognizerError> {
        self.run(image_bytes, None, manual)
    }

    /// 带检测框识别，检测框用于自动模式的变化判断
    #[frb]
    pub fn recognize_with_boxes(
        &self,
        image_bytes: Vec<u8>,
        boxes: Vec<CardBox>,
        manual: bool,
    ) -> Result<Option<CardPrediction>, RecognizerError> {
        let objects: Vec<DetectedObject> = boxes.into_iter().map(DetectedObject::from).collect();
        self.run(image_bytes, Some(objects), manual)
    }

    fn run(
        &self,
        image_bytes: Vec<u8>,
        objects: Option<Vec<DetectedObject>>,
        manual: bool,
    ) -> Result<Option<CardPrediction>, RecognizerError> {
        let options = if manual {
            CycleOptions::manual()
        } else {
            CycleOptions::periodic()
        };
        let frame = Frame::new(image_bytes, now_ms());

        match self.pipeline.run_cycle(&frame, objects.as_deref(), options) {
            CycleOutcome::Classified(result) => Ok(Some(result.into())),
            CycleOutcome::Skipped(_) => Ok(None),
            CycleOutcome::Failed(e) => Err(e.into()),
        }
    }

    /// 重置去重和变化状态（切换模式时调用）
    #[frb(sync)]
    pub fn reset(&self) {
        self.pipeline.reset()
    }

    #[frb(sync, getter)]
    pub fn status(&self) -> RecognizerStatus {
        self.pipeline.status().into()
    }

    #[frb(sync, getter)]
    pub fn stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    #[frb(sync, getter)]
    pub fn models_dir(&self) -> String {
        self.models_dir.clone()
    }
}

impl Drop for CardRecognizer {
    fn drop(&mut self) {
        info!("🗑️ CardRecognizer: released");
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
