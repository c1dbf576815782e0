use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};

use super::frame::{FrameSource, ObjectDetector, ResultSink};
use super::pipeline::{CardPipeline, CycleOptions};

/// 自动模式：后台线程按固定间隔触发识别
///
/// Ticks never queue up. A tick that finds a cycle still running (a manual
/// capture, for instance) is dropped by the pipeline's in-flight guard.
pub struct CaptureLoop {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureLoop {
    pub fn spawn(
        pipeline: Arc<CardPipeline>,
        source: Arc<dyn FrameSource>,
        detector: Option<Arc<dyn ObjectDetector>>,
        sink: Arc<dyn ResultSink>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name("card-capture".to_string())
            .spawn(move || {
                info!("▶️ Capture loop started, interval {:?}", interval);
                let mut ticks = 0u64;
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            ticks += 1;
                            pipeline.capture_and_run(
                                source.as_ref(),
                                detector.as_deref(),
                                sink.as_ref(),
                                CycleOptions::periodic(),
                            );
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("⏹️ Capture loop stopped after {} tick(s)", ticks);
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Signals the loop and waits for the in-progress cycle, if any.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("⚠️ Capture loop thread panicked");
            }
        }
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.stop();
    }
}
