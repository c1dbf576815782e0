//! 图像预处理 - 编码字节 -> [1, H, W, C] 归一化张量

use std::sync::Arc;

use log::debug;
use rayon::prelude::*;
use rayon::ThreadPool;

use super::error::PreprocessError;
use super::model::ModelHandle;
use super::tensor::Tensor;

const LUMA_R: f32 = 0.299;
const LUMA_G: f32 = 0.587;
const LUMA_B: f32 = 0.114;

/// 流水线共用的有界线程池，预处理和推理都在其中运行
pub fn build_pool(worker_threads: usize) -> Result<Arc<ThreadPool>, PreprocessError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(worker_threads.max(1))
        .thread_name(|i| format!("card-worker-{}", i))
        .build()
        .map_err(|e| PreprocessError::Pool(e.to_string()))?;
    Ok(Arc::new(pool))
}

pub struct Preprocessor {
    pool: Arc<ThreadPool>,
}

impl Preprocessor {
    pub fn new(worker_threads: usize) -> Result<Self, PreprocessError> {
        Ok(Self::with_pool(build_pool(worker_threads)?))
    }

    pub fn with_pool(pool: Arc<ThreadPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    /// Shapes the tensor after the model's declared NHWC input.
    pub fn preprocess_for(&self, model: &ModelHandle, bytes: &[u8]) -> Result<Tensor, PreprocessError> {
        let (height, width, channels) = model.input_dims();
        self.preprocess(bytes, height, width, channels)
    }

    pub fn preprocess(
        &self,
        bytes: &[u8],
        target_height: usize,
        target_width: usize,
        channels: usize,
    ) -> Result<Tensor, PreprocessError> {
        if target_height == 0 || target_width == 0 || !(channels == 1 || channels == 3) {
            return Err(PreprocessError::UnsupportedShape {
                height: target_height,
                width: target_width,
                channels,
            });
        }

        let rgb = image::load_from_memory(bytes)?.to_rgb8();
        let (src_w, src_h) = (rgb.width() as usize, rgb.height() as usize);
        if src_w == 0 || src_h == 0 {
            return Err(PreprocessError::UnsupportedShape {
                height: src_h,
                width: src_w,
                channels: 3,
            });
        }
        debug!(
            "🖼️ Decoded {}x{} frame -> {}x{}x{}",
            src_w, src_h, target_width, target_height, channels
        );

        let plane: Vec<f32> = if channels == 1 {
            rgb.pixels()
                .map(|p| p[0] as f32 * LUMA_R + p[1] as f32 * LUMA_G + p[2] as f32 * LUMA_B)
                .collect()
        } else {
            rgb.as_raw().iter().map(|&v| v as f32).collect()
        };
        drop(rgb);

        let resized = self.resize_bilinear(&plane, src_h, src_w, channels, target_height, target_width);
        drop(plane);

        let normalized: Vec<f32> = resized.into_iter().map(|v| (v / 255.0).clamp(0.0, 1.0)).collect();

        Tensor::from_f32(&[1, target_height, target_width, channels], normalized).map_err(|_| {
            PreprocessError::UnsupportedShape {
                height: target_height,
                width: target_width,
                channels,
            }
        })
    }

    /// Bilinear resize with aligned corners: the corner pixels of source and
    /// target map onto each other exactly.
    fn resize_bilinear(
        &self,
        src: &[f32],
        src_h: usize,
        src_w: usize,
        channels: usize,
        dst_h: usize,
        dst_w: usize,
    ) -> Vec<f32> {
        let scale = |src_len: usize, dst_len: usize| {
            if dst_len > 1 {
                (src_len - 1) as f32 / (dst_len - 1) as f32
            } else {
                0.0
            }
        };
        let scale_y = scale(src_h, dst_h);
        let scale_x = scale(src_w, dst_w);

        let row_len = dst_w * channels;
        let mut out = vec![0f32; dst_h * row_len];

        self.pool.install(|| {
            out.par_chunks_mut(row_len).enumerate().for_each(|(oy, row)| {
                let sy = oy as f32 * scale_y;
                let y0 = (sy.floor() as usize).min(src_h - 1);
                let y1 = (y0 + 1).min(src_h - 1);
                let dy = sy - y0 as f32;

                for ox in 0..dst_w {
                    let sx = ox as f32 * scale_x;
                    let x0 = (sx.floor() as usize).min(src_w - 1);
                    let x1 = (x0 + 1).min(src_w - 1);
                    let dx = sx - x0 as f32;

                    for c in 0..channels {
                        let at = |y: usize, x: usize| src[(y * src_w + x) * channels + c];
                        let top = at(y0, x0) + (at(y0, x1) - at(y0, x0)) * dx;
                        let bottom = at(y1, x0) + (at(y1, x1) - at(y1, x0)) * dx;
                        row[ox * channels + c] = top + (bottom - top) * dy;
                    }
                }
            });
        });

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageOutputFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn encode_png(img: &RgbImage) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        img.write_to(&mut buffer, ImageOutputFormat::Png).unwrap();
        buffer.into_inner()
    }

    fn preprocessor() -> Preprocessor {
        Preprocessor::new(2).unwrap()
    }

    #[test]
    fn test_all_zero_image_to_zero_tensor() {
        let bytes = encode_png(&RgbImage::new(120, 90));
        let tensor = preprocessor().preprocess(&bytes, 70, 70, 1).unwrap();

        assert_eq!(tensor.shape(), &[1, 70, 70, 1]);
        assert!(tensor.as_f32().unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_luminance_weights() {
        let mut img = RgbImage::new(1, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        let tensor = preprocessor().preprocess(&encode_png(&img), 1, 1, 1).unwrap();
        let v = tensor.as_f32().unwrap()[[0, 0, 0, 0]];
        assert!((v - 0.299).abs() < 1e-5);
    }

    #[test]
    fn test_bilinear_aligned_corners() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([0, 0, 0]));
        img.put_pixel(1, 0, Rgb([255, 255, 255]));
        let tensor = preprocessor().preprocess(&encode_png(&img), 1, 3, 3).unwrap();
        let t = tensor.as_f32().unwrap();

        assert_eq!(tensor.shape(), &[1, 1, 3, 3]);
        assert_eq!(t[[0, 0, 0, 0]], 0.0);
        assert!((t[[0, 0, 1, 1]] - 0.5).abs() < 1e-6);
        assert_eq!(t[[0, 0, 2, 2]], 1.0);
    }

    #[test]
    fn test_values_within_unit_range() {
        let mut img = RgbImage::new(16, 16);
        for (x, y, p) in img.enumerate_pixels_mut() {
            *p = Rgb([(x * 16) as u8, (y * 16) as u8, 255]);
        }
        let tensor = preprocessor().preprocess(&encode_png(&img), 7, 5, 1).unwrap();
        assert!(tensor.as_f32().unwrap().iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_corrupt_bytes() {
        let result = preprocessor().preprocess(b"definitely not an image", 70, 70, 1);
        assert!(matches!(result, Err(PreprocessError::Decode(_))));
    }

    #[test]
    fn test_unsupported_channels() {
        let bytes = encode_png(&RgbImage::new(4, 4));
        let result = preprocessor().preprocess(&bytes, 4, 4, 2);
        assert!(matches!(result, Err(PreprocessError::UnsupportedShape { channels: 2, .. })));
    }
}
