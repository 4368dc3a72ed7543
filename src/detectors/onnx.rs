// Shared ONNX plumbing for the offline image detectors.
//
// `OnnxModel` keeps the session behind Arc<Mutex<_>> because Session::run
// takes &mut self and inference is pushed onto spawn_blocking, which needs
// 'static handles. Preprocessing helpers turn a borrowed frame into the
// flat f32 buffers the models expect.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use ort::session::Session;
use ort::value::Tensor;
use tracing::debug;

/// Flat input buffer plus its NCHW or NHWC shape.
#[derive(Debug, Clone)]
pub struct ModelInput {
    pub shape: [i64; 4],
    pub data: Vec<f32>,
}

/// First output of a model run.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub shape: Vec<i64>,
    pub data: Vec<f32>,
}

pub struct OnnxModel {
    session: Arc<Mutex<Session>>,
    path: PathBuf,
}

impl OnnxModel {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Model file not found: {}", path.display());
        }
        let session = Session::builder()
            .context("Failed to create ONNX session builder")?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load ONNX model from {}", path.display()))?;

        debug!(model = %path.display(), "Loaded ONNX model");
        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run one forward pass on a blocking thread and copy out the first output.
    pub async fn infer(&self, input: ModelInput) -> Result<ModelOutput> {
        let session = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || {
            let tensor = Tensor::from_array((input.shape, input.data))
                .context("Failed to create input tensor")?;

            let mut session = session
                .lock()
                .map_err(|e| anyhow::anyhow!("Session lock poisoned: {}", e))?;
            let outputs = session
                .run(ort::inputs![tensor])
                .context("ONNX inference failed")?;

            let (shape, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .context("Failed to extract output tensor")?;

            Ok(ModelOutput {
                shape: shape.to_vec(),
                data: data.to_vec(),
            })
        })
        .await
        .context("ONNX inference task panicked")?
    }
}

/// Pad to a square on a black canvas (top-left anchored), then resize.
pub fn letterbox(image: &DynamicImage, size: u32) -> RgbImage {
    let rgb = image.to_rgb8();
    let side = rgb.width().max(rgb.height()).max(1);
    let mut canvas = RgbImage::from_pixel(side, side, Rgb([0, 0, 0]));
    image::imageops::replace(&mut canvas, &rgb, 0, 0);
    image::imageops::resize(&canvas, size, size, FilterType::Triangle)
}

/// Resize the short side to `resize`, then take a centered `crop` square.
pub fn resize_center_crop(image: &DynamicImage, resize: u32, crop: u32) -> RgbImage {
    let resized = image.resize_to_fill(resize, resize, FilterType::Triangle).to_rgb8();
    let x = (resized.width().saturating_sub(crop)) / 2;
    let y = (resized.height().saturating_sub(crop)) / 2;
    image::imageops::crop_imm(&resized, x, y, crop, crop).to_image()
}

/// NCHW RGB scaled to 0..1.
pub fn to_nchw_rgb(image: &RgbImage) -> ModelInput {
    let (w, h) = image.dimensions();
    let plane = (w * h) as usize;
    let mut data = vec![0f32; plane * 3];
    for (i, px) in image.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = px[c] as f32 / 255.0;
        }
    }
    ModelInput {
        shape: [1, 3, h as i64, w as i64],
        data,
    }
}

/// NHWC BGR with per-channel mean subtraction (Caffe-style).
pub fn to_nhwc_bgr_mean(image: &RgbImage, mean_bgr: [f32; 3]) -> ModelInput {
    let (w, h) = image.dimensions();
    let mut data = Vec::with_capacity((w * h * 3) as usize);
    for px in image.pixels() {
        data.push(px[2] as f32 - mean_bgr[0]);
        data.push(px[1] as f32 - mean_bgr[1]);
        data.push(px[0] as f32 - mean_bgr[2]);
    }
    ModelInput {
        shape: [1, h as i64, w as i64, 3],
        data,
    }
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return vec![0.0; logits.len()];
    }
    exps.into_iter().map(|v| v / sum).collect()
}

/// Pass through values that already form a distribution, otherwise softmax.
pub fn as_probabilities(values: &[f32]) -> Vec<f32> {
    let sum: f32 = values.iter().sum();
    let in_range = values.iter().all(|v| (0.0..=1.0).contains(v));
    if in_range && (sum - 1.0).abs() < 1e-3 {
        values.to_vec()
    } else {
        softmax(values)
    }
}

/// Per-class maximum confidence from a YOLOv8-style detection head.
///
/// Accepts `[1, 4 + nc, anchors]` and the transposed `[1, anchors, 4 + nc]`.
/// Confidences below `conf` count as zero. Box geometry is ignored.
pub fn yolo_class_maxima(output: &ModelOutput, num_classes: usize, conf: f32) -> Result<Vec<f32>> {
    let dims: Vec<usize> = output.shape.iter().map(|d| (*d).max(0) as usize).collect();
    let rows = 4 + num_classes;
    let (channels_first, anchors) = match dims.as_slice() {
        [1, c, n] if *c == rows => (true, *n),
        [1, n, c] if *c == rows => (false, *n),
        _ => anyhow::bail!(
            "unexpected detector output shape {:?} for {} classes",
            output.shape,
            num_classes
        ),
    };
    if output.data.len() < rows * anchors {
        anyhow::bail!("detector output shorter than its shape");
    }

    let mut maxima = vec![0f32; num_classes];
    for a in 0..anchors {
        for (c, slot) in maxima.iter_mut().enumerate() {
            let idx = if channels_first {
                (4 + c) * anchors + a
            } else {
                a * rows + 4 + c
            };
            let score = output.data[idx];
            if score >= conf && score > *slot {
                *slot = score;
            }
        }
    }
    Ok(maxima)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax(&[1.0, 2.0, 3.0]);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }

    #[test]
    fn test_as_probabilities_keeps_distribution() {
        assert_eq!(as_probabilities(&[0.25, 0.75]), vec![0.25, 0.75]);
        let p = as_probabilities(&[0.0, 4.0]);
        assert!(p[1] > 0.9);
    }

    #[test]
    fn test_nchw_layout() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 0, 255]));
        let input = to_nchw_rgb(&img);
        assert_eq!(input.shape, [1, 3, 1, 2]);
        assert_eq!(input.data, vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_nhwc_bgr_mean_layout() {
        let img = RgbImage::from_pixel(1, 1, Rgb([10, 20, 30]));
        let input = to_nhwc_bgr_mean(&img, [1.0, 2.0, 3.0]);
        assert_eq!(input.shape, [1, 1, 1, 3]);
        assert_eq!(input.data, vec![29.0, 18.0, 7.0]);
    }

    #[test]
    fn test_yolo_maxima_both_layouts() {
        // 2 classes, 3 anchors, channels first: rows = box(4) + classes(2).
        let mut data = vec![0f32; 6 * 3];
        data[4 * 3 + 1] = 0.7; // class 0, anchor 1
        data[5 * 3 + 2] = 0.1; // class 1, anchor 2 (below conf)
        let out = ModelOutput { shape: vec![1, 6, 3], data: data.clone() };
        assert_eq!(yolo_class_maxima(&out, 2, 0.25).unwrap(), vec![0.7, 0.0]);

        let mut transposed = vec![0f32; 3 * 6];
        transposed[6 + 4] = 0.7;
        transposed[2 * 6 + 5] = 0.4;
        let out = ModelOutput { shape: vec![1, 3, 6], data: transposed };
        assert_eq!(yolo_class_maxima(&out, 2, 0.25).unwrap(), vec![0.7, 0.4]);
    }

    #[test]
    fn test_yolo_maxima_rejects_wrong_shape() {
        let out = ModelOutput { shape: vec![1, 7, 3], data: vec![0.0; 21] };
        assert!(yolo_class_maxima(&out, 2, 0.25).is_err());
    }

    #[test]
    fn test_letterbox_is_square() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(40, 10));
        let boxed = letterbox(&img, 16);
        assert_eq!(boxed.dimensions(), (16, 16));
    }
}
