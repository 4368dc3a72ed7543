// Frame source: decode an image or animation into sampled frames.
//
// Still images yield their first frame. GIFs are fully decoded and then
// sampled evenly down to `max_frames`, always keeping the first and last
// frame. Each frame lazily memoizes the two derived forms detectors ask for
// repeatedly: the JPEG bytes sent to vendor APIs and the perceptual hash.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{bail, Context, Result};
use image::codecs::gif::GifDecoder;
use image::codecs::jpeg::JpegEncoder;
use image::{AnimationDecoder, DynamicImage};
use once_cell::sync::OnceCell;

use crate::phash::{self, PerceptualHash};

const JPEG_QUALITY: u8 = 90;

/// One decoded frame of an input.
pub struct Frame {
    /// Position in the original animation (0 for still images).
    pub idx: usize,
    pub image: DynamicImage,
    jpeg: OnceCell<Vec<u8>>,
    hash: OnceCell<PerceptualHash>,
}

impl Frame {
    pub fn new(idx: usize, image: DynamicImage) -> Self {
        Self {
            idx,
            image,
            jpeg: OnceCell::new(),
            hash: OnceCell::new(),
        }
    }

    /// RGB JPEG encoding of the frame, computed once.
    pub fn jpeg_bytes(&self) -> Result<&[u8]> {
        let bytes = self.jpeg.get_or_try_init(|| -> Result<Vec<u8>> {
            let rgb = self.image.to_rgb8();
            let mut buf = Vec::new();
            JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY)
                .encode_image(&rgb)
                .with_context(|| format!("failed to JPEG-encode frame {}", self.idx))?;
            Ok(buf)
        })?;
        Ok(bytes.as_slice())
    }

    /// Perceptual hash of the frame, computed once.
    pub fn phash(&self) -> &PerceptualHash {
        self.hash.get_or_init(|| phash::compute(&self.image))
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("idx", &self.idx)
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .finish()
    }
}

/// Decode `path` into at most `max_frames` frames (at least one).
pub fn load_frames(path: &Path, max_frames: usize) -> Result<Vec<Frame>> {
    let max_frames = max_frames.max(1);

    if is_gif(path)? {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let decoder = GifDecoder::new(BufReader::new(file))
            .with_context(|| format!("failed to read GIF {}", path.display()))?;
        let decoded = decoder
            .into_frames()
            .collect_frames()
            .with_context(|| format!("failed to decode GIF frames of {}", path.display()))?;
        if decoded.is_empty() {
            bail!("GIF has no frames: {}", path.display());
        }

        let total = decoded.len();
        let keep = sample_indices(total, max_frames);
        let frames = decoded
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| keep.binary_search(idx).is_ok())
            .map(|(idx, frame)| Frame::new(idx, DynamicImage::ImageRgba8(frame.into_buffer())))
            .collect();
        return Ok(frames);
    }

    let image = image::open(path).with_context(|| format!("failed to decode {}", path.display()))?;
    Ok(vec![Frame::new(0, image)])
}

/// Evenly spaced, sorted, unique indices in `0..total`, including both ends.
pub fn sample_indices(total: usize, max_frames: usize) -> Vec<usize> {
    if total == 0 {
        return Vec::new();
    }
    if max_frames <= 1 {
        return vec![0];
    }
    if total <= max_frames {
        return (0..total).collect();
    }

    let last = total - 1;
    let steps = max_frames - 1;
    let mut out: Vec<usize> = (0..max_frames)
        .map(|i| ((i * last) as f64 / steps as f64).round() as usize)
        .collect();
    out.dedup();
    out
}

/// First frame, plus the last one when there is more than one.
pub fn first_and_last(frames: &[Frame]) -> Vec<&Frame> {
    match frames {
        [] => Vec::new(),
        [only] => vec![only],
        [first, .., last] => vec![first, last],
    }
}

fn is_gif(path: &Path) -> Result<bool> {
    let mut file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut magic = [0u8; 6];
    let read = file.read(&mut magic)?;
    Ok(read == 6 && (&magic == b"GIF87a" || &magic == b"GIF89a"))
}
