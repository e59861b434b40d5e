/// External collaborators and per-tile inference plumbing
///
/// The inference engine and the quality scorer are black boxes supplied by
/// the caller. This module defines the traits they are reached through and
/// the pixel bookkeeping wrapped around every engine call: padding to the
/// model's spatial constraints, orientation repair, cropping and alpha.

use image::{imageops, Rgba, RgbaImage};
use std::path::Path;

use super::orientation;
use crate::state::config::ModelParams;

pub use crate::error::{EngineError, ScoringError};

/// A restoration model runner. Must be callable from several workers at once.
pub trait InferenceEngine: Send + Sync {
    /// Restore one tile at the given strength (0-100, ignored by models
    /// without a strength input)
    fn restore_tile(
        &self,
        input: &RgbaImage,
        strength: f32,
        params: &ModelParams,
    ) -> Result<RgbaImage, EngineError>;
}

impl<F> InferenceEngine for F
where
    F: Fn(&RgbaImage, f32, &ModelParams) -> Result<RgbaImage, EngineError> + Send + Sync,
{
    fn restore_tile(
        &self,
        input: &RgbaImage,
        strength: f32,
        params: &ModelParams,
    ) -> Result<RgbaImage, EngineError> {
        self(input, strength, params)
    }
}

/// A no-reference quality metric (BRISQUE). Lower scores are better;
/// negative values are failure codes, see [`ScoringError::classify`].
pub trait QualityScorer: Send + Sync {
    fn score(&self, image_path: &Path, model_path: &Path, range_path: &Path) -> f32;
}

impl<F> QualityScorer for F
where
    F: Fn(&Path, &Path, &Path) -> f32 + Send + Sync,
{
    fn score(&self, image_path: &Path, model_path: &Path, range_path: &Path) -> f32 {
        self(image_path, model_path, range_path)
    }
}

/// Side length after padding: at least `min_size`, rounded up to `multiple`
fn padded_length(length: u32, multiple: u32, min_size: u32) -> u32 {
    let multiple = multiple.max(1);
    length.max(min_size).div_ceil(multiple) * multiple
}

/// Pad a tile by edge replication so the model accepts it.
///
/// Returns the input unchanged (cloned) when no padding is needed.
pub fn pad_for_model(tile: &RgbaImage, params: &ModelParams) -> RgbaImage {
    let (w, h) = tile.dimensions();
    let pw = padded_length(w, params.pad_multiple, params.min_size);
    let ph = padded_length(h, params.pad_multiple, params.min_size);
    if (pw, ph) == (w, h) || w == 0 || h == 0 {
        return tile.clone();
    }

    RgbaImage::from_fn(pw, ph, |x, y| *tile.get_pixel(x.min(w - 1), y.min(h - 1)))
}

/// Turn raw engine output back into a tile matching `input`:
/// undo rotation/flips against the padded input, crop the padding away
/// and carry the input's alpha over.
pub fn finish_tile(
    input: &RgbaImage,
    padded: &RgbaImage,
    output: RgbaImage,
) -> Result<RgbaImage, EngineError> {
    let (ow, oh) = output.dimensions();
    let reconciled = orientation::reconcile(padded, output).ok_or_else(|| {
        EngineError::new(format!(
            "engine returned {}x{} for a {}x{} input",
            ow,
            oh,
            padded.width(),
            padded.height()
        ))
    })?;

    let (w, h) = input.dimensions();
    let mut restored = if reconciled.image.dimensions() == (w, h) {
        reconciled.image
    } else {
        imageops::crop_imm(&reconciled.image, 0, 0, w, h).to_image()
    };
    restore_alpha(&mut restored, input);
    Ok(restored)
}

/// Copy the alpha channel of `source` into `target` (same dimensions)
pub fn restore_alpha(target: &mut RgbaImage, source: &RgbaImage) {
    for (dst, src) in target.pixels_mut().zip(source.pixels()) {
        dst.0[3] = src.0[3];
    }
}

/// Full per-tile inference: pad, run, reconcile, crop, alpha
pub fn run_tile(
    engine: &dyn InferenceEngine,
    tile: &RgbaImage,
    strength: f32,
    params: &ModelParams,
) -> Result<RgbaImage, EngineError> {
    let padded = pad_for_model(tile, params);
    let output = engine.restore_tile(&padded, strength, params)?;
    finish_tile(tile, &padded, output)
}

/// Surround an image with an opaque black border of `border` pixels
pub fn add_border(image: &RgbaImage, border: u32) -> RgbaImage {
    if border == 0 {
        return image.clone();
    }
    let mut framed = RgbaImage::from_pixel(
        image.width() + 2 * border,
        image.height() + 2 * border,
        Rgba([0, 0, 0, 255]),
    );
    imageops::replace(&mut framed, image, border as i64, border as i64);
    framed
}

/// Remove a border added by [`add_border`]
pub fn remove_border(image: RgbaImage, border: u32) -> RgbaImage {
    if border == 0 {
        return image;
    }
    let w = image.width().saturating_sub(2 * border);
    let h = image.height().saturating_sub(2 * border);
    imageops::crop_imm(&image, border, border, w, h).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_fn(w, h, |x, y| Rgba([(x * 9) as u8, (y * 5) as u8, ((x + y) % 2 * 200) as u8, 255]))
    }

    #[test]
    fn test_padding_replicates_edges() {
        let tile = checker(10, 5);
        let params = ModelParams::default();
        let padded = pad_for_model(&tile, &params);
        assert_eq!(padded.dimensions(), (16, 8));
        assert_eq!(padded.get_pixel(15, 7), tile.get_pixel(9, 4));
        assert_eq!(padded.get_pixel(12, 2), tile.get_pixel(9, 2));
        assert_eq!(padded.get_pixel(3, 3), tile.get_pixel(3, 3));
    }

    #[test]
    fn test_padding_respects_min_size() {
        let params = ModelParams {
            min_size: 20,
            ..ModelParams::default()
        };
        let padded = pad_for_model(&checker(4, 4), &params);
        assert_eq!(padded.dimensions(), (24, 24));

        let aligned = pad_for_model(&checker(32, 24), &params);
        assert_eq!(aligned.dimensions(), (32, 24));
    }

    #[test]
    fn test_run_tile_crops_and_restores_alpha() {
        let mut tile = checker(13, 7);
        tile.put_pixel(2, 3, Rgba([1, 2, 3, 40]));

        // Engine nudges red and flattens alpha, and sees the padded size
        let engine = |input: &RgbaImage, _strength: f32, _params: &ModelParams| -> Result<RgbaImage, EngineError> {
            assert_eq!(input.dimensions(), (16, 8));
            let mut out = input.clone();
            for p in out.pixels_mut() {
                *p = Rgba([p[0].saturating_add(1), p[1], p[2], 255]);
            }
            Ok(out)
        };

        let restored = run_tile(&engine, &tile, 50.0, &ModelParams::default()).unwrap();
        assert_eq!(restored.dimensions(), (13, 7));
        assert_eq!(restored.get_pixel(2, 3), &Rgba([2, 2, 3, 40]));
    }

    #[test]
    fn test_run_tile_undoes_engine_rotation() {
        let tile = checker(24, 16);
        let engine = |input: &RgbaImage, _: f32, _: &ModelParams| -> Result<RgbaImage, EngineError> {
            Ok(imageops::rotate90(input))
        };
        let restored = run_tile(&engine, &tile, 0.0, &ModelParams::default()).unwrap();
        assert_eq!(restored, tile);
    }

    #[test]
    fn test_run_tile_propagates_engine_failure() {
        let engine = |_: &RgbaImage, _: f32, _: &ModelParams| -> Result<RgbaImage, EngineError> {
            Err(EngineError::new("model not loaded"))
        };
        let err = run_tile(&engine, &checker(8, 8), 10.0, &ModelParams::default()).unwrap_err();
        assert_eq!(err.to_string(), "model not loaded");
    }

    #[test]
    fn test_wrong_output_size_is_engine_error() {
        let engine = |_: &RgbaImage, _: f32, _: &ModelParams| -> Result<RgbaImage, EngineError> {
            Ok(RgbaImage::new(3, 3))
        };
        assert!(run_tile(&engine, &checker(8, 8), 10.0, &ModelParams::default()).is_err());
    }

    #[test]
    fn test_border_round_trip() {
        let image = checker(20, 11);
        let framed = add_border(&image, 4);
        assert_eq!(framed.dimensions(), (28, 19));
        assert_eq!(framed.get_pixel(0, 0), &Rgba([0, 0, 0, 255]));
        assert_eq!(framed.get_pixel(4, 4), image.get_pixel(0, 0));
        assert_eq!(remove_border(framed, 4), image);
    }
}
