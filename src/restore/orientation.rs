/// Orientation reconciliation
///
/// Some native engines hand back their output rotated or mirrored. After
/// each inference call the output is compared against the input under all
/// 8 rotation/flip combinations and the closest match is kept.
///
/// The comparison samples a sparse grid (every 10th pixel on both axes):
/// a wrong orientation produces large, spatially broad differences, so a
/// full-resolution diff is unnecessary.

use image::{imageops, RgbaImage};

/// Sampling stride in both axes
pub const SAMPLE_STRIDE: usize = 10;

/// The 8 dihedral transforms, applied to the engine output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Orientation {
    Identity,
    Rotate90,
    Rotate180,
    Rotate270,
    /// Horizontal mirror
    FlipHorizontal,
    /// Rotate 90° clockwise, then mirror horizontally (transpose)
    FlipRotate90,
    /// Rotate 180°, then mirror horizontally (vertical mirror)
    FlipRotate180,
    /// Rotate 270° clockwise, then mirror horizontally (anti-transpose)
    FlipRotate270,
}

impl Orientation {
    /// Candidate order; earlier entries win ties
    pub const ALL: [Orientation; 8] = [
        Orientation::Identity,
        Orientation::Rotate90,
        Orientation::Rotate180,
        Orientation::Rotate270,
        Orientation::FlipHorizontal,
        Orientation::FlipRotate90,
        Orientation::FlipRotate180,
        Orientation::FlipRotate270,
    ];

    /// Whether the transform swaps width and height
    pub fn swaps_axes(&self) -> bool {
        matches!(
            self,
            Orientation::Rotate90
                | Orientation::Rotate270
                | Orientation::FlipRotate90
                | Orientation::FlipRotate270
        )
    }

    /// Dimensions of `(width, height)` after the transform
    pub fn output_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        if self.swaps_axes() {
            (height, width)
        } else {
            (width, height)
        }
    }

    /// Source coordinate in a `w` x `h` image that lands on `(x, y)` after the transform
    fn source_coords(&self, x: u32, y: u32, w: u32, h: u32) -> (u32, u32) {
        match self {
            Orientation::Identity => (x, y),
            Orientation::Rotate90 => (y, h - 1 - x),
            Orientation::Rotate180 => (w - 1 - x, h - 1 - y),
            Orientation::Rotate270 => (w - 1 - y, x),
            Orientation::FlipHorizontal => (w - 1 - x, y),
            Orientation::FlipRotate90 => (y, x),
            Orientation::FlipRotate180 => (x, h - 1 - y),
            Orientation::FlipRotate270 => (w - 1 - y, h - 1 - x),
        }
    }

    /// Materialize the transformed image
    pub fn apply(&self, image: &RgbaImage) -> RgbaImage {
        match self {
            Orientation::Identity => image.clone(),
            Orientation::Rotate90 => imageops::rotate90(image),
            Orientation::Rotate180 => imageops::rotate180(image),
            Orientation::Rotate270 => imageops::rotate270(image),
            Orientation::FlipHorizontal => imageops::flip_horizontal(image),
            Orientation::FlipRotate90 => imageops::flip_horizontal(&imageops::rotate90(image)),
            Orientation::FlipRotate180 => imageops::flip_vertical(image),
            Orientation::FlipRotate270 => imageops::flip_horizontal(&imageops::rotate270(image)),
        }
    }
}

/// Outcome of reconciling one engine output
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub orientation: Orientation,
    pub image: RgbaImage,
    /// Sum of absolute per-channel differences over the sample grid
    pub difference: u64,
}

/// Sampled difference between `input` and `output` seen through `orientation`
fn sampled_difference(input: &RgbaImage, output: &RgbaImage, orientation: Orientation) -> u64 {
    let (w, h) = output.dimensions();
    let mut diff = 0u64;
    for y in (0..input.height()).step_by(SAMPLE_STRIDE) {
        for x in (0..input.width()).step_by(SAMPLE_STRIDE) {
            let (sx, sy) = orientation.source_coords(x, y, w, h);
            let a = input.get_pixel(x, y);
            let b = output.get_pixel(sx, sy);
            diff += a
                .0
                .iter()
                .zip(b.0.iter())
                .map(|(&p, &q)| (p as i32 - q as i32).unsigned_abs() as u64)
                .sum::<u64>();
        }
    }
    diff
}

/// Pick the orientation of `output` that best matches `input`.
///
/// Candidates whose dimensions differ from the input are skipped; `None`
/// means no orientation of the output fits the input at all.
pub fn reconcile(input: &RgbaImage, output: RgbaImage) -> Option<Reconciled> {
    let (iw, ih) = input.dimensions();
    if iw == 0 || ih == 0 {
        return None;
    }

    let mut best: Option<(Orientation, u64)> = None;
    for orientation in Orientation::ALL {
        if orientation.output_dimensions(output.width(), output.height()) != (iw, ih) {
            continue;
        }
        let diff = sampled_difference(input, &output, orientation);
        if best.map_or(true, |(_, lowest)| diff < lowest) {
            best = Some((orientation, diff));
        }
    }

    let (orientation, difference) = best?;
    if orientation != Orientation::Identity {
        tracing::debug!("Engine output re-oriented with {:?} (diff {})", orientation, difference);
    }
    let image = match orientation {
        Orientation::Identity => output,
        other => other.apply(&output),
    };
    Some(Reconciled {
        orientation,
        image,
        difference,
    })
}
