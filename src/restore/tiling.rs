/// Tile geometry: splitting an image into overlapping tiles and stitching
/// the restored tiles back together.
///
/// Along an axis of length L with tile size T and overlap O:
/// - L <= T gives a single span covering the axis
/// - otherwise ceil(L / T) spans start at multiples of (T - O); every span
///   but the last is exactly T long and the last one runs to the boundary
///
/// Reassembly is a hard assignment: where two tiles overlap, the earlier
/// tile in scan order keeps the shared band and the later tile's copy is
/// discarded. Each pixel therefore belongs to exactly one tile core.

use image::{imageops, RgbaImage};

use crate::error::{RestoreError, Result};

/// Half-open pixel range on one axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: u32,
    end: u32,
    core_start: u32,
}

/// One tile of an image, in scan order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    /// Position in scan order (left-to-right, top-to-bottom)
    pub index: usize,
    pub col: u32,
    pub row: u32,
    /// Offset of the tile in the parent image
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Overlap with the neighbour on each side (0 on image edges)
    pub margin_left: u32,
    pub margin_top: u32,
    pub margin_right: u32,
    pub margin_bottom: u32,
}

impl Tile {
    /// Core rectangle in parent coordinates: (x, y, width, height)
    ///
    /// The left and top overlap bands belong to the previous tile.
    pub fn core(&self) -> (u32, u32, u32, u32) {
        (
            self.x + self.margin_left,
            self.y + self.margin_top,
            self.width - self.margin_left,
            self.height - self.margin_top,
        )
    }

}

/// The full tile decomposition of one image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGrid {
    pub image_width: u32,
    pub image_height: u32,
    pub tile_size: u32,
    pub overlap: u32,
    pub cols: u32,
    pub rows: u32,
    pub tiles: Vec<Tile>,
}

fn axis_spans(length: u32, tile_size: u32, overlap: u32) -> Vec<Span> {
    if length <= tile_size {
        return vec![Span {
            start: 0,
            end: length,
            core_start: 0,
        }];
    }

    let count = length.div_ceil(tile_size);
    let stride = tile_size - overlap;

    let mut spans: Vec<Span> = Vec::with_capacity(count as usize);
    for i in 0..count {
        let start = i * stride;
        let end = if i + 1 == count { length } else { start + tile_size };
        // Earlier tile wins the shared band
        let core_start = spans.last().map_or(0, |prev| prev.end);
        spans.push(Span {
            start,
            end,
            core_start,
        });
    }
    spans
}

/// Plan the tiles for a `width` x `height` image.
///
/// The tile count per axis is ceil(L / T), which yields the 2x2 grid at
/// stride 496 for a 1024 x 1024 image with T = 512, O = 16. Tiles are not
/// capped at T: the last tile on an axis grows to T + (n - 1) * O, e.g.
/// 1408 px for L = 4096, T = 512, O = 128. Callers with a hard memory
/// limit per tile should keep O small relative to T.
pub fn plan_tiles(width: u32, height: u32, tile_size: u32, overlap: u32) -> Result<TileGrid> {
    if tile_size == 0 {
        return Err(RestoreError::Geometry("tile size must be greater than zero".into()));
    }
    if overlap >= tile_size {
        return Err(RestoreError::Geometry(format!(
            "overlap {} must be smaller than tile size {}",
            overlap, tile_size
        )));
    }
    if width == 0 || height == 0 {
        return Err(RestoreError::Geometry(format!(
            "cannot tile an empty {}x{} image",
            width, height
        )));
    }

    let columns = axis_spans(width, tile_size, overlap);
    let rows = axis_spans(height, tile_size, overlap);

    let mut tiles = Vec::with_capacity(columns.len() * rows.len());
    for (row, v) in rows.iter().enumerate() {
        for (col, h) in columns.iter().enumerate() {
            let next_h = columns.get(col + 1);
            let next_v = rows.get(row + 1);
            tiles.push(Tile {
                index: tiles.len(),
                col: col as u32,
                row: row as u32,
                x: h.start,
                y: v.start,
                width: h.end - h.start,
                height: v.end - v.start,
                margin_left: h.core_start - h.start,
                margin_top: v.core_start - v.start,
                margin_right: next_h.map_or(0, |n| h.end - n.start),
                margin_bottom: next_v.map_or(0, |n| v.end - n.start),
            });
        }
    }

    Ok(TileGrid {
        image_width: width,
        image_height: height,
        tile_size,
        overlap,
        cols: columns.len() as u32,
        rows: rows.len() as u32,
        tiles,
    })
}

impl TileGrid {
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// More than one tile: the image is processed in chunks
    pub fn is_chunked(&self) -> bool {
        self.tiles.len() > 1
    }

    /// Copy a tile's pixels out of the source image
    pub fn extract(&self, source: &RgbaImage, tile: &Tile) -> RgbaImage {
        imageops::crop_imm(source, tile.x, tile.y, tile.width, tile.height).to_image()
    }

    /// The tile closest to the image centre, used as a stand-in for the
    /// whole image when probing model settings
    pub fn representative(&self) -> Option<&Tile> {
        let cx = self.image_width as i64 / 2;
        let cy = self.image_height as i64 / 2;
        self.tiles.iter().min_by_key(|t| {
            let tx = t.x as i64 + t.width as i64 / 2;
            let ty = t.y as i64 + t.height as i64 / 2;
            (tx - cx).pow(2) + (ty - cy).pow(2)
        })
    }

    /// Reassemble restored tiles (in scan order) into a full image
    pub fn stitch(&self, restored: &[RgbaImage]) -> Result<RgbaImage> {
        if restored.len() != self.tiles.len() {
            return Err(RestoreError::Geometry(format!(
                "expected {} restored tiles, got {}",
                self.tiles.len(),
                restored.len()
            )));
        }

        let mut output = RgbaImage::new(self.image_width, self.image_height);
        for (tile, pixels) in self.tiles.iter().zip(restored) {
            if pixels.dimensions() != (tile.width, tile.height) {
                return Err(RestoreError::Geometry(format!(
                    "tile {} is {}x{}, expected {}x{}",
                    tile.index,
                    pixels.width(),
                    pixels.height(),
                    tile.width,
                    tile.height
                )));
            }
            let (cx, cy, cw, ch) = tile.core();
            let core = imageops::crop_imm(pixels, tile.margin_left, tile.margin_top, cw, ch);
            imageops::replace(&mut output, &core.to_image(), cx as i64, cy as i64);
        }
        Ok(output)
    }
}
