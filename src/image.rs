//! Frame handling: decode, scale, similarity scoring and needle search.
//!
//! Frames are cheap, shareable handles (`Arc` inside), so the assert
//! engine can keep failure frames around without copying pixel data.
//!
//! Similarity is an integer 0..10000 where HIGHER means MORE similar.
//! The scale is nonlinear: identical frames score 10000, and a frame
//! with ~10% of its pixels changed already drops around 50. The dedup
//! and encoder thresholds in the capture pipeline are calibrated
//! against this curve.

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

use crate::needle::Needle;

/// Score of two identical frames.
pub const SIMILARITY_MAX: u32 = 10000;

/// Per-channel delta below which two pixels count as equal.
/// Absorbs scaling and encoder rounding noise.
const PIXEL_TOLERANCE: u8 = 8;

/// How far (in pixels) a needle area may drift from its recorded
/// position and still match.
const SEARCH_MARGIN: i32 = 4;

/// Opaque handle to a decoded frame.
#[derive(Clone)]
pub struct ImageRef {
    pixels: Arc<RgbImage>,
}

impl From<RgbImage> for ImageRef {
    fn from(img: RgbImage) -> Self {
        Self { pixels: Arc::new(img) }
    }
}

impl ImageRef {
    /// Decode a frame from disk (PNG, PPM, anything the decoder knows).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let img = image::open(path)
            .with_context(|| format!("failed to decode frame {}", path.display()))?;
        Ok(Self { pixels: Arc::new(img.to_rgb8()) })
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Scale to exactly `w` x `h`. A frame already at the target size is
    /// returned as-is (shared handle, no resample).
    pub fn scale(&self, w: u32, h: u32) -> ImageRef {
        if self.width() == w && self.height() == h {
            return self.clone();
        }
        let resized = image::imageops::resize(&*self.pixels, w, h, FilterType::Triangle);
        ImageRef { pixels: Arc::new(resized) }
    }

    /// Write the frame as PNG.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.pixels
            .save(path)
            .with_context(|| format!("failed to write screenshot {}", path.display()))
    }

    /// Similarity to another frame, 0..10000, higher = more similar.
    /// Symmetric; monotone in the fraction of changed pixels. Frames of
    /// different dimensions score 0.
    pub fn similarity(&self, other: &ImageRef) -> u32 {
        if self.width() != other.width() || self.height() != other.height() {
            return 0;
        }
        let total = (self.width() as u64) * (self.height() as u64);
        if total == 0 {
            return SIMILARITY_MAX;
        }
        let mut changed: u64 = 0;
        for (a, b) in self.pixels.pixels().zip(other.pixels.pixels()) {
            if !pixels_close(a.0, b.0) {
                changed += 1;
            }
        }
        if changed == 0 {
            return SIMILARITY_MAX;
        }
        let fraction = changed as f64 / total as f64;
        let sim = (SIMILARITY_MAX as f64 / (1.0 + 2000.0 * fraction)).round() as u32;
        sim.min(SIMILARITY_MAX)
    }

    /// Search this frame for the first matching needle.
    ///
    /// `ratio` bounds how much of the needle list is actually tried in
    /// this pass: 0.02 is the cheap periodic poll, 1.0 the exhaustive
    /// search. At least one candidate is always tried. `threshold`
    /// loosens every area's required match level by that many percent.
    ///
    /// Returns the match (if any) and the per-candidate failure records
    /// for everything that was tried and missed.
    pub fn search(
        &self,
        needles: &[Arc<Needle>],
        threshold: f64,
        ratio: f64,
    ) -> (Option<Value>, Vec<Value>) {
        if needles.is_empty() {
            return (None, Vec::new());
        }
        let count = ((needles.len() as f64 * ratio).ceil() as usize)
            .clamp(1, needles.len());

        let mut failed = Vec::new();
        for needle in &needles[..count] {
            match self.match_needle(needle, threshold) {
                NeedleOutcome::Matched { areas, quality } => {
                    let found = json!({
                        "name": needle.name,
                        "tags": needle.tags,
                        "match": quality,
                        "area": areas,
                    });
                    return (Some(found), failed);
                }
                NeedleOutcome::Missed { quality, needed } => {
                    failed.push(json!({
                        "name": needle.name,
                        "match": quality,
                        "needed": needed,
                    }));
                }
            }
        }
        (None, failed)
    }

    /// Try a single needle: every area must reach its match level
    /// (minus `threshold`), allowing a small positional drift.
    fn match_needle(&self, needle: &Needle, threshold: f64) -> NeedleOutcome {
        let mut areas = Vec::new();
        // worst area decides the overall match quality
        let mut quality = 100.0f64;
        let mut needed = 0.0f64;

        for area in &needle.areas {
            let required = area.match_level - threshold;
            let pct = self.best_area_match(&needle.image, area.x, area.y, area.w, area.h);
            if pct < required {
                return NeedleOutcome::Missed {
                    quality: pct.min(quality),
                    needed: required.max(needed),
                };
            }
            quality = quality.min(pct);
            needed = needed.max(required);
            areas.push(json!({
                "x": area.x,
                "y": area.y,
                "w": area.w,
                "h": area.h,
                "similarity": pct,
            }));
        }
        NeedleOutcome::Matched { areas, quality }
    }

    /// Best match percentage for one area over a small offset window.
    fn best_area_match(&self, reference: &ImageRef, x: u32, y: u32, w: u32, h: u32) -> f64 {
        let mut best = 0.0f64;
        let mut dy = -SEARCH_MARGIN;
        while dy <= SEARCH_MARGIN {
            let mut dx = -SEARCH_MARGIN;
            while dx <= SEARCH_MARGIN {
                let pct = self.area_match_at(reference, x, y, w, h, dx, dy);
                if pct > best {
                    best = pct;
                }
                // an exact hit cannot be improved on
                if best >= 100.0 {
                    return best;
                }
                dx += 2;
            }
            dy += 2;
        }
        best
    }

    /// Fraction (percent) of pixels in the area that match the
    /// reference image, with the frame-side region shifted by (dx, dy).
    fn area_match_at(
        &self,
        reference: &ImageRef,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        dx: i32,
        dy: i32,
    ) -> f64 {
        let fx = x as i64 + dx as i64;
        let fy = y as i64 + dy as i64;
        if fx < 0
            || fy < 0
            || fx + w as i64 > self.width() as i64
            || fy + h as i64 > self.height() as i64
            || x as u64 + w as u64 > reference.width() as u64
            || y as u64 + h as u64 > reference.height() as u64
        {
            return 0.0;
        }
        let total = (w as u64) * (h as u64);
        if total == 0 {
            return 0.0;
        }
        let mut matching: u64 = 0;
        for row in 0..h {
            for col in 0..w {
                let fp = self.pixels.get_pixel(fx as u32 + col, fy as u32 + row);
                let rp = reference.pixels.get_pixel(x + col, y + row);
                if pixels_close(fp.0, rp.0) {
                    matching += 1;
                }
            }
        }
        matching as f64 * 100.0 / total as f64
    }
}

enum NeedleOutcome {
    Matched { areas: Vec<Value>, quality: f64 },
    Missed { quality: f64, needed: f64 },
}

fn pixels_close(a: [u8; 3], b: [u8; 3]) -> bool {
    a.iter()
        .zip(b.iter())
        .all(|(x, y)| x.abs_diff(*y) <= PIXEL_TOLERANCE)
}
