//! Presence heuristic: "is a face likely in frame?" from pixel statistics.
//!
//! This is a coarse skin-tone and exposure test, not a detector. There is
//! no shape or geometry reasoning. Thresholds are fixed.

/// Lower bound (exclusive) on the skin-pixel ratio.
pub const MIN_SKIN_RATIO: f64 = 0.15;
/// Upper bound (exclusive) on the skin-pixel ratio.
pub const MAX_SKIN_RATIO: f64 = 0.6;
/// Lower bound (exclusive) on the well-exposed pixel ratio.
pub const MIN_BRIGHT_RATIO: f64 = 0.4;

/// Per-frame pixel statistics behind the presence verdict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresenceStats {
    pub total_pixels: usize,
    pub skin_pixels: usize,
    pub bright_pixels: usize,
}

impl PresenceStats {
    pub fn skin_ratio(&self) -> f64 {
        ratio(self.skin_pixels, self.total_pixels)
    }

    pub fn bright_ratio(&self) -> f64 {
        ratio(self.bright_pixels, self.total_pixels)
    }

    pub fn face_likely(&self) -> bool {
        if self.total_pixels == 0 {
            return false;
        }
        let skin = self.skin_ratio();
        skin > MIN_SKIN_RATIO && skin < MAX_SKIN_RATIO && self.bright_ratio() > MIN_BRIGHT_RATIO
    }
}

fn ratio(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

#[inline]
fn is_skin(r: u8, g: u8, b: u8) -> bool {
    r > 95 && g > 40 && b > 20 && r > g && r > b
}

/// `80 < (r+g+b)/3 < 200`, compared on the integer sum to avoid rounding.
#[inline]
fn is_bright(r: u8, g: u8, b: u8) -> bool {
    let sum = r as u16 + g as u16 + b as u16;
    sum > 240 && sum < 600
}

/// Count skin-toned and well-exposed pixels in an RGBA buffer.
///
/// The alpha channel is ignored; a trailing partial pixel is dropped.
pub fn analyze(rgba: &[u8]) -> PresenceStats {
    let mut stats = PresenceStats {
        total_pixels: 0,
        skin_pixels: 0,
        bright_pixels: 0,
    };
    for px in rgba.chunks_exact(4) {
        let (r, g, b) = (px[0], px[1], px[2]);
        stats.total_pixels += 1;
        if is_skin(r, g, b) {
            stats.skin_pixels += 1;
        }
        if is_bright(r, g, b) {
            stats.bright_pixels += 1;
        }
    }
    stats
}

/// True iff `0.15 < skin ratio < 0.6` and `bright ratio > 0.4`.
pub fn detect_presence(rgba: &[u8]) -> bool {
    let stats = analyze(rgba);
    let present = stats.face_likely();
    tracing::debug!(
        skin_ratio = stats.skin_ratio(),
        bright_ratio = stats.bright_ratio(),
        present,
        "presence heuristic"
    );
    present
}
