//! Display-mode strings and colour modes.
//!
//! A display mode is the canonical `WxHxBxC` string a device reports,
//! e.g. `800x480x1xB`: viewport width, height, bit depth, colour mode
//! letter. The (bits, letter) pairs are fixed:
//!
//! | letter | bits | encoding                         |
//! |--------|------|----------------------------------|
//! | `B`    | 1    | mono, Floyd–Steinberg dithered   |
//! | `R`    | 2    | four-colour palette              |
//! | `G`    | 8    | grayscale                        |
//! | `C`    | 24   | raw RGB                          |

use std::fmt;
use std::str::FromStr;

use crate::error::WebInkError;

// ── ColorMode ────────────────────────────────────────────────────

/// One of the four supported tile encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorMode {
    /// 1-bit mono (`B`).
    Mono,
    /// 2-bit four-colour palette (`R`).
    Palette,
    /// 8-bit grayscale (`G`).
    Gray,
    /// 24-bit raw RGB (`C`).
    Rgb,
}

impl ColorMode {
    /// Parse the single-letter mode code.
    pub fn from_letter(c: char) -> Option<Self> {
        match c {
            'B' => Some(ColorMode::Mono),
            'R' => Some(ColorMode::Palette),
            'G' => Some(ColorMode::Gray),
            'C' => Some(ColorMode::Rgb),
            _ => None,
        }
    }

    /// The single-letter code used in mode strings.
    pub fn letter(&self) -> char {
        match self {
            ColorMode::Mono => 'B',
            ColorMode::Palette => 'R',
            ColorMode::Gray => 'G',
            ColorMode::Rgb => 'C',
        }
    }

    /// Bit depth per pixel on the wire.
    pub fn bits(&self) -> u32 {
        match self {
            ColorMode::Mono => 1,
            ColorMode::Palette => 2,
            ColorMode::Gray => 8,
            ColorMode::Rgb => 24,
        }
    }

    /// The format token clients pass in requests (`pbm`/`pgm`/`ppm`).
    pub fn format_token(&self) -> &'static str {
        match self {
            ColorMode::Mono => "pbm",
            ColorMode::Palette | ColorMode::Gray => "pgm",
            ColorMode::Rgb => "ppm",
        }
    }

    /// MIME type for HTTP responses carrying this encoding.
    pub fn content_type(&self) -> &'static str {
        match self {
            ColorMode::Mono => "image/x-portable-bitmap",
            ColorMode::Palette | ColorMode::Gray => "image/x-portable-graymap",
            ColorMode::Rgb => "image/x-portable-pixmap",
        }
    }
}

// ── DisplayMode ──────────────────────────────────────────────────

/// A parsed `WxHxBxC` display-mode string.
///
/// Embedded in requests and mixed into fingerprints; two modes are
/// equal iff their canonical strings are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    pub color: ColorMode,
}

impl DisplayMode {
    pub fn new(width: u32, height: u32, color: ColorMode) -> Self {
        Self {
            width,
            height,
            color,
        }
    }

    /// Number of pixels in a full frame.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}x{}",
            self.width,
            self.height,
            self.color.bits(),
            self.color.letter()
        )
    }
}

impl FromStr for DisplayMode {
    type Err = WebInkError;

    /// Strict parse of `WxHxBxC`. Unknown forms, zero dimensions, and
    /// bits/letter mismatches are all rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || WebInkError::InvalidMode(s.to_string());

        let mut parts = s.split('x');
        let width: u32 = parse_dim(parts.next().ok_or_else(bad)?).ok_or_else(bad)?;
        let height: u32 = parse_dim(parts.next().ok_or_else(bad)?).ok_or_else(bad)?;
        let bits: u32 = parse_dim(parts.next().ok_or_else(bad)?).ok_or_else(bad)?;
        let letter = parts.next().ok_or_else(bad)?;
        if parts.next().is_some() {
            return Err(bad());
        }

        if width == 0 || height == 0 {
            return Err(bad());
        }

        let mut chars = letter.chars();
        let c = chars.next().ok_or_else(bad)?;
        if chars.next().is_some() {
            return Err(bad());
        }

        let color = ColorMode::from_letter(c).ok_or_else(bad)?;
        if color.bits() != bits {
            return Err(bad());
        }

        Ok(DisplayMode {
            width,
            height,
            color,
        })
    }
}

/// Parse an unsigned decimal component with no sign, whitespace, or
/// leading-`+` forgiveness.
fn parse_dim(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

// ── Tests ────────────────────────────────────────────────────────
