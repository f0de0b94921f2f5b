//! Visual overlay composition.
//!
//! Draws one colored rectangle per captured element onto a page screenshot,
//! labelled with the element's EncodedId, and returns the composite as PNG
//! bytes. Boxes fully outside the viewport are dropped.
//! Requires the `overlay` feature.

#[cfg(feature = "overlay")]
use image::{Rgba, RgbaImage};

#[cfg(feature = "overlay")]
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};

#[cfg(feature = "overlay")]
use imageproc::rect::Rect as PixelRect;

use std::collections::HashMap;

use crate::capture::Rect;
use crate::encoded::EncodedId;
use crate::error::{Error, Result};

/// Overlay drawing configuration
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Box line color (RGBA)
    pub box_color: [u8; 4],
    /// Label background color (RGBA)
    pub label_bg_color: [u8; 4],
    /// Label text color (RGBA)
    pub label_text_color: [u8; 4],
    /// Label padding in pixels
    pub label_padding: u32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            box_color: [255, 0, 0, 200],
            label_bg_color: [255, 0, 0, 220],
            label_text_color: [255, 255, 255, 255],
            label_padding: 2,
        }
    }
}

/// Compose the overlay with default colors
pub fn compose_overlay(
    screenshot_png: &[u8],
    boxes: &HashMap<EncodedId, Rect>,
) -> Result<Vec<u8>> {
    compose_overlay_with(screenshot_png, boxes, &OverlayConfig::default())
}

/// Draw one labelled rectangle per element onto the screenshot
#[cfg(feature = "overlay")]
pub fn compose_overlay_with(
    screenshot_png: &[u8],
    boxes: &HashMap<EncodedId, Rect>,
    config: &OverlayConfig,
) -> Result<Vec<u8>> {
    let img = image::load_from_memory(screenshot_png)
        .map_err(|e| Error::Decode(format!("Failed to load screenshot: {}", e)))?;
    let mut rgba = img.to_rgba8();
    let (viewport_w, viewport_h) = (rgba.width() as f64, rgba.height() as f64);

    let box_color = Rgba(config.box_color);
    let label_bg = Rgba(config.label_bg_color);
    let label_text = Rgba(config.label_text_color);

    // Stable drawing order keeps output deterministic.
    let mut ordered: Vec<(&EncodedId, &Rect)> = boxes.iter().collect();
    ordered.sort_by_key(|(id, _)| **id);

    for (id, rect) in ordered {
        // Fully outside the viewport: nothing to draw.
        if rect.x + rect.width <= 0.0
            || rect.y + rect.height <= 0.0
            || rect.x >= viewport_w
            || rect.y >= viewport_h
            || rect.is_empty()
        {
            continue;
        }

        let x = rect.x.max(0.0) as i32;
        let y = rect.y.max(0.0) as i32;
        let w = rect.width.min(viewport_w - rect.x.max(0.0)).max(1.0) as u32;
        let h = rect.height.min(viewport_h - rect.y.max(0.0)).max(1.0) as u32;

        draw_hollow_rect_mut(&mut rgba, PixelRect::at(x, y).of_size(w, h), box_color);

        // Label carrying the EncodedId, anchored above the box when possible.
        let label = id.to_string();
        let label_width = (label.len() as u32 * GLYPH_ADVANCE) + config.label_padding * 2;
        let label_height = GLYPH_HEIGHT + config.label_padding * 2;

        let label_x = x.max(0) as u32;
        let label_y = if (y as u32) >= label_height {
            y as u32 - label_height
        } else {
            y.max(0) as u32
        };

        draw_filled_rect_mut(
            &mut rgba,
            PixelRect::at(label_x as i32, label_y as i32).of_size(label_width, label_height),
            label_bg,
        );
        draw_label(
            &mut rgba,
            label_x + config.label_padding,
            label_y + config.label_padding,
            &label,
            label_text,
        );
    }

    let mut output = std::io::Cursor::new(Vec::new());
    rgba.write_to(&mut output, image::ImageFormat::Png)
        .map_err(|e| Error::Decode(format!("Failed to encode overlay: {}", e)))?;
    Ok(output.into_inner())
}

/// Horizontal advance per glyph (5 pixel columns + 3 of spacing)
#[cfg(feature = "overlay")]
const GLYPH_ADVANCE: u32 = 8;

/// Glyph height in pixel rows, plus room for the label box
#[cfg(feature = "overlay")]
const GLYPH_HEIGHT: u32 = 12;

/// 5x7 glyphs for the label alphabet — the ten digits plus the dash that
/// separates frameIndex from backendNodeId. One string per pixel row, `#`
/// marking lit pixels.
#[cfg(feature = "overlay")]
const GLYPHS: &[(char, [&str; 7])] = &[
    (
        '0',
        [
            " ### ", "#   #", "#  ##", "# # #", "##  #", "#   #", " ### ",
        ],
    ),
    (
        '1',
        [
            "  #  ", " ##  ", "  #  ", "  #  ", "  #  ", "  #  ", " ### ",
        ],
    ),
    (
        '2',
        [
            " ### ", "#   #", "    #", "  ## ", " #   ", "#    ", "#####",
        ],
    ),
    (
        '3',
        [
            " ### ", "#   #", "    #", "  ## ", "    #", "#   #", " ### ",
        ],
    ),
    (
        '4',
        [
            "   # ", "  ## ", " # # ", "#  # ", "#####", "   # ", "   # ",
        ],
    ),
    (
        '5',
        [
            "#####", "#    ", "#### ", "    #", "    #", "#   #", " ### ",
        ],
    ),
    (
        '6',
        [
            "  ## ", " #   ", "#    ", "#### ", "#   #", "#   #", " ### ",
        ],
    ),
    (
        '7',
        [
            "#####", "    #", "   # ", "  #  ", " #   ", " #   ", " #   ",
        ],
    ),
    (
        '8',
        [
            " ### ", "#   #", "#   #", " ### ", "#   #", "#   #", " ### ",
        ],
    ),
    (
        '9',
        [
            " ### ", "#   #", "#   #", " ####", "    #", "   # ", " ##  ",
        ],
    ),
    (
        '-',
        [
            "     ", "     ", "     ", " ### ", "     ", "     ", "     ",
        ],
    ),
];

#[cfg(feature = "overlay")]
fn glyph(ch: char) -> Option<&'static [&'static str; 7]> {
    GLYPHS
        .iter()
        .find(|(glyph_char, _)| *glyph_char == ch)
        .map(|(_, rows)| rows)
}

/// Rasterize an EncodedId string; characters without a glyph are skipped
#[cfg(feature = "overlay")]
fn draw_label(img: &mut RgbaImage, x: u32, y: u32, text: &str, color: Rgba<u8>) {
    let mut cursor_x = x;
    for ch in text.chars() {
        let Some(rows) = glyph(ch) else { continue };
        for (dy, row) in rows.iter().enumerate() {
            for (dx, cell) in row.bytes().enumerate() {
                if cell != b'#' {
                    continue;
                }
                let px = cursor_x + dx as u32;
                let py = y + dy as u32;
                if px < img.width() && py < img.height() {
                    img.put_pixel(px, py, color);
                }
            }
        }
        cursor_x += GLYPH_ADVANCE;
    }
}

/// Stub for when the overlay feature is not enabled
#[cfg(not(feature = "overlay"))]
pub fn compose_overlay_with(
    _screenshot_png: &[u8],
    _boxes: &HashMap<EncodedId, Rect>,
    _config: &OverlayConfig,
) -> Result<Vec<u8>> {
    Err(Error::Decode(
        "overlay feature not enabled - add `overlay` feature to Cargo.toml".to_string(),
    ))
}

#[cfg(all(test, feature = "overlay"))]
mod tests {
    use super::*;

    fn blank_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn glyph_table_covers_the_id_alphabet() {
        for ch in "0123456789-".chars() {
            let rows = glyph(ch).unwrap_or_else(|| panic!("no glyph for {:?}", ch));
            for row in rows {
                assert_eq!(row.len(), 5, "glyph {:?} row {:?} is not 5 wide", ch, row);
            }
        }
        assert!(glyph('x').is_none());
    }

    #[test]
    fn overlay_produces_valid_png() {
        let png = blank_png(200, 100);
        let mut boxes = HashMap::new();
        boxes.insert(
            EncodedId::new(0, 12),
            Rect { x: 20.0, y: 30.0, width: 80.0, height: 40.0 },
        );

        let out = compose_overlay(&png, &boxes).unwrap();
        assert_eq!(&out[0..4], &[0x89, 0x50, 0x4E, 0x47]);

        // The box must actually have been drawn.
        let img = image::load_from_memory(&out).unwrap().to_rgba8();
        assert_eq!(img.get_pixel(20, 30), &Rgba([255, 0, 0, 200]));
    }

    #[test]
    fn boxes_outside_viewport_are_dropped() {
        let png = blank_png(100, 100);
        let mut boxes = HashMap::new();
        boxes.insert(
            EncodedId::new(0, 1),
            Rect { x: 500.0, y: 500.0, width: 50.0, height: 50.0 },
        );

        let out = compose_overlay(&png, &boxes).unwrap();
        let img = image::load_from_memory(&out).unwrap().to_rgba8();
        // Untouched white everywhere.
        for pixel in img.pixels() {
            assert_eq!(pixel, &Rgba([255, 255, 255, 255]));
        }
    }

    #[test]
    fn empty_box_map_round_trips_screenshot() {
        let png = blank_png(50, 50);
        let out = compose_overlay(&png, &HashMap::new()).unwrap();
        assert_eq!(&out[0..4], &[0x89, 0x50, 0x4E, 0x47]);
    }
}
