//! Caret color allocation.
//!
//! Each session gets a stable CSS hex color drawn from a fixed
//! saturation/lightness hue wheel. New sessions take the candidate hue
//! farthest (by minimum circular hue distance) from every color already
//! in use, so simultaneous authors stay visually distinct.
//!
//! Known quirk, preserved deliberately: a grayscale color has no hue
//! and parses as hue 0, so blacks and whites cluster with reds in the
//! distance metric.

/// Candidate hues, degrees around the wheel.
const CANDIDATE_COUNT: u32 = 16;

/// Saturation/lightness for every allocated color.
const SATURATION: f32 = 0.7;
const LIGHTNESS: f32 = 0.6;

/// Pick a color for a new caret, avoiding the hues already in use.
///
/// `in_use` holds `#rrggbb` strings; unparseable entries are ignored.
/// With nothing in use the first candidate (red) wins.
pub fn pick_caret_color(in_use: &[String]) -> String {
    let used_hues: Vec<f32> = in_use.iter().filter_map(|c| parse_hue(c)).collect();

    let mut best_hue = 0.0;
    let mut best_distance = -1.0_f32;
    for i in 0..CANDIDATE_COUNT {
        let hue = i as f32 * (360.0 / CANDIDATE_COUNT as f32);
        let distance = used_hues
            .iter()
            .map(|used| hue_distance(hue, *used))
            .fold(f32::INFINITY, f32::min);
        if distance > best_distance {
            best_distance = distance;
            best_hue = hue;
        }
    }
    hex_from_hsl(best_hue / 360.0, SATURATION, LIGHTNESS)
}

/// Circular distance between two hues, in degrees (0..=180).
fn hue_distance(a: f32, b: f32) -> f32 {
    let d = (a - b).abs() % 360.0;
    d.min(360.0 - d)
}

/// Hue in degrees of a `#rrggbb` color. Grayscale reads as hue 0.
fn parse_hue(color: &str) -> Option<f32> {
    let hex = color.strip_prefix('#')?;
    if hex.len() != 6 {
        return None;
    }
    let r = u8::from_str_radix(&hex[0..2], 16).ok()? as f32 / 255.0;
    let g = u8::from_str_radix(&hex[2..4], 16).ok()? as f32 / 255.0;
    let b = u8::from_str_radix(&hex[4..6], 16).ok()? as f32 / 255.0;

    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    if delta <= f32::EPSILON {
        return Some(0.0);
    }
    let hue = if max == r {
        60.0 * (((g - b) / delta) % 6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    Some((hue + 360.0) % 360.0)
}

/// Format an HSL color (all components in 0..=1) as `#rrggbb`.
///
/// Chroma formulation: the hue wheel splits into six sectors; `chroma`
/// is the dominant channel's strength, `fade` the secondary channel
/// ramping across the sector, and `floor` the lightness added to all
/// three channels.
fn hex_from_hsl(h: f32, s: f32, l: f32) -> String {
    let chroma = (1.0 - (2.0 * l - 1.0).abs()) * s;
    let sector = h.rem_euclid(1.0) * 6.0;
    let fade = chroma * (1.0 - (sector % 2.0 - 1.0).abs());
    let floor = l - chroma / 2.0;

    let (r, g, b) = match sector as u32 {
        0 => (chroma, fade, 0.0),
        1 => (fade, chroma, 0.0),
        2 => (0.0, chroma, fade),
        3 => (0.0, fade, chroma),
        4 => (fade, 0.0, chroma),
        _ => (chroma, 0.0, fade),
    };
    let byte = |channel: f32| ((channel + floor) * 255.0).round() as u8;
    format!("#{:02x}{:02x}{:02x}", byte(r), byte(g), byte(b))
}

/// Whether a string is a well-formed `#rrggbb` color.
pub fn is_valid_color(color: &str) -> bool {
    color.len() == 7
        && color.starts_with('#')
        && color[1..].bytes().all(|b| b.is_ascii_hexdigit())
}
