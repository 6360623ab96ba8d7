//! Sequential white-to-red palette

use image::Rgb;

// ColorBrewer "Reds", 9 classes
const REDS: [[u8; 3]; 9] = [
    [255, 245, 240],
    [254, 224, 210],
    [252, 187, 161],
    [252, 146, 114],
    [251, 106, 74],
    [239, 59, 44],
    [203, 24, 29],
    [165, 15, 21],
    [103, 0, 13],
];

/// Map a value in [0, 1] to a color, interpolating between palette stops
pub fn reds(value: f32) -> Rgb<u8> {
    let value = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
    let scaled = value * (REDS.len() - 1) as f32;
    let lower = (scaled.floor() as usize).min(REDS.len() - 2);
    let t = scaled - lower as f32;

    let (a, b) = (REDS[lower], REDS[lower + 1]);
    Rgb([
        lerp(a[0], b[0], t),
        lerp(a[1], b[1], t),
        lerp(a[2], b[2], t),
    ])
}

fn lerp(a: u8, b: u8, t: f32) -> u8 {
    (a as f32 + (b as f32 - a as f32) * t).round() as u8
}
