//! Blurhash encoding (§4.3): sRGB→linear via the piecewise γ≈2.4 curve, cosine-basis
//! component extraction over a 32×32 decimation, DC packed as linear→sRGB-quantized bytes, AC
//! packed as sign-preserving-pow-0.5 quantized values, all base83-encoded.

use image::{imageops::FilterType, DynamicImage, GenericImageView};

const BASE83_ALPHABET: &[u8] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz#$%*+,-.:;=?@[]^_{|}~";

/// Side length of the decimated grid components are computed over (§4.3: "32×32").
const GRID_SIZE: u32 = 32;

fn srgb_to_linear(value: f64) -> f64 {
    if value <= 0.04045 {
        value / 12.92
    } else {
        ((value + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(value: f64) -> f64 {
    let value = value.clamp(0.0, 1.0);
    if value <= 0.0031308 {
        value * 12.92
    } else {
        1.055 * value.powf(1.0 / 2.4) - 0.055
    }
}

fn sign_pow(value: f64, exponent: f64) -> f64 {
    value.signum() * value.abs().powf(exponent)
}

fn encode_base83(mut value: u32, length: usize) -> String {
    let mut digits = vec![0u8; length];
    for slot in digits.iter_mut().rev() {
        *slot = BASE83_ALPHABET[(value % 83) as usize];
        value /= 83;
    }
    String::from_utf8(digits).expect("base83 alphabet is ASCII")
}

/// Encodes `image` as a blurhash with `components_x` horizontal and `components_y` vertical
/// components (spec default 4×3). Each component count must be in `1..=9`.
pub fn encode(image: &DynamicImage, components_x: u32, components_y: u32) -> String {
    let decimated = image.resize_exact(GRID_SIZE, GRID_SIZE, FilterType::Triangle).to_rgba8();
    let width = GRID_SIZE as f64;
    let height = GRID_SIZE as f64;

    let linear_pixels: Vec<[f64; 3]> = decimated
        .pixels()
        .map(|p| {
            [
                srgb_to_linear(f64::from(p[0]) / 255.0),
                srgb_to_linear(f64::from(p[1]) / 255.0),
                srgb_to_linear(f64::from(p[2]) / 255.0),
            ]
        })
        .collect();

    let mut factors = Vec::with_capacity((components_x * components_y) as usize);
    for j in 0..components_y {
        for i in 0..components_x {
            let normalization = if i == 0 && j == 0 { 1.0 } else { 2.0 };
            let mut sum = [0.0f64; 3];
            for y in 0..GRID_SIZE {
                for x in 0..GRID_SIZE {
                    let basis = (std::f64::consts::PI * f64::from(i) * (f64::from(x) + 0.5) / width).cos()
                        * (std::f64::consts::PI * f64::from(j) * (f64::from(y) + 0.5) / height).cos();
                    let pixel = linear_pixels[(y * GRID_SIZE + x) as usize];
                    sum[0] += basis * pixel[0];
                    sum[1] += basis * pixel[1];
                    sum[2] += basis * pixel[2];
                }
            }
            let scale = normalization / (width * height);
            factors.push([sum[0] * scale, sum[1] * scale, sum[2] * scale]);
        }
    }

    let dc = factors[0];
    let ac = &factors[1..];

    let actual_max = ac
        .iter()
        .flat_map(|c| c.iter().copied())
        .fold(0.0f64, |acc, v| acc.max(v.abs()));

    let quantised_max = if ac.is_empty() {
        0
    } else {
        ((actual_max * 166.0 - 0.5).floor() as i64).clamp(0, 82) as u32
    };
    let max_value = if quantised_max == 0 {
        1.0
    } else {
        f64::from(quantised_max + 1) / 166.0
    };

    let size_flag = (components_x - 1) + (components_y - 1) * 9;

    let mut out = String::new();
    out.push_str(&encode_base83(size_flag, 1));
    out.push_str(&encode_base83(quantised_max, 1));

    let dc_value = (quantize_dc_channel(dc[0]) << 16) | (quantize_dc_channel(dc[1]) << 8) | quantize_dc_channel(dc[2]);
    out.push_str(&encode_base83(dc_value, 4));

    for component in ac {
        let quantize = |v: f64| -> u32 {
            (sign_pow(v / max_value, 0.5) * 9.0 + 9.5).floor().clamp(0.0, 18.0) as u32
        };
        let packed = quantize(component[0]) * 19 * 19 + quantize(component[1]) * 19 + quantize(component[2]);
        out.push_str(&encode_base83(packed, 2));
    }

    out
}

fn quantize_dc_channel(linear: f64) -> u32 {
    (linear_to_srgb(linear) * 255.0).round().clamp(0.0, 255.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn uniform_image(color: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            1,
            1,
            Rgba([color[0], color[1], color[2], 255]),
        ))
    }

    #[test]
    fn size_flag_digit_matches_four_by_three_components() {
        let hash = encode(&uniform_image([255, 0, 0]), 4, 3);
        // sizeFlag = (4-1) + (3-1)*9 = 21, base83 digit 21 is 'L'.
        assert_eq!(&hash[0..1], "L");
    }

    #[test]
    fn encoding_is_deterministic() {
        let image = uniform_image([255, 0, 0]);
        assert_eq!(encode(&image, 4, 3), encode(&image, 4, 3));
    }

    #[test]
    fn uniform_field_has_no_ac_energy() {
        // A uniform-color image has zero cosine-basis energy in every non-DC component, so the
        // quantized AC scale digit collapses to 0.
        let hash = encode(&uniform_image([20, 120, 220]), 4, 3);
        assert_eq!(&hash[1..2], "0");
    }

    #[test]
    fn hash_length_matches_component_count() {
        let hash = encode(&uniform_image([128, 128, 128]), 4, 3);
        // 1 (size) + 1 (max ac) + 4 (dc) + 2 * (4*3 - 1) ac components
        assert_eq!(hash.len(), 1 + 1 + 4 + 2 * 11);
    }
}
