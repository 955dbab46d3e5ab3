use image::RgbaImage;
use palette::color_difference::Ciede2000;
use palette::{FromColor, Lab, Srgb};
use serde::{Deserialize, Serialize};

/// Dofus 官方染色器的参考色板（截取常用档）。
/// snap_to_dofus_palette 只会输出这里面的颜色。
pub const DOFUS_REFERENCE: &[&str] = &[
    "f2e6b3", "e8c14c", "d98e26", "a85b19", "73401a", // 黄棕系
    "e85c5c", "b32424", "731616", // 红系
    "8fd94c", "3f8c26", "1f5919", // 绿系
    "4cc3e8", "2673b3", "193c73", // 蓝系
    "c46ee8", "7326a8", // 紫系
    "f2f2f2", "b3b3b3", "595959", "1a1a1a", // 灰阶
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DofusPalette {
    pub primary: String,
    pub secondary: String,
    pub tertiary: String,
}

impl Default for DofusPalette {
    fn default() -> Self {
        Self {
            primary: "b3b3b3".to_string(),
            secondary: "595959".to_string(),
            tertiary: "f2f2f2".to_string(),
        }
    }
}

impl DofusPalette {
    pub fn colors(&self) -> [&str; 3] {
        [&self.primary, &self.secondary, &self.tertiary]
    }
}

/// "aabbcc" 或 "#aabbcc" → RGB。长度/字符不对返回 None。
pub fn parse_hex(hex: &str) -> Option<[u8; 3]> {
    let h = hex.trim_start_matches('#');
    if h.len() != 6 {
        return None;
    }
    let r = u8::from_str_radix(&h[0..2], 16).ok()?;
    let g = u8::from_str_radix(&h[2..4], 16).ok()?;
    let b = u8::from_str_radix(&h[4..6], 16).ok()?;
    Some([r, g, b])
}

pub fn to_hex(rgb: [u8; 3]) -> String {
    format!("{:02x}{:02x}{:02x}", rgb[0], rgb[1], rgb[2])
}

/// sRGB (0-255) → CIE Lab，D65 白点。
pub fn rgb_to_lab(r: u8, g: u8, b: u8) -> Lab {
    let srgb = Srgb::new(r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0);
    Lab::from_color(srgb)
}

/// CIEDE2000 感知色差。对称，相同颜色为 0。
pub fn delta_e2000(a: Lab, b: Lab) -> f32 {
    a.difference(b)
}

/// 确定性 k-means 主色提取。
///
/// 质心用等间距采样初始化（不用随机数，同样的输入顺序必然得到同样的结果）；
/// 空簇重新落到离自己质心最远的像素上。返回 (颜色, 成员数)，按成员数降序，
/// 不足 k 个时重复最后一个颜色补齐。
pub fn kmeans_dominant_colors(
    pixels: &[[u8; 3]],
    k: usize,
    max_iterations: usize,
) -> Vec<([u8; 3], usize)> {
    if pixels.is_empty() || k == 0 {
        return Vec::new();
    }

    let n = pixels.len();
    let k = k.min(n);

    // 等间距初始化
    let mut centroids: Vec<[f32; 3]> = (0..k)
        .map(|i| {
            let p = pixels[i * n / k];
            [p[0] as f32, p[1] as f32, p[2] as f32]
        })
        .collect();
    let mut assignment = vec![0usize; n];

    for _ in 0..max_iterations {
        let mut changed = false;

        for (i, p) in pixels.iter().enumerate() {
            let mut best = 0usize;
            let mut best_d = f32::MAX;
            for (ci, c) in centroids.iter().enumerate() {
                let dr = p[0] as f32 - c[0];
                let dg = p[1] as f32 - c[1];
                let db = p[2] as f32 - c[2];
                let d = dr * dr + dg * dg + db * db;
                if d < best_d {
                    best_d = d;
                    best = ci;
                }
            }
            if assignment[i] != best {
                assignment[i] = best;
                changed = true;
            }
        }

        let mut sums = vec![[0f64; 3]; k];
        let mut counts = vec![0usize; k];
        for (i, p) in pixels.iter().enumerate() {
            let a = assignment[i];
            sums[a][0] += p[0] as f64;
            sums[a][1] += p[1] as f64;
            sums[a][2] += p[2] as f64;
            counts[a] += 1;
        }
        for ci in 0..k {
            if counts[ci] > 0 {
                centroids[ci] = [
                    (sums[ci][0] / counts[ci] as f64) as f32,
                    (sums[ci][1] / counts[ci] as f64) as f32,
                    (sums[ci][2] / counts[ci] as f64) as f32,
                ];
            } else {
                // 空簇：落到离旧质心最远的像素（保持确定性）
                let old = centroids[ci];
                let far = pixels
                    .iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| {
                        dist2(a, &old)
                            .partial_cmp(&dist2(b, &old))
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                let p = pixels[far];
                centroids[ci] = [p[0] as f32, p[1] as f32, p[2] as f32];
            }
        }

        if !changed {
            break;
        }
    }

    let mut counts = vec![0usize; k];
    for &a in &assignment {
        counts[a] += 1;
    }

    let mut clusters: Vec<([u8; 3], usize)> = centroids
        .iter()
        .zip(counts.iter())
        .filter(|(_, &c)| c > 0)
        .map(|(c, &count)| {
            (
                [
                    c[0].round().clamp(0.0, 255.0) as u8,
                    c[1].round().clamp(0.0, 255.0) as u8,
                    c[2].round().clamp(0.0, 255.0) as u8,
                ],
                count,
            )
        })
        .collect();
    clusters.sort_by(|a, b| b.1.cmp(&a.1));

    // 不足 k 个时重复最后一个补齐
    while clusters.len() < k {
        if let Some(&last) = clusters.last() {
            clusters.push(last);
        } else {
            break;
        }
    }
    clusters
}

fn dist2(p: &[u8; 3], c: &[f32; 3]) -> f32 {
    let dr = p[0] as f32 - c[0];
    let dg = p[1] as f32 - c[1];
    let db = p[2] as f32 - c[2];
    dr * dr + dg * dg + db * db
}

/// 任意颜色吸附到 Dofus 参考色板（逐个取 deltaE2000 最小项）。
pub fn snap_to_dofus_palette(labs: &[Lab]) -> DofusPalette {
    let reference: Vec<(String, Lab)> = DOFUS_REFERENCE
        .iter()
        .filter_map(|hex| {
            let rgb = parse_hex(hex)?;
            Some((hex.to_string(), rgb_to_lab(rgb[0], rgb[1], rgb[2])))
        })
        .collect();

    let snap_one = |lab: Lab| -> String {
        reference
            .iter()
            .min_by(|(_, a), (_, b)| {
                delta_e2000(lab, *a)
                    .partial_cmp(&delta_e2000(lab, *b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(hex, _)| hex.clone())
            .unwrap_or_else(|| "b3b3b3".to_string())
    };

    let fallback = DofusPalette::default();
    let get = |i: usize| -> String {
        labs.get(i)
            .or_else(|| labs.last())
            .map(|&l| snap_one(l))
            .unwrap_or_else(|| match i {
                0 => fallback.primary.clone(),
                1 => fallback.secondary.clone(),
                _ => fallback.tertiary.clone(),
            })
    };

    DofusPalette {
        primary: get(0),
        secondary: get(1),
        tertiary: get(2),
    }
}

/// 从画布前景像素提取三个主色并吸附到参考色板。
pub fn extract_palette(canvas: &RgbaImage, mask: &[u8]) -> DofusPalette {
    // 稀疏采样，主色提取不需要全量像素
    let mut samples: Vec<[u8; 3]> = Vec::new();
    for (i, px) in canvas.pixels().enumerate() {
        if mask.get(i).copied().unwrap_or(0) == 1 && i % 3 == 0 {
            samples.push([px.0[0], px.0[1], px.0[2]]);
        }
    }
    if samples.is_empty() {
        return DofusPalette::default();
    }

    let clusters = kmeans_dominant_colors(&samples, 3, 12);
    let labs: Vec<Lab> = clusters
        .iter()
        .map(|(rgb, _)| rgb_to_lab(rgb[0], rgb[1], rgb[2]))
        .collect();
    snap_to_dofus_palette(&labs)
}
