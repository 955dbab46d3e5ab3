use image::imageops::FilterType;
use image::{GrayImage, RgbaImage};
use imageproc::gradients::{horizontal_sobel, vertical_sobel};

/// 描述子维度。索引里所有 embedding 都是这个长度。
pub const EMBED_DIM: usize = 64;

/// 特征分析统一缩放到的小图边长
const PATCH_SIZE: u32 = 32;
const ORIENT_BINS: usize = 16;

/// embedding 后端的可插拔接口。
///
/// 管线只要求：同样的输入给同样的输出、长度固定为 EMBED_DIM、
/// 全透明 patch 返回零向量而不是报错。换成真模型推理时实现这个 trait 即可，
/// 匹配和重排逻辑完全不用动。
pub trait FeatureBackend: Send + Sync {
    fn embed(&self, patch: &RgbaImage) -> Vec<f32>;
}

/// 默认后端：确定性像素统计投影（直方图 + 亮度块均值 + 方向直方图）。
/// 数值本身没有语义，只保证确定、有界、排序上够用。
#[derive(Debug, Default, Clone, Copy)]
pub struct StatsEmbedder;

impl FeatureBackend for StatsEmbedder {
    fn embed(&self, patch: &RgbaImage) -> Vec<f32> {
        let small = resize_patch(patch);
        let fg: Vec<&image::Rgba<u8>> = small.pixels().filter(|p| p.0[3] >= 128).collect();
        if fg.is_empty() {
            // 全透明：零向量表示"没有信号"
            return vec![0.0; EMBED_DIM];
        }

        let mut v = vec![0.0f32; EMBED_DIM];

        // [0..16) 亮度 16 档直方图
        // [16..40) R/G/B 各 8 档
        for p in &fg {
            let lum = luma(p.0[0], p.0[1], p.0[2]);
            v[(lum as usize * 16 / 256).min(15)] += 1.0;
            v[16 + (p.0[0] as usize * 8 / 256).min(7)] += 1.0;
            v[24 + (p.0[1] as usize * 8 / 256).min(7)] += 1.0;
            v[32 + (p.0[2] as usize * 8 / 256).min(7)] += 1.0;
        }
        let n = fg.len() as f32;
        for x in v[..40].iter_mut() {
            *x /= n;
        }

        // [40..56) 梯度方向 16 档（幅值加权）
        let hist = orientation_histogram(&small);
        v[40..40 + ORIENT_BINS].copy_from_slice(&hist);

        // [56..64) 4x2 分块亮度均值
        let (w, h) = small.dimensions();
        let mut sums = [0f32; 8];
        let mut counts = [0f32; 8];
        for (x, y, p) in small.enumerate_pixels() {
            let bx = (x * 4 / w.max(1)).min(3) as usize;
            let by = (y * 2 / h.max(1)).min(1) as usize;
            let i = by * 4 + bx;
            sums[i] += luma(p.0[0], p.0[1], p.0[2]) / 255.0;
            counts[i] += 1.0;
        }
        for i in 0..8 {
            v[56 + i] = if counts[i] > 0.0 { sums[i] / counts[i] } else { 0.0 };
        }

        l2_normalize(&mut v);
        v
    }
}

fn luma(r: u8, g: u8, b: u8) -> f32 {
    0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
}

fn resize_patch(patch: &RgbaImage) -> RgbaImage {
    image::DynamicImage::ImageRgba8(patch.clone())
        .resize_exact(PATCH_SIZE, PATCH_SIZE, FilterType::Triangle)
        .to_rgba8()
}

/// 原地 L2 归一化；零向量保持为零。
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// 余弦相似度。任一侧是零向量直接返回 0（绝不除零）。
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 0.0;
    }
    dot / (na * nb)
}

/// Sobel 边缘幅值图。
fn edge_map(patch: &RgbaImage) -> Vec<f32> {
    let small = resize_patch(patch);
    let gray: GrayImage = image::DynamicImage::ImageRgba8(small).to_luma8();
    let gx = horizontal_sobel(&gray);
    let gy = vertical_sobel(&gray);
    gx.iter()
        .zip(gy.iter())
        .map(|(a, b)| ((*a as f32).powi(2) + (*b as f32).powi(2)).sqrt())
        .collect()
}

/// 边缘结构相似度 ∈ [0,1]：对两张边缘图做全局 SSIM。相同输入恒为 1。
pub fn edge_similarity(a: &RgbaImage, b: &RgbaImage) -> f32 {
    let ea = edge_map(a);
    let eb = edge_map(b);
    let n = ea.len().min(eb.len());
    if n == 0 {
        return 0.0;
    }

    let ma: f32 = ea[..n].iter().sum::<f32>() / n as f32;
    let mb: f32 = eb[..n].iter().sum::<f32>() / n as f32;
    let mut va = 0.0f32;
    let mut vb = 0.0f32;
    let mut cov = 0.0f32;
    for i in 0..n {
        let da = ea[i] - ma;
        let db = eb[i] - mb;
        va += da * da;
        vb += db * db;
        cov += da * db;
    }
    va /= n as f32;
    vb /= n as f32;
    cov /= n as f32;

    // SSIM 常数，按 8bit 动态范围取
    const C1: f32 = 6.5025;
    const C2: f32 = 58.5225;
    let s = ((2.0 * ma * mb + C1) * (2.0 * cov + C2))
        / ((ma * ma + mb * mb + C1) * (va + vb + C2));
    s.clamp(0.0, 1.0)
}

fn orientation_histogram(patch: &RgbaImage) -> [f32; ORIENT_BINS] {
    let small = if patch.dimensions() == (PATCH_SIZE, PATCH_SIZE) {
        patch.clone()
    } else {
        resize_patch(patch)
    };
    let gray: GrayImage = image::DynamicImage::ImageRgba8(small).to_luma8();
    let gx = horizontal_sobel(&gray);
    let gy = vertical_sobel(&gray);

    let mut hist = [0f32; ORIENT_BINS];
    let mut total = 0f32;
    for (a, b) in gx.iter().zip(gy.iter()) {
        let mag = ((*a as f32).powi(2) + (*b as f32).powi(2)).sqrt();
        if mag <= f32::EPSILON {
            continue;
        }
        let angle = (*b as f32).atan2(*a as f32); // [-π, π]
        let frac = (angle + std::f32::consts::PI) / (2.0 * std::f32::consts::PI);
        let bin = ((frac * ORIENT_BINS as f32) as usize).min(ORIENT_BINS - 1);
        hist[bin] += mag;
        total += mag;
    }

    if total > f32::EPSILON {
        for h in hist.iter_mut() {
            *h /= total;
        }
    } else {
        // 没有任何梯度（纯色/空白）：均匀分布，两张空白图相关度为 1
        for h in hist.iter_mut() {
            *h = 1.0 / ORIENT_BINS as f32;
        }
    }
    hist
}

/// 方向直方图匹配率（直方图交集）∈ [0,1]，顶替关键点匹配比例。
pub fn orientation_match_ratio(a: &RgbaImage, b: &RgbaImage) -> f32 {
    let ha = orientation_histogram(a);
    let hb = orientation_histogram(b);
    ha.iter().zip(hb.iter()).map(|(x, y)| x.min(*y)).sum::<f32>().clamp(0.0, 1.0)
}

/// 轮廓距离 ∈ [0,1]，随边缘相似度单调下降。
pub fn silhouette_distance(a: &RgbaImage, b: &RgbaImage) -> f32 {
    (1.0 - edge_similarity(a, b)).clamp(0.0, 1.0)
}

pub struct PoseAlign<'a> {
    pub ok: bool,
    pub aligned_patch: &'a RgbaImage,
    pub aligned_template: &'a RgbaImage,
}

/// 姿态对齐门。不做几何变换：embedding 粗相似度达标才放行，
/// 失败时原样返回输入并置 ok=false。
pub fn pose_align<'a>(
    patch: &'a RgbaImage,
    template: &'a RgbaImage,
    patch_embed: &[f32],
    template_embed: &[f32],
    floor: f32,
) -> PoseAlign<'a> {
    PoseAlign {
        ok: cosine_similarity(patch_embed, template_embed) >= floor,
        aligned_patch: patch,
        aligned_template: template,
    }
}
