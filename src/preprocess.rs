use crate::{BoundingBox, Slot, SuggestConfig, Visibility};
use image::imageops::FilterType;
use image::{GrayImage, RgbaImage};
use imageproc::gradients::{horizontal_sobel, vertical_sobel};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// 归一化画布边长（正方形）。
pub const CANVAS_SIZE: u32 = 256;

/// Sobel 幅值超过该值算边缘像素
const EDGE_MAGNITUDE_MIN: f32 = 60.0;
/// 和估计背景色的欧氏距离超过该值算前景
const FOREGROUND_COLOR_DIST: f32 = 40.0;

pub struct NormalizedInput {
    pub canvas: RgbaImage,
    /// 每像素 0/1 前景标记，与画布同栅格顺序
    pub mask: Vec<u8>,
}

pub struct LocatedSlots {
    pub boxes: HashMap<Slot, BoundingBox>,
    pub visibility: HashMap<Slot, Visibility>,
}

/// 把任意输入字节归一化成固定大小画布 + 前景掩码。
///
/// 解码失败不报错：用输入字节的 SHA-256 摘要生成确定性占位图，
/// 同样的输入永远得到同样的画布（缓存和测试都依赖这一点）。
pub fn normalize_input(bytes: &[u8]) -> NormalizedInput {
    match image::load_from_memory(bytes) {
        Ok(img) => {
            let canvas = img
                .resize_exact(CANVAS_SIZE, CANVAS_SIZE, FilterType::Triangle)
                .to_rgba8();
            let mask = compute_mask(&canvas);
            NormalizedInput { canvas, mask }
        }
        Err(e) => {
            println!("[Preprocess] 解码失败 ({})，使用确定性占位图", e);
            synthetic_placeholder(bytes)
        }
    }
}

/// 前景掩码：有透明通道就按 alpha 切，否则和边框估出来的背景色比色距。
fn compute_mask(canvas: &RgbaImage) -> Vec<u8> {
    let has_alpha = canvas.pixels().any(|p| p.0[3] < 250);
    if has_alpha {
        return canvas
            .pixels()
            .map(|p| if p.0[3] >= 128 { 1 } else { 0 })
            .collect();
    }

    // 四角采样平均当背景色
    let (w, h) = canvas.dimensions();
    let corners = [
        (0, 0),
        (w - 1, 0),
        (0, h - 1),
        (w - 1, h - 1),
    ];
    let mut bg = [0f32; 3];
    for &(x, y) in &corners {
        let p = canvas.get_pixel(x, y);
        bg[0] += p.0[0] as f32;
        bg[1] += p.0[1] as f32;
        bg[2] += p.0[2] as f32;
    }
    for c in bg.iter_mut() {
        *c /= corners.len() as f32;
    }

    canvas
        .pixels()
        .map(|p| {
            let dr = p.0[0] as f32 - bg[0];
            let dg = p.0[1] as f32 - bg[1];
            let db = p.0[2] as f32 - bg[2];
            if (dr * dr + dg * dg + db * db).sqrt() > FOREGROUND_COLOR_DIST {
                1
            } else {
                0
            }
        })
        .collect()
}

/// 摘要驱动的占位画布：中心椭圆区域按摘要字节着色，其余透明。
fn synthetic_placeholder(bytes: &[u8]) -> NormalizedInput {
    let digest = Sha256::digest(bytes);
    let mut canvas = RgbaImage::new(CANVAS_SIZE, CANVAS_SIZE);
    let mut mask = vec![0u8; (CANVAS_SIZE * CANVAS_SIZE) as usize];

    let cx = CANVAS_SIZE as f32 / 2.0;
    let cy = CANVAS_SIZE as f32 / 2.0;
    let rx = CANVAS_SIZE as f32 * 0.3;
    let ry = CANVAS_SIZE as f32 * 0.4;

    for y in 0..CANVAS_SIZE {
        for x in 0..CANVAS_SIZE {
            let nx = (x as f32 - cx) / rx;
            let ny = (y as f32 - cy) / ry;
            if nx * nx + ny * ny <= 1.0 {
                // 摘要字节平铺出确定性纹理
                let i = ((y / 16) * 16 + (x / 16)) as usize;
                let r = digest[i % 32];
                let g = digest[(i + 11) % 32];
                let b = digest[(i + 23) % 32];
                canvas.put_pixel(x, y, image::Rgba([r, g, b, 255]));
                mask[(y * CANVAS_SIZE + x) as usize] = 1;
            }
        }
    }

    NormalizedInput { canvas, mask }
}

/// 每个槽位在画布上的固定相对 ROI (x, y, w, h 的比例)。
fn slot_roi(slot: Slot) -> [f32; 4] {
    match slot {
        Slot::Coiffe => [0.30, 0.02, 0.40, 0.28],
        Slot::Cape => [0.15, 0.28, 0.70, 0.45],
        Slot::Bouclier => [0.02, 0.38, 0.32, 0.36],
        Slot::Familier => [0.62, 0.58, 0.36, 0.40],
    }
}

/// 计算每槽位的像素级 ROI 和可见度。
/// 可见度 "ok" 要求前景覆盖率和边缘密度同时达标。
pub fn locate_slots(input: &NormalizedInput, config: &SuggestConfig) -> LocatedSlots {
    let (w, h) = input.canvas.dimensions();
    let mut boxes = HashMap::new();
    let mut visibility = HashMap::new();

    for &slot in &config.slots {
        let [fx, fy, fw, fh] = slot_roi(slot);
        let bx = BoundingBox {
            x: (w as f32 * fx) as u32,
            y: (h as f32 * fy) as u32,
            w: ((w as f32 * fw) as u32).max(1).min(w),
            h: ((h as f32 * fh) as u32).max(1).min(h),
        };
        let bx = clamp_box(bx, w, h);

        let coverage = mask_coverage(&input.mask, w, bx);
        let density = edge_density(&crop(&input.canvas, bx));
        let vis = if coverage >= config.coverage_min && density >= config.edge_density_min {
            Visibility::Ok
        } else {
            Visibility::Low
        };

        boxes.insert(slot, bx);
        visibility.insert(slot, vis);
    }

    LocatedSlots { boxes, visibility }
}

fn clamp_box(b: BoundingBox, w: u32, h: u32) -> BoundingBox {
    let x = b.x.min(w.saturating_sub(1));
    let y = b.y.min(h.saturating_sub(1));
    BoundingBox {
        x,
        y,
        w: b.w.min(w - x).max(1),
        h: b.h.min(h - y).max(1),
    }
}

fn mask_coverage(mask: &[u8], canvas_w: u32, b: BoundingBox) -> f32 {
    let mut on = 0usize;
    let mut total = 0usize;
    for y in b.y..b.y + b.h {
        for x in b.x..b.x + b.w {
            let i = (y * canvas_w + x) as usize;
            if let Some(&m) = mask.get(i) {
                total += 1;
                if m == 1 {
                    on += 1;
                }
            }
        }
    }
    if total == 0 {
        0.0
    } else {
        on as f32 / total as f32
    }
}

/// 亮度梯度边缘密度：Sobel 幅值超过阈值的像素占比。
pub fn edge_density(patch: &RgbaImage) -> f32 {
    let (w, h) = patch.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }
    let gray: GrayImage = image::DynamicImage::ImageRgba8(patch.clone()).to_luma8();
    let gx = horizontal_sobel(&gray);
    let gy = vertical_sobel(&gray);

    let mut edge_px = 0usize;
    let total = (w * h) as usize;
    for (a, b) in gx.iter().zip(gy.iter()) {
        let mag = ((*a as f32).powi(2) + (*b as f32).powi(2)).sqrt();
        if mag > EDGE_MAGNITUDE_MIN {
            edge_px += 1;
        }
    }
    edge_px as f32 / total as f32
}

/// 裁剪子图，越界自动收缩，最小 1×1。
pub fn crop(canvas: &RgbaImage, b: BoundingBox) -> RgbaImage {
    let (w, h) = canvas.dimensions();
    let b = clamp_box(b, w, h);
    image::imageops::crop_imm(canvas, b.x, b.y, b.w, b.h).to_image()
}
