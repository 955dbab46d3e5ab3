use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

pub mod color_engine;
pub mod config;
pub mod features;
pub mod item_index;
pub mod matcher;
pub mod preprocess;
pub mod rerank;

pub use color_engine::DofusPalette;
pub use config::SuggestConfig;
pub use features::{FeatureBackend, StatsEmbedder};
pub use item_index::{ItemIndexService, ItemMeta};
pub use rerank::RerankRules;

// --- Data Models ---

/// 装备槽位。推荐管线按槽位独立决策。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    Coiffe,
    Cape,
    Bouclier,
    Familier,
}

impl Slot {
    pub const ALL: [Slot; 4] = [Slot::Coiffe, Slot::Cape, Slot::Bouclier, Slot::Familier];

    pub fn as_str(&self) -> &'static str {
        match self {
            Slot::Coiffe => "coiffe",
            Slot::Cape => "cape",
            Slot::Bouclier => "bouclier",
            Slot::Familier => "familier",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 槽位可见度：ROI 内前景覆盖率和边缘密度都达标才算 "ok"。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Ok,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// 匹配依据。mode 作为 serde tag 写进 JSON，下游按 "item"/"color" 区分。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum MatchReasons {
    Item {
        clip: f32,
        orb: f32,
        ssim: f32,
        chamfer: f32,
        pose_aligned: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        delta_e: Option<f32>,
    },
    Color {
        color_score: f32,
        ssim_edges: f32,
        delta_e: f32,
    },
}

impl MatchReasons {
    pub fn mode(&self) -> &'static str {
        match self {
            MatchReasons::Item { .. } => "item",
            MatchReasons::Color { .. } => "color",
        }
    }

    pub fn delta_e(&self) -> Option<f32> {
        match self {
            MatchReasons::Item { delta_e, .. } => *delta_e,
            MatchReasons::Color { delta_e, .. } => Some(*delta_e),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub item_id: u32,
    pub label: String,
    /// 始终限制在 [0,1]。
    pub score: f32,
    pub verified: bool,
    pub reasons: MatchReasons,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionOutput {
    pub palette: DofusPalette,
    pub slots: HashMap<Slot, Vec<Candidate>>,
    pub confidence: HashMap<Slot, f32>,
    pub visibility: HashMap<Slot, Visibility>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestRequest {
    /// 角色截图原始字节；任意格式，解不开也不会报错（退化为确定性占位图）。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<Vec<u8>>,
    /// 调用方直接指定的目标配色；没给就从图里提取。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub palette: Option<DofusPalette>,
    #[serde(default)]
    pub rules: RerankRules,
}

// --- Pipeline ---

/// 核心入口：对每个槽位跑一遍 可见度 → item mode → color mode 回退 → rerank。
/// 槽位之间没有顺序依赖，这里按参考实现顺序处理。
pub fn suggest(
    req: &SuggestRequest,
    index: &ItemIndexService,
    backend: &dyn FeatureBackend,
    config: &SuggestConfig,
) -> SuggestionOutput {
    let start_total = Instant::now();
    let mut notes: Vec<String> = Vec::new();

    let has_image = req.image.as_ref().map(|b| !b.is_empty()).unwrap_or(false);
    let raw = req.image.as_deref().unwrap_or(&[]);

    let start_pre = Instant::now();
    let normalized = preprocess::normalize_input(raw);
    let located = preprocess::locate_slots(&normalized, config);
    println!("[Timer] 预处理耗时: {:?}", start_pre.elapsed());

    // 目标配色：优先用调用方给的，否则从前景主色提取后吸附到 Dofus 标准色板
    let palette = match &req.palette {
        Some(p) => p.clone(),
        None if has_image => color_engine::extract_palette(&normalized.canvas, &normalized.mask),
        None => {
            notes.push("未提供图像与配色，使用默认色板".to_string());
            DofusPalette::default()
        }
    };

    let mut slots: HashMap<Slot, Vec<Candidate>> = HashMap::new();
    let mut confidence: HashMap<Slot, f32> = HashMap::new();

    for &slot in &config.slots {
        let start_slot = Instant::now();
        let boxed = located.boxes[&slot];
        let vis = located.visibility[&slot];
        let patch = preprocess::crop(&normalized.canvas, boxed);

        let outcome = if has_image && vis == Visibility::Ok {
            let item = matcher::item_mode_match(slot, &patch, index, backend, config);
            if item.candidates.is_empty() {
                notes.extend(item.notes);
                notes.push(format!("{}: item mode 未确认任何物品，回退 color mode", slot));
                matcher::color_mode_match(slot, &patch, &palette, index, backend, config)
            } else {
                item
            }
        } else {
            if has_image {
                notes.push(format!("{}: 可见度不足 (low)，跳过 item mode", slot));
            } else {
                notes.push(format!("{}: 无图像输入，直接使用 color mode", slot));
            }
            matcher::color_mode_match(slot, &patch, &palette, index, backend, config)
        };

        notes.extend(outcome.notes);
        let (ranked, rerank_notes) =
            rerank::rerank_and_constrain(slot, outcome.candidates, &req.rules, config);
        notes.extend(rerank_notes);

        println!(
            "[Slot {}] 候选 {} 个, 置信度 {:.2}, 耗时: {:?}",
            slot,
            ranked.len(),
            outcome.confidence,
            start_slot.elapsed()
        );
        slots.insert(slot, ranked);
        confidence.insert(slot, outcome.confidence);
    }

    println!("[Timer] 推荐流程整体耗时: {:?}", start_total.elapsed());

    SuggestionOutput {
        palette,
        slots,
        confidence,
        visibility: located.visibility,
        notes,
    }
}
