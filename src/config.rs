use crate::Slot;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// 单个槽位的结构校验阈值。
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SlotThresholds {
    /// embedding 余弦相似度下限，低于直接出局
    pub clip: f32,
    /// 方向直方图匹配率下限
    pub orb: f32,
    /// 边缘结构相似度下限
    pub ssim: f32,
    /// 轮廓距离上限（硬性天花板）
    pub chamfer: f32,
    /// 加权总分下限
    pub final_score: f32,
}

impl Default for SlotThresholds {
    fn default() -> Self {
        Self {
            clip: 0.80,
            orb: 0.55,
            ssim: 0.60,
            chamfer: 0.45,
            final_score: 0.70,
        }
    }
}

/// item mode 加权求和的四个权重，和为 1。
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub clip: f32,
    pub orb: f32,
    pub ssim: f32,
    pub shape: f32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            clip: 0.45,
            orb: 0.20,
            ssim: 0.20,
            shape: 0.15,
        }
    }
}

/// color mode 的配色/边缘混合权重，颜色占主导。
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ColorWeights {
    pub color: f32,
    pub edges: f32,
}

impl Default for ColorWeights {
    fn default() -> Self {
        Self {
            color: 0.8,
            edges: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuggestConfig {
    pub slots: Vec<Slot>,
    pub thresholds: HashMap<Slot, SlotThresholds>,
    pub weights: ScoreWeights,
    pub color_weights: ColorWeights,
    /// item mode 检索池宽度
    pub k_retrieval: usize,
    /// color mode 检索池宽度（更宽，反正只看配色）
    pub k_color_pick: usize,
    /// 每槽位最终输出上限
    pub max_candidates: usize,
    /// 查询缓存条目上限，超出按最旧访问淘汰
    pub cache_max_entries: usize,
    /// ROI 前景覆盖率下限
    pub coverage_min: f32,
    /// ROI 边缘密度下限
    pub edge_density_min: f32,
    /// 结构三指标 2/3 通过规则开关
    pub require_2of3: bool,
    /// pose 对齐门限（embedding 粗相似度）
    pub pose_align_floor: f32,
    /// 候选没有参考配色时的惩罚 deltaE
    pub missing_palette_delta_e: f32,
    pub synergy_base_bonus: f32,
    /// deltaE 低于该值时套装加成翻倍
    pub synergy_tight_delta_e: f32,
    pub synergy_max_bonus: f32,
    pub hint_bonus: f32,
    /// 索引持久化路径
    pub index_path: PathBuf,
}

impl Default for SuggestConfig {
    fn default() -> Self {
        let mut thresholds = HashMap::new();
        thresholds.insert(Slot::Coiffe, SlotThresholds::default());
        thresholds.insert(Slot::Cape, SlotThresholds::default());
        thresholds.insert(
            Slot::Bouclier,
            SlotThresholds {
                clip: 0.78,
                ..SlotThresholds::default()
            },
        );
        // 宠物体型小、姿态多，放宽一点
        thresholds.insert(
            Slot::Familier,
            SlotThresholds {
                clip: 0.75,
                orb: 0.50,
                ..SlotThresholds::default()
            },
        );

        Self {
            slots: Slot::ALL.to_vec(),
            thresholds,
            weights: ScoreWeights::default(),
            color_weights: ColorWeights::default(),
            k_retrieval: 24,
            k_color_pick: 48,
            max_candidates: 5,
            cache_max_entries: 128,
            coverage_min: 0.12,
            edge_density_min: 0.04,
            require_2of3: true,
            pose_align_floor: 0.15,
            missing_palette_delta_e: 80.0,
            synergy_base_bonus: 0.05,
            synergy_tight_delta_e: 20.0,
            synergy_max_bonus: 0.12,
            hint_bonus: 0.03,
            index_path: PathBuf::from("resources/item_index.bin"),
        }
    }
}

impl SuggestConfig {
    /// 没配的槽位用默认阈值兜底。
    pub fn thresholds_for(&self, slot: Slot) -> SlotThresholds {
        self.thresholds
            .get(&slot)
            .copied()
            .unwrap_or_default()
    }
}
