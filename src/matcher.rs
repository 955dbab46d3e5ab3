use crate::color_engine::{delta_e2000, parse_hex, rgb_to_lab, DofusPalette};
use crate::config::SuggestConfig;
use crate::features::{
    cosine_similarity, edge_similarity, orientation_match_ratio, pose_align, silhouette_distance,
    FeatureBackend,
};
use crate::item_index::{render_reference_patch, ItemIndexService};
use crate::{Candidate, MatchReasons, Slot};
use image::RgbaImage;

/// 单槽位匹配结果。candidates 为空不是错误，
/// 由 confidence=0 + note 表达"触发回退"。
pub struct MatchOutcome {
    pub candidates: Vec<Candidate>,
    pub confidence: f32,
    pub notes: Vec<String>,
}

impl MatchOutcome {
    fn empty(note: String) -> Self {
        Self {
            candidates: Vec::new(),
            confidence: 0.0,
            notes: vec![note],
        }
    }
}

/// item mode：逐个候选跑结构校验，只输出 verified=true 的确认项。
///
/// 流程（顺序固定）：pose 门 → clip 下限 → 结构指标 2/3 → chamfer 硬顶 →
/// 加权总分下限。pose 门失败时指标取地板值 (clip=0, orb=0, ssim=0, chamfer=1)，
/// 候选自然出局而不是报错。
pub fn item_mode_match(
    slot: Slot,
    patch: &RgbaImage,
    index: &ItemIndexService,
    backend: &dyn FeatureBackend,
    config: &SuggestConfig,
) -> MatchOutcome {
    let patch_embed = backend.embed(patch);
    let pool = index.query(slot, &patch_embed, config.k_retrieval);
    if pool.is_empty() {
        return MatchOutcome::empty(format!("{}: 检索池为空，无目录条目", slot));
    }

    let t = config.thresholds_for(slot);
    let w = config.weights;
    let mut confirmed: Vec<Candidate> = Vec::new();
    let mut best = 0.0f32;

    for c in &pool {
        let template = render_reference_patch(c);
        let gate = pose_align(patch, &template, &patch_embed, &c.embedding, config.pose_align_floor);

        let (clip, orb, ssim, chamfer) = if gate.ok {
            (
                cosine_similarity(&patch_embed, &c.embedding),
                orientation_match_ratio(gate.aligned_patch, gate.aligned_template),
                edge_similarity(gate.aligned_patch, gate.aligned_template),
                silhouette_distance(gate.aligned_patch, gate.aligned_template),
            )
        } else {
            // 对齐失败：指标压到地板，候选随后被 clip 下限拦下
            (0.0, 0.0, 0.0, 1.0)
        };

        if clip < t.clip {
            continue;
        }

        // 结构三指标至少 2/3 通过（可配置关闭）
        let hits = [orb >= t.orb, ssim >= t.ssim, chamfer <= t.chamfer]
            .iter()
            .filter(|&&b| b)
            .count();
        if config.require_2of3 && hits < 2 {
            continue;
        }

        // 2/3 规则之外的硬顶：轮廓差得离谱就不要
        if chamfer > t.chamfer {
            continue;
        }

        let shape = ((1.0 - chamfer).max(0.0) + ssim) / 2.0;
        let score = (w.clip * clip + w.orb * orb + w.ssim * ssim + w.shape * shape).clamp(0.0, 1.0);
        if score < t.final_score {
            continue;
        }

        best = best.max(score);
        confirmed.push(Candidate {
            item_id: c.item_id,
            label: c.label.clone(),
            score,
            verified: true,
            reasons: MatchReasons::Item {
                clip,
                orb,
                ssim,
                chamfer,
                pose_aligned: gate.ok,
                delta_e: None,
            },
            set_id: c.set_id,
            thumbnail: c.thumbnail.clone(),
        });
        if confirmed.len() >= config.max_candidates {
            break;
        }
    }

    if confirmed.is_empty() {
        return MatchOutcome::empty(format!("{}: 无结构确认项", slot));
    }

    MatchOutcome {
        candidates: confirmed,
        confidence: best,
        notes: Vec::new(),
    }
}

/// color mode 回退：只看候选参考配色和目标配色的感知距离，
/// 掺一点残余边缘项。全部 verified=false。
pub fn color_mode_match(
    slot: Slot,
    patch: &RgbaImage,
    target: &DofusPalette,
    index: &ItemIndexService,
    backend: &dyn FeatureBackend,
    config: &SuggestConfig,
) -> MatchOutcome {
    let patch_embed = backend.embed(patch);
    let pool = index.query(slot, &patch_embed, config.k_color_pick);
    if pool.is_empty() {
        return MatchOutcome::empty(format!("{}: 检索池为空，无法按配色推荐", slot));
    }

    let target_labs: Vec<palette::Lab> = target
        .colors()
        .iter()
        .filter_map(|h| parse_hex(h))
        .map(|rgb| rgb_to_lab(rgb[0], rgb[1], rgb[2]))
        .collect();

    let cw = config.color_weights;
    let mut candidates: Vec<Candidate> = pool
        .iter()
        .map(|c| {
            let delta_e = candidate_delta_e(c.palette.as_deref(), &target_labs, config);
            let color_score = (1.0 - delta_e / 100.0).clamp(0.0, 1.0);
            let edge_score =
                ((cosine_similarity(&patch_embed, &c.embedding) + 1.0) / 2.0).clamp(0.0, 1.0);
            let score = (cw.color * color_score + cw.edges * edge_score).clamp(0.0, 1.0);

            Candidate {
                item_id: c.item_id,
                label: c.label.clone(),
                score,
                verified: false,
                reasons: MatchReasons::Color {
                    color_score,
                    ssim_edges: edge_score,
                    delta_e,
                },
                set_id: c.set_id,
                thumbnail: c.thumbnail.clone(),
            }
        })
        .collect();

    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    candidates.truncate(config.max_candidates);

    MatchOutcome {
        candidates,
        confidence: 0.0,
        notes: Vec::new(),
    }
}

/// 候选配色和目标三色的平均最小 deltaE。
/// 没有参考配色按固定高惩罚算，当"非常不像"处理而不是报错。
fn candidate_delta_e(
    palette: Option<&[String]>,
    target_labs: &[palette::Lab],
    config: &SuggestConfig,
) -> f32 {
    let colors: Vec<palette::Lab> = palette
        .unwrap_or(&[])
        .iter()
        .filter_map(|h| parse_hex(h))
        .map(|rgb| rgb_to_lab(rgb[0], rgb[1], rgb[2]))
        .collect();
    if colors.is_empty() || target_labs.is_empty() {
        return config.missing_palette_delta_e;
    }

    let sum: f32 = colors
        .iter()
        .map(|c| {
            target_labs
                .iter()
                .map(|t| delta_e2000(*c, *t))
                .fold(f32::MAX, f32::min)
        })
        .sum();
    sum / colors.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::StatsEmbedder;
    use crate::item_index::{CandidateRef, ItemIndexService};

    fn cand(id: u32, embedding: Vec<f32>, palette: &[&str]) -> CandidateRef {
        CandidateRef {
            item_id: id,
            slot: Slot::Cape,
            label: format!("item-{}", id),
            embedding,
            set_id: None,
            palette: if palette.is_empty() {
                None
            } else {
                Some(palette.iter().map(|s| s.to_string()).collect())
            },
            thumbnail: None,
        }
    }

    #[test]
    fn empty_catalog_yields_note_not_panic() {
        let service = ItemIndexService::new(16, None);
        let patch = RgbaImage::from_pixel(16, 16, image::Rgba([200, 60, 60, 255]));
        let cfg = SuggestConfig::default();

        let item = item_mode_match(Slot::Coiffe, &patch, &service, &StatsEmbedder, &cfg);
        assert!(item.candidates.is_empty());
        assert_eq!(item.confidence, 0.0);
        assert!(item.notes.iter().any(|n| n.contains("coiffe")));

        let target = DofusPalette::default();
        let color = color_mode_match(Slot::Coiffe, &patch, &target, &service, &StatsEmbedder, &cfg);
        assert!(color.candidates.is_empty());
        assert!(color.notes.iter().any(|n| n.contains("coiffe")));
    }

    #[test]
    fn identical_reference_is_confirmed_low_clip_is_not() {
        let service = ItemIndexService::new(16, None);
        let swatch = ["b32424", "e8c14c"];

        // 先用色板渲染出"场景" patch，保证和 good 的参考图逐像素一致
        let probe = cand(0, vec![0.0; crate::features::EMBED_DIM], &swatch);
        let patch = render_reference_patch(&probe);
        let emb = StatsEmbedder.embed(&patch);

        let good = cand(1, emb.clone(), &swatch);
        // 反向 embedding：结构指标本可满分，但 clip 必然过不了下限
        let flipped: Vec<f32> = emb.iter().map(|x| -x).collect();
        let bad = cand(2, flipped, &swatch);
        service.set_items(Slot::Cape, vec![good, bad]);

        let cfg = SuggestConfig::default();
        let out = item_mode_match(Slot::Cape, &patch, &service, &StatsEmbedder, &cfg);
        assert_eq!(out.candidates.len(), 1);
        let c = &out.candidates[0];
        assert_eq!(c.item_id, 1);
        assert!(c.verified);
        assert_eq!(c.reasons.mode(), "item");
        assert!(c.score >= cfg.thresholds_for(Slot::Cape).final_score);
        assert!((0.0..=1.0).contains(&c.score));
        assert!(out.confidence > 0.0);
    }

    #[test]
    fn color_mode_prefers_matching_palette() {
        let service = ItemIndexService::new(16, None);
        let emb = crate::item_index::embed_label("neutre");
        service.set_items(
            Slot::Cape,
            vec![
                cand(1, emb.clone(), &["2673b3", "4cc3e8"]), // 蓝
                cand(2, emb.clone(), &["b32424", "e85c5c"]), // 红
                cand(3, emb.clone(), &[]),                   // 无配色 → 高惩罚
            ],
        );

        let target = DofusPalette {
            primary: "b32424".to_string(),
            secondary: "e85c5c".to_string(),
            tertiary: "731616".to_string(),
        };
        let patch = RgbaImage::from_pixel(16, 16, image::Rgba([180, 40, 40, 255]));
        let cfg = SuggestConfig::default();
        let out = color_mode_match(Slot::Cape, &patch, &target, &service, &StatsEmbedder, &cfg);

        assert_eq!(out.candidates[0].item_id, 2, "红色候选应排第一");
        assert!(out.candidates.iter().all(|c| !c.verified));
        assert!(out.candidates.iter().all(|c| (0.0..=1.0).contains(&c.score)));
        assert!(out
            .candidates
            .windows(2)
            .all(|w| w[0].score >= w[1].score));
        // 无配色候选的 deltaE 固定为惩罚值
        let no_palette = out.candidates.iter().find(|c| c.item_id == 3).unwrap();
        assert_eq!(
            no_palette.reasons.delta_e(),
            Some(cfg.missing_palette_delta_e)
        );
        assert_eq!(out.confidence, 0.0);
    }

    #[test]
    fn color_mode_caps_output_length() {
        let service = ItemIndexService::new(16, None);
        let refs: Vec<CandidateRef> = (1..=20)
            .map(|i| cand(i, crate::item_index::embed_label(&format!("i{}", i)), &["e8c14c"]))
            .collect();
        service.set_items(Slot::Cape, refs);

        let cfg = SuggestConfig::default();
        let patch = RgbaImage::from_pixel(8, 8, image::Rgba([10, 10, 10, 255]));
        let out = color_mode_match(
            Slot::Cape,
            &patch,
            &DofusPalette::default(),
            &service,
            &StatsEmbedder,
            &cfg,
        );
        assert!(out.candidates.len() <= cfg.max_candidates);
    }
}
