use crate::config::SuggestConfig;
use crate::{Candidate, MatchReasons, Slot};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// 重排上下文规则：套装黑名单、跨槽位偏好套装、外部提示物品。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RerankRules {
    pub exclude_sets: HashSet<u32>,
    pub preferred_set_ids: HashSet<u32>,
    pub hint_item_ids: HashSet<u32>,
}

/// 合并/去重/加成/截断，产出槽位最终列表。
///
/// 顺序固定：黑名单剔除 → deltaE 口径统一 → 套装协同加成 → 提示加成 →
/// 重新 clamp → 按 itemId 去重（留高分）→ verified 优先稳定排序 → 截断。
pub fn rerank_and_constrain(
    slot: Slot,
    candidates: Vec<Candidate>,
    rules: &RerankRules,
    config: &SuggestConfig,
) -> (Vec<Candidate>, Vec<String>) {
    let mut notes = Vec::new();

    let mut kept: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| match c.set_id {
            Some(sid) => !rules.exclude_sets.contains(&sid),
            None => true,
        })
        .collect();

    for c in kept.iter_mut() {
        normalize_delta_e(c);

        let mut bonus = 0.0f32;
        if let Some(sid) = c.set_id {
            if rules.preferred_set_ids.contains(&sid) {
                bonus = config.synergy_base_bonus;
                // 配色足够贴近时套装加成翻倍
                if let Some(de) = c.reasons.delta_e() {
                    if de < config.synergy_tight_delta_e {
                        bonus *= 2.0;
                    }
                }
                bonus = bonus.min(config.synergy_max_bonus);
            }
        }
        if rules.hint_item_ids.contains(&c.item_id) {
            bonus += config.hint_bonus;
        }
        c.score = (c.score + bonus).clamp(0.0, 1.0);
    }

    // 按 itemId 去重，留高分那条
    let mut by_id: HashMap<u32, Candidate> = HashMap::new();
    let mut order: Vec<u32> = Vec::new();
    for c in kept {
        match by_id.get(&c.item_id) {
            Some(existing) if existing.score >= c.score => {}
            _ => {
                if !by_id.contains_key(&c.item_id) {
                    order.push(c.item_id);
                }
                by_id.insert(c.item_id, c);
            }
        }
    }
    let mut merged: Vec<Candidate> = order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect();

    // verified 永远排未确认项前面，分数只在同组内起作用；稳定排序保住并列顺序
    merged.sort_by(|a, b| {
        b.verified
            .cmp(&a.verified)
            .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal))
    });
    merged.truncate(config.max_candidates);

    if merged.is_empty() {
        notes.push(format!("{}: 无可推荐物品", slot));
    }
    (merged, notes)
}

/// 把 deltaE 统一成跨模式可比的口径：
/// color mode 自带；item mode 从 chamfer 推一个近似值。
fn normalize_delta_e(c: &mut Candidate) {
    if let MatchReasons::Item { chamfer, delta_e, .. } = &mut c.reasons {
        if delta_e.is_none() {
            *delta_e = Some((*chamfer * 100.0).clamp(0.0, 100.0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item_cand(id: u32, score: f32, set_id: Option<u32>, chamfer: f32) -> Candidate {
        Candidate {
            item_id: id,
            label: format!("item-{}", id),
            score,
            verified: true,
            reasons: MatchReasons::Item {
                clip: 0.9,
                orb: 0.7,
                ssim: 0.7,
                chamfer,
                pose_aligned: true,
                delta_e: None,
            },
            set_id,
            thumbnail: None,
        }
    }

    fn color_cand(id: u32, score: f32, set_id: Option<u32>, delta_e: f32) -> Candidate {
        Candidate {
            item_id: id,
            label: format!("item-{}", id),
            score,
            verified: false,
            reasons: MatchReasons::Color {
                color_score: score,
                ssim_edges: 0.5,
                delta_e,
            },
            set_id,
            thumbnail: None,
        }
    }

    fn cfg() -> SuggestConfig {
        SuggestConfig::default()
    }

    #[test]
    fn excluded_sets_are_dropped() {
        let rules = RerankRules {
            exclude_sets: [7].into_iter().collect(),
            ..Default::default()
        };
        let input = vec![item_cand(1, 0.8, Some(7), 0.1), item_cand(2, 0.7, Some(8), 0.1)];
        let (out, _) = rerank_and_constrain(Slot::Cape, input, &rules, &cfg());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].item_id, 2);
    }

    #[test]
    fn synergy_bonus_applies_and_doubles_when_tight() {
        let rules = RerankRules {
            preferred_set_ids: [1].into_iter().collect(),
            ..Default::default()
        };
        let c = cfg();
        // chamfer 0.1 → deltaE 10 < 20，翻倍；chamfer 0.5 → deltaE 50，只有基础加成
        let input = vec![item_cand(1, 0.70, Some(1), 0.1), item_cand(2, 0.70, Some(1), 0.5)];
        let (out, _) = rerank_and_constrain(Slot::Coiffe, input, &rules, &c);
        let tight = out.iter().find(|x| x.item_id == 1).unwrap();
        let loose = out.iter().find(|x| x.item_id == 2).unwrap();
        let expected_tight = 0.70 + (c.synergy_base_bonus * 2.0).min(c.synergy_max_bonus);
        let expected_loose = 0.70 + c.synergy_base_bonus;
        assert!((tight.score - expected_tight).abs() < 1e-5);
        assert!((loose.score - expected_loose).abs() < 1e-5);
        assert!(tight.score > 0.70 && loose.score > 0.70);
    }

    #[test]
    fn hint_boost_is_additive() {
        let rules = RerankRules {
            hint_item_ids: [9].into_iter().collect(),
            ..Default::default()
        };
        let c = cfg();
        let (out, _) = rerank_and_constrain(Slot::Cape, vec![color_cand(9, 0.5, None, 30.0)], &rules, &c);
        assert!((out[0].score - (0.5 + c.hint_bonus)).abs() < 1e-5);
    }

    #[test]
    fn dedupe_keeps_higher_score() {
        let input = vec![
            color_cand(4, 0.40, None, 30.0),
            color_cand(4, 0.60, None, 25.0),
            color_cand(4, 0.50, None, 28.0),
        ];
        let (out, _) = rerank_and_constrain(Slot::Cape, input, &RerankRules::default(), &cfg());
        assert_eq!(out.len(), 1);
        assert!((out[0].score - 0.60).abs() < 1e-5);
    }

    #[test]
    fn verified_precede_unverified_regardless_of_score() {
        let input = vec![
            color_cand(1, 0.99, None, 5.0),
            item_cand(2, 0.71, None, 0.2),
            color_cand(3, 0.95, None, 8.0),
        ];
        let (out, _) = rerank_and_constrain(Slot::Cape, input, &RerankRules::default(), &cfg());
        assert_eq!(out[0].item_id, 2);
        assert!(out[0].verified);
        let first_unverified = out.iter().position(|c| !c.verified).unwrap();
        assert!(out[first_unverified..].iter().all(|c| !c.verified));
    }

    #[test]
    fn output_is_capped_and_scores_clamped() {
        let c = cfg();
        let input: Vec<Candidate> = (1..=30).map(|i| color_cand(i, 0.99, Some(1), 2.0)).collect();
        let rules = RerankRules {
            preferred_set_ids: [1].into_iter().collect(),
            hint_item_ids: (1..=30).collect(),
            ..Default::default()
        };
        let (out, _) = rerank_and_constrain(Slot::Familier, input, &rules, &c);
        assert!(out.len() <= c.max_candidates);
        assert!(out.iter().all(|x| x.score <= 1.0));
    }

    #[test]
    fn empty_input_produces_note() {
        let (out, notes) = rerank_and_constrain(Slot::Bouclier, Vec::new(), &RerankRules::default(), &cfg());
        assert!(out.is_empty());
        assert!(notes.iter().any(|n| n.contains("bouclier")));
    }

    #[test]
    fn item_delta_e_derived_from_chamfer() {
        let (out, _) = rerank_and_constrain(
            Slot::Cape,
            vec![item_cand(1, 0.8, None, 0.25)],
            &RerankRules::default(),
            &cfg(),
        );
        assert_eq!(out[0].reasons.delta_e(), Some(25.0));
    }
}
