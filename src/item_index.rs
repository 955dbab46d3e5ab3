use crate::color_engine::parse_hex;
use crate::features::{cosine_similarity, l2_normalize, FeatureBackend, EMBED_DIM};
use crate::Slot;
use chrono::{DateTime, Utc};
use image::RgbaImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("索引文件读写失败: {0}")]
    Io(#[from] std::io::Error),
    #[error("索引编解码失败: {0}")]
    Codec(#[from] bincode::Error),
    #[error("索引未配置持久化路径")]
    NoPath,
    #[error("索引锁中毒")]
    Poisoned,
}

/// 目录快照里的单个物品（外部采集器提供）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemMeta {
    pub id: u32,
    pub label: String,
    pub slot: Slot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub palette: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

/// 索引条目：embedding 在入库时就做好 L2 归一化。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRef {
    pub item_id: u32,
    pub slot: Slot,
    pub label: String,
    pub embedding: Vec<f32>,
    pub set_id: Option<u32>,
    pub palette: Option<Vec<String>>,
    pub thumbnail: Option<String>,
}

/// 整个索引一次性构建、整体替换，从不原地改条目。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemIndex {
    pub updated_at: DateTime<Utc>,
    pub items: HashMap<Slot, Vec<CandidateRef>>,
}

impl Default for ItemIndex {
    fn default() -> Self {
        Self {
            updated_at: Utc::now(),
            items: HashMap::new(),
        }
    }
}

struct CacheEntry {
    /// 该槽位全量按余弦降序排好的结果，命中时按 k 截取
    ranked: Vec<CandidateRef>,
    stamp: u64,
}

struct QueryCache {
    map: HashMap<(Slot, Vec<i16>), CacheEntry>,
    /// 逻辑时钟，每次访问自增；淘汰时取最小值（最旧访问先走）
    tick: u64,
}

/// 索引服务：显式生命周期 (build / query / invalidate)，
/// 测试可以各自实例化，不共享进程级状态。
pub struct ItemIndexService {
    index: RwLock<ItemIndex>,
    cache: Mutex<QueryCache>,
    cache_max: usize,
    path: Option<PathBuf>,
}

impl ItemIndexService {
    pub fn new(cache_max: usize, path: Option<PathBuf>) -> Self {
        Self {
            index: RwLock::new(ItemIndex::default()),
            cache: Mutex::new(QueryCache {
                map: HashMap::new(),
                tick: 0,
            }),
            cache_max,
            path,
        }
    }

    /// 启动路径：先尝试读持久化索引，缺失/损坏只警告，
    /// 退回内置默认目录，绝不让启动失败。
    pub async fn load_or_default(
        path: PathBuf,
        cache_max: usize,
        backend: &dyn FeatureBackend,
    ) -> Self {
        let service = Self::new(cache_max, Some(path.clone()));
        match std::fs::read(&path) {
            Ok(data) => match bincode::deserialize::<ItemIndex>(&data) {
                Ok(loaded) => {
                    let total: usize = loaded.items.values().map(|v| v.len()).sum();
                    println!("[Index] 从 {:?} 加载了 {} 个物品向量", path, total);
                    if let Ok(mut idx) = service.index.write() {
                        *idx = loaded;
                    }
                    return service;
                }
                Err(e) => {
                    println!("[Index] 警告: 索引文件损坏 ({})，退回内置目录", e);
                }
            },
            Err(e) => {
                println!("[Index] 索引文件不可读 ({})，退回内置目录", e);
            }
        }
        service.rebuild_in_memory(default_catalog(), backend);
        service
    }

    /// 从目录快照重建索引：并行 embed，整体换入，失效缓存，落盘。
    /// 落盘失败只警告（§ 内存索引继续可用）。
    pub async fn build(&self, catalog: HashMap<Slot, Vec<ItemMeta>>, backend: &dyn FeatureBackend) {
        self.rebuild_in_memory(catalog, backend);
        if let Err(e) = self.persist().await {
            println!("[Index] 警告: 索引持久化失败: {}", e);
        }
    }

    /// 纯内存索引（不持久化），调试工具和测试用。
    pub fn in_memory(
        catalog: HashMap<Slot, Vec<ItemMeta>>,
        backend: &dyn FeatureBackend,
        cache_max: usize,
    ) -> Self {
        let service = Self::new(cache_max, None);
        service.rebuild_in_memory(catalog, backend);
        service
    }

    #[cfg(test)]
    pub(crate) fn set_items(&self, slot: Slot, refs: Vec<CandidateRef>) {
        if let Ok(mut idx) = self.index.write() {
            idx.items.insert(slot, refs);
        }
        self.invalidate();
    }

    fn rebuild_in_memory(
        &self,
        catalog: HashMap<Slot, Vec<ItemMeta>>,
        backend: &dyn FeatureBackend,
    ) {
        let start = Instant::now();
        let items: HashMap<Slot, Vec<CandidateRef>> = catalog
            .into_iter()
            .map(|(slot, metas)| {
                let refs: Vec<CandidateRef> = metas
                    .into_par_iter()
                    .filter(|m| m.id > 0)
                    .map(|m| to_candidate_ref(slot, m, backend))
                    .collect();
                (slot, refs)
            })
            .collect();

        let total: usize = items.values().map(|v| v.len()).sum();
        println!("[Index] 重建完成: {} 个物品, 耗时 {:?}", total, start.elapsed());

        if let Ok(mut idx) = self.index.write() {
            *idx = ItemIndex {
                updated_at: Utc::now(),
                items,
            };
        }
        self.invalidate();
    }

    pub async fn persist(&self) -> Result<(), IndexError> {
        let path = self.path.as_ref().ok_or(IndexError::NoPath)?;
        let encoded = {
            let idx = self.index.read().map_err(|_| IndexError::Poisoned)?;
            bincode::serialize(&*idx)?
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, encoded)?;
        println!("[Index] 索引已保存到 {:?}", path);
        Ok(())
    }

    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.map.clear();
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.index
            .read()
            .map(|i| i.updated_at)
            .unwrap_or_else(|_| Utc::now())
    }

    pub fn slot_len(&self, slot: Slot) -> usize {
        self.index
            .read()
            .map(|i| i.items.get(&slot).map(|v| v.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    /// top-K 余弦检索。查询向量先归一化；缓存键是 (槽位, 量化向量)；
    /// 命中刷新时间戳，未命中全量打分后排序入缓存；同分按入库顺序。
    pub fn query(&self, slot: Slot, embedding: &[f32], k: usize) -> Vec<CandidateRef> {
        let mut q = embedding.to_vec();
        l2_normalize(&mut q);
        let key = (slot, quantize(&q));

        if let Ok(mut cache) = self.cache.lock() {
            cache.tick += 1;
            let tick = cache.tick;
            if let Some(entry) = cache.map.get_mut(&key) {
                entry.stamp = tick;
                return entry.ranked.iter().take(k).cloned().collect();
            }
        }

        let ranked: Vec<CandidateRef> = match self.index.read() {
            Ok(idx) => {
                let pool = idx.items.get(&slot).cloned().unwrap_or_default();
                let mut scored: Vec<(f32, CandidateRef)> = pool
                    .into_iter()
                    .map(|c| (cosine_similarity(&q, &c.embedding), c))
                    .collect();
                // 稳定排序：同分保持目录插入顺序
                scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
                scored.into_iter().map(|(_, c)| c).collect()
            }
            Err(_) => Vec::new(),
        };

        if let Ok(mut cache) = self.cache.lock() {
            cache.tick += 1;
            let tick = cache.tick;
            cache.map.insert(
                key,
                CacheEntry {
                    ranked: ranked.clone(),
                    stamp: tick,
                },
            );
            // 超限就按最旧访问逐个淘汰
            while cache.map.len() > self.cache_max {
                let oldest = cache
                    .map
                    .iter()
                    .min_by_key(|(_, e)| e.stamp)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        cache.map.remove(&k);
                    }
                    None => break,
                }
            }
        }

        ranked.into_iter().take(k).collect()
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.lock().map(|c| c.map.len()).unwrap_or(0)
    }
}

fn quantize(v: &[f32]) -> Vec<i16> {
    v.iter().map(|x| (x * 1000.0).round() as i16).collect()
}

fn to_candidate_ref(slot: Slot, meta: ItemMeta, backend: &dyn FeatureBackend) -> CandidateRef {
    // 有参考配色就渲染色板小图走 embedding 后端，和查询侧同一条路；
    // 什么图像信息都没有时退化为标签摘要向量
    let mut embedding = match meta.palette.as_deref() {
        Some(palette) if !palette.is_empty() => {
            backend.embed(&render_palette_swatch(palette))
        }
        _ => embed_label(&meta.label),
    };
    l2_normalize(&mut embedding);

    CandidateRef {
        item_id: meta.id,
        slot,
        label: meta.label,
        embedding,
        set_id: meta.set_id,
        palette: meta.palette,
        thumbnail: meta.thumbnail,
    }
}

/// 候选的参考小图，item mode 里当模板用。
/// 和入库 embedding 用同一种渲染，保证两侧可比。
pub fn render_reference_patch(c: &CandidateRef) -> RgbaImage {
    match c.palette.as_deref() {
        Some(palette) if !palette.is_empty() => render_palette_swatch(palette),
        _ => render_label_patch(&c.label),
    }
}

/// 参考配色渲染成竖条纹小图。
fn render_palette_swatch(palette: &[String]) -> RgbaImage {
    let size = 32u32;
    let mut img = RgbaImage::new(size, size);
    let colors: Vec<[u8; 3]> = palette
        .iter()
        .filter_map(|h| parse_hex(h))
        .collect();
    if colors.is_empty() {
        return img;
    }
    let stripe = (size as usize / colors.len()).max(1);
    for (x, _y, p) in img.enumerate_pixels_mut() {
        let c = colors[((x as usize) / stripe).min(colors.len() - 1)];
        *p = image::Rgba([c[0], c[1], c[2], 255]);
    }
    img
}

/// 没有任何图像信息的条目：标签摘要平铺成确定性纹理。
fn render_label_patch(label: &str) -> RgbaImage {
    let digest = Sha256::digest(label.as_bytes());
    let size = 32u32;
    let mut img = RgbaImage::new(size, size);
    for (x, y, p) in img.enumerate_pixels_mut() {
        let i = ((y / 4) * 8 + (x / 4)) as usize;
        *p = image::Rgba([
            digest[i % 32],
            digest[(i + 7) % 32],
            digest[(i + 17) % 32],
            255,
        ]);
    }
    img
}

/// 标签文本的确定性 embedding（SHA-256 展开到 EMBED_DIM）。
pub fn embed_label(label: &str) -> Vec<f32> {
    let mut v = Vec::with_capacity(EMBED_DIM);
    let mut counter = 0u8;
    while v.len() < EMBED_DIM {
        let mut hasher = Sha256::new();
        hasher.update(label.as_bytes());
        hasher.update([counter]);
        let digest = hasher.finalize();
        for b in digest.iter() {
            if v.len() >= EMBED_DIM {
                break;
            }
            v.push(*b as f32 / 255.0);
        }
        counter = counter.wrapping_add(1);
    }
    l2_normalize(&mut v);
    v
}

/// 内置兜底目录：索引缺失/损坏时用，保证管线永远有东西可推荐。
pub fn default_catalog() -> HashMap<Slot, Vec<ItemMeta>> {
    let meta = |id: u32, label: &str, slot: Slot, set_id: Option<u32>, palette: &[&str]| ItemMeta {
        id,
        label: label.to_string(),
        slot,
        set_id,
        tags: None,
        palette: if palette.is_empty() {
            None
        } else {
            Some(palette.iter().map(|s| s.to_string()).collect())
        },
        thumbnail: None,
    };

    let mut catalog = HashMap::new();
    catalog.insert(
        Slot::Coiffe,
        vec![
            meta(101, "Coiffe du Bouftou", Slot::Coiffe, Some(1), &["a85b19", "f2e6b3"]),
            meta(102, "Chapeau du Piou", Slot::Coiffe, None, &["e8c14c", "f2e6b3"]),
            meta(103, "Couronne de Gelée", Slot::Coiffe, Some(2), &["4cc3e8", "2673b3"]),
            meta(104, "Casque du Chafer", Slot::Coiffe, Some(3), &["595959", "b3b3b3"]),
        ],
    );
    catalog.insert(
        Slot::Cape,
        vec![
            meta(201, "Cape du Bouftou", Slot::Cape, Some(1), &["a85b19", "73401a"]),
            meta(202, "Cape Bleue du Piou", Slot::Cape, None, &["2673b3", "4cc3e8"]),
            meta(203, "Pelisse de Gelée", Slot::Cape, Some(2), &["4cc3e8", "b3b3b3"]),
            meta(204, "Cape du Chafer", Slot::Cape, Some(3), &["1a1a1a", "595959"]),
        ],
    );
    catalog.insert(
        Slot::Bouclier,
        vec![
            meta(301, "Bouclier de Boune", Slot::Bouclier, None, &["b32424", "e8c14c"]),
            meta(302, "Bouclier du Captain Chafer", Slot::Bouclier, Some(3), &["595959", "1a1a1a"]),
            meta(303, "Écu du Piou", Slot::Bouclier, None, &["e8c14c", "d98e26"]),
        ],
    );
    catalog.insert(
        Slot::Familier,
        vec![
            meta(401, "Tofu", Slot::Familier, None, &["e8c14c", "f2e6b3"]),
            meta(402, "Bouftou de compagnie", Slot::Familier, Some(1), &["f2f2f2", "a85b19"]),
            meta(403, "Chacha Noir", Slot::Familier, None, &["1a1a1a", "595959"]),
        ],
    );
    catalog
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::StatsEmbedder;

    fn service_with_defaults() -> ItemIndexService {
        let service = ItemIndexService::new(8, None);
        service.rebuild_in_memory(default_catalog(), &StatsEmbedder);
        service
    }

    #[test]
    fn query_respects_k_and_slot_size() {
        let service = service_with_defaults();
        let q = embed_label("Coiffe du Bouftou");
        assert_eq!(service.query(Slot::Coiffe, &q, 2).len(), 2);
        // k 超过槽位条目数时只返回现有条目
        let all = service.query(Slot::Coiffe, &q, 100);
        assert_eq!(all.len(), service.slot_len(Slot::Coiffe));
    }

    #[test]
    fn query_zero_vector_is_safe() {
        let service = service_with_defaults();
        let zero = vec![0.0f32; EMBED_DIM];
        let got = service.query(Slot::Cape, &zero, 3);
        assert_eq!(got.len(), 3);
        // 零向量余弦全 0，顺序退化为入库顺序
        assert_eq!(got[0].item_id, 201);
    }

    #[test]
    fn query_empty_slot_returns_empty() {
        let service = ItemIndexService::new(8, None);
        let q = embed_label("n'importe quoi");
        assert!(service.query(Slot::Familier, &q, 5).is_empty());
    }

    #[test]
    fn cache_stays_under_bound() {
        let service = ItemIndexService::new(4, None);
        service.rebuild_in_memory(default_catalog(), &StatsEmbedder);
        for i in 0..20u32 {
            let q = embed_label(&format!("requête {}", i));
            let _ = service.query(Slot::Coiffe, &q, 2);
        }
        assert!(service.cache_len() <= 4);
    }

    #[test]
    fn cache_hit_returns_same_result() {
        let service = service_with_defaults();
        let q = embed_label("Tofu");
        let a = service.query(Slot::Familier, &q, 3);
        let b = service.query(Slot::Familier, &q, 3);
        assert_eq!(a, b);
    }

    #[test]
    fn ties_keep_insertion_order() {
        let service = ItemIndexService::new(8, None);
        // 两个条目 embedding 相同，得分必然并列
        let shared = embed_label("même palette");
        let make = |id: u32, label: &str| CandidateRef {
            item_id: id,
            slot: Slot::Cape,
            label: label.to_string(),
            embedding: shared.clone(),
            set_id: None,
            palette: None,
            thumbnail: None,
        };
        if let Ok(mut idx) = service.index.write() {
            idx.items.insert(Slot::Cape, vec![make(5, "premier"), make(6, "second")]);
        }
        let got = service.query(Slot::Cape, &shared, 2);
        assert_eq!(got[0].item_id, 5);
        assert_eq!(got[1].item_id, 6);
    }

    #[test]
    fn invalid_item_ids_are_dropped() {
        let mut catalog = HashMap::new();
        catalog.insert(
            Slot::Coiffe,
            vec![ItemMeta {
                id: 0,
                label: "corrompu".to_string(),
                slot: Slot::Coiffe,
                set_id: None,
                tags: None,
                palette: None,
                thumbnail: None,
            }],
        );
        let service = ItemIndexService::new(8, None);
        service.rebuild_in_memory(catalog, &StatsEmbedder);
        assert_eq!(service.slot_len(Slot::Coiffe), 0);
    }

    #[tokio::test]
    async fn missing_index_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.bin");
        let service = ItemIndexService::load_or_default(path, 8, &StatsEmbedder).await;
        assert!(service.slot_len(Slot::Coiffe) > 0);
    }

    #[tokio::test]
    async fn persist_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bin");
        let service = ItemIndexService::new(8, Some(path.clone()));
        service.build(default_catalog(), &StatsEmbedder).await;

        let reloaded = ItemIndexService::load_or_default(path, 8, &StatsEmbedder).await;
        assert_eq!(reloaded.slot_len(Slot::Cape), service.slot_len(Slot::Cape));
        assert_eq!(reloaded.updated_at(), service.updated_at());
    }

    #[tokio::test]
    async fn corrupt_index_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bin");
        std::fs::write(&path, b"pas du bincode").unwrap();
        let service = ItemIndexService::load_or_default(path, 8, &StatsEmbedder).await;
        assert!(service.slot_len(Slot::Familier) > 0);
    }

    #[test]
    fn label_embedding_is_deterministic_and_normalized() {
        let a = embed_label("Dragodinde");
        let b = embed_label("Dragodinde");
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBED_DIM);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }
}
