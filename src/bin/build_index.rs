use anyhow::{Context, Result};
use clap::Parser;
use dofus_skinfinder::{ItemIndexService, ItemMeta, Slot, StatsEmbedder, SuggestConfig};
use std::collections::HashMap;
use std::path::PathBuf;

/// 从目录快照 JSON 离线重建物品索引并落盘。
/// 快照格式: { "coiffe": [ItemMeta...], "cape": [...], ... }
#[derive(Parser)]
struct Args {
    /// 目录快照 JSON 路径
    catalog: PathBuf,
    /// 索引输出路径
    #[arg(long)]
    out: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = SuggestConfig::default();
    let out = args.out.unwrap_or_else(|| config.index_path.clone());

    let json = std::fs::read_to_string(&args.catalog)
        .with_context(|| format!("读取目录快照失败: {:?}", args.catalog))?;
    let catalog: HashMap<Slot, Vec<ItemMeta>> =
        serde_json::from_str(&json).context("解析目录快照失败")?;

    let backend = StatsEmbedder;
    let service = ItemIndexService::new(config.cache_max_entries, Some(out.clone()));
    service.build(catalog, &backend).await;
    service.persist().await?;

    for slot in Slot::ALL {
        println!("[BuildIndex] {} 槽位 {} 个物品", slot, service.slot_len(slot));
    }
    println!("[BuildIndex] 完成: {:?} (updated_at {})", out, service.updated_at());
    Ok(())
}
