use anyhow::{bail, Context, Result};
use clap::Parser;
use dofus_skinfinder::{
    suggest, DofusPalette, ItemIndexService, RerankRules, StatsEmbedder, SuggestConfig,
    SuggestRequest,
};
use std::path::PathBuf;
use std::time::Instant;

/// 对单张角色图跑一遍推荐管线，打印每槽位结果（调试用）。
#[derive(Parser)]
struct Args {
    /// 角色截图路径
    image: PathBuf,
    /// 索引文件路径，缺省用配置默认值；不存在则退回内置目录
    #[arg(long)]
    index: Option<PathBuf>,
    /// 目标配色，三个 hex 用逗号隔开 (例: b32424,e8c14c,731616)
    #[arg(long)]
    palette: Option<String>,
}

fn parse_palette(s: &str) -> Result<DofusPalette> {
    let parts: Vec<&str> = s.split(',').map(|p| p.trim()).collect();
    if parts.len() != 3 {
        bail!("配色格式应为 3 个 hex 颜色，得到: {}", s);
    }
    Ok(DofusPalette {
        primary: parts[0].to_string(),
        secondary: parts[1].to_string(),
        tertiary: parts[2].to_string(),
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = SuggestConfig::default();
    let backend = StatsEmbedder;

    let index_path = args.index.unwrap_or_else(|| config.index_path.clone());
    let index =
        ItemIndexService::load_or_default(index_path, config.cache_max_entries, &backend).await;

    let bytes = std::fs::read(&args.image)
        .with_context(|| format!("读取图片失败: {:?}", args.image))?;
    let palette = args.palette.as_deref().map(parse_palette).transpose()?;

    let req = SuggestRequest {
        image: Some(bytes),
        palette,
        rules: RerankRules::default(),
    };

    let start = Instant::now();
    let out = suggest(&req, &index, &backend, &config);
    println!("[Timer] suggest 调用总耗时: {:?}", start.elapsed());

    println!(
        "目标配色: {} / {} / {}",
        out.palette.primary, out.palette.secondary, out.palette.tertiary
    );
    for slot in &config.slots {
        let vis = out.visibility.get(slot).copied();
        let conf = out.confidence.get(slot).copied().unwrap_or(0.0);
        println!("--- [{}] 可见度 {:?}, 置信度 {:.2}", slot, vis, conf);
        if let Some(cands) = out.slots.get(slot) {
            for c in cands {
                println!(
                    "  #{:<6} {:<30} score {:.3} ({}{})",
                    c.item_id,
                    c.label,
                    c.score,
                    c.reasons.mode(),
                    if c.verified { ", verified" } else { "" }
                );
            }
        }
    }
    for note in &out.notes {
        println!("[Note] {}", note);
    }
    Ok(())
}
