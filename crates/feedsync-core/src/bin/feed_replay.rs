use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use feedsync_core::aggregator::FeedScope;
use feedsync_core::memory::MemoryStore;
use feedsync_core::models::{Content, ContentVisibility, UserInfo};
use feedsync_core::mutation::RepostToggle;
use feedsync_core::timestamp::RawTimestamp;
use feedsync_core::tracing_setup::init_tracing;
use feedsync_core::{Collaborators, FeedConfig, FeedSession};

#[derive(Parser)]
#[command(name = "feed_replay")]
#[command(about = "Replay a synthetic feed session against the in-memory store")]
struct Args {
    /// Path to JSON feed config (camelCase keys, all optional)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Number of owners besides the viewer
    #[arg(long, default_value_t = 4)]
    owners: usize,

    /// Content items per owner
    #[arg(long, default_value_t = 8)]
    items_per_owner: usize,

    /// Rows visible at once while scrolling
    #[arg(long, default_value_t = 4)]
    window: usize,

    /// Print the final feed as JSON instead of a table
    #[arg(long)]
    json: bool,
}

fn synthetic_store(owners: usize, per_owner: usize) -> MemoryStore {
    let store = MemoryStore::new();
    let base = Utc::now().timestamp() - 86_400;
    for o in 0..owners {
        for i in 0..per_owner {
            let at = base + (i * owners + o) as i64 * 60;
            // Every third item is connections-only
            let visibility = if i % 3 == 2 {
                ContentVisibility::Connections
            } else {
                ContentVisibility::Public
            };
            store.insert_content(
                Content::new(
                    format!("owner{}-item{}", o, i),
                    format!("owner{}", o),
                    RawTimestamp::EpochSeconds(at),
                )
                .with_title(format!("Album {} by owner{}", i, o))
                .with_visibility(visibility),
            );
        }
    }
    store
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%H:%M:%S").to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => FeedConfig::load(path)?,
        None => FeedConfig::default(),
    };

    eprintln!("=== Feed Replay ===\n");
    let memory = synthetic_store(args.owners, args.items_per_owner);
    let session = FeedSession::mount(config.clone(), "viewer", Collaborators::in_memory(&memory));
    session.remember_user(UserInfo {
        user_id: "viewer".into(),
        display_name: "Replay Viewer".into(),
    });

    // Half the owners are connections, the rest are only followed
    let owner_ids: Vec<String> = (0..args.owners).map(|o| format!("owner{}", o)).collect();
    let (connections, followed) = owner_ids.split_at(args.owners / 2);
    let scope = FeedScope::for_viewer("viewer", connections.to_vec(), followed.to_vec());

    let loaded = session.load(scope).await.context("initial load failed")?;
    eprintln!("✓ Loaded {} rows", loaded);
    while !session.is_exhausted() {
        let added = session.load_more().await?;
        if added == 0 {
            break;
        }
        eprintln!("✓ Loaded {} more rows", added);
    }

    // Scroll top to bottom one row at a time
    let ids: Vec<String> = session.items().into_iter().map(|i| i.id).collect();
    let tracker = session.visibility();
    for (pos, id) in ids.iter().enumerate() {
        tracker.observe(id);
        tracker.report(id, 1.0);
        if pos >= args.window {
            tracker.report(&ids[pos - args.window], 0.0);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let registry = session.registry().await?;
    eprintln!(
        "\n📡 Live channels: {}/{} (visible rows: {})",
        registry.active.len(),
        registry.max_concurrent,
        registry.visible.len()
    );

    if let Some(first) = ids.first() {
        session.toggle_like(first).await?;
        eprintln!("✓ Liked {}", first);
        let receipt = session.submit_comment(first, "Replayed comment").await?;
        eprintln!("✓ Commented on {} ({})", first, receipt.comment_id);
    }
    if let Some(last) = ids.last() {
        if let RepostToggle::Reposted = session.toggle_repost(last).await? {
            eprintln!("✓ Reposted {}", last);
        }
    }

    // Let pending teardowns fire
    tokio::time::sleep(config.debounce() + Duration::from_millis(100)).await;

    let items = session.items();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        println!("\n{:<22} {:<10} {:>8} {:>6} {:>6} {:>6}", "ROW", "OWNER", "AT", "LIKES", "REPOST", "LIVE");
        for item in &items {
            println!(
                "{:<22} {:<10} {:>8} {:>6} {:>6} {:>6}",
                item.row_key,
                item.owner_id,
                format_time(item.effective_timestamp),
                item.counters.like_count,
                item.counters.repost_count,
                if item.is_subscribed() { "yes" } else { "-" }
            );
        }
    }

    let stats = session.subscription_stats();
    eprintln!("\n📊 Subscription stats");
    eprintln!("  opened:            {}", stats.opened);
    eprintln!("  closed:            {}", stats.closed);
    eprintln!("  peak active:       {}", stats.peak_active);
    eprintln!("  capacity skips:    {}", stats.capacity_skips);
    eprintln!("  debounce cancels:  {}", stats.debounce_cancels);
    eprintln!("  updates applied:   {}", stats.updates_applied);
    eprintln!("  stale updates:     {}", stats.stale_updates);

    session.unmount().await;
    eprintln!("\n✓ Session unmounted ({} channels still open)", memory.open_channels());
    Ok(())
}
