use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use mapfeeds::config::Config;
use mapfeeds::context::FeedContext;
use mapfeeds::engine::{run_feeds, stream_feed};
use mapfeeds::feed::{merge_results, FeedKind, FeedResult, FeedSettings};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Default config file path (~/.config/mapfeeds/config.toml)
fn default_config_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("mapfeeds")
        .join("config.toml"))
}

#[derive(Parser, Debug)]
#[command(name = "mapfeeds", about = "Read paginated custom map feeds")]
struct Args {
    /// Feeds to read (e.g. beatsaver-latest, scoresaber-trending)
    #[arg(required = true, value_name = "FEED")]
    feeds: Vec<FeedKind>,

    /// Stop after this many maps per feed (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_songs: usize,

    /// Stop after this many pages per feed (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_pages: usize,

    /// Search text for search feeds
    #[arg(long, conflicts_with = "author")]
    query: Option<String>,

    /// Mapper id (BeatSaver) or user name (BeastSaber)
    #[arg(long)]
    author: Option<String>,

    /// Pages fetched at once per feed (overrides the config file)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Items per page, for services that accept a page size
    #[arg(long, default_value_t = FeedSettings::DEFAULT_SONGS_PER_PAGE)]
    songs_per_page: usize,

    /// First page index to read
    #[arg(long, default_value_t = 0)]
    starting_page: usize,

    /// Keep each item's raw payload in the output
    #[arg(long)]
    store_raw: bool,

    /// Config file path
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    /// Print pages as they are merged (single feed only)
    #[arg(long)]
    stream: bool,
}

impl Args {
    fn settings(&self, kind: FeedKind, concurrency: usize) -> FeedSettings {
        let mut settings = FeedSettings::new(kind)
            .with_max_songs(self.max_songs)
            .with_max_pages(self.max_pages)
            .with_songs_per_page(self.songs_per_page)
            .with_starting_page(self.starting_page)
            .with_concurrency(concurrency)
            .with_store_raw(self.store_raw);
        if let Some(query) = &self.query {
            settings = settings.with_query(query.clone());
        }
        if let Some(author) = &self.author {
            settings = settings.with_author(author.clone());
        }
        settings
    }
}

fn print_text(result: &FeedResult) {
    for item in result.items() {
        let id = item.identity().unwrap_or_default();
        println!("{:<42} {} ({})", id, item.name(), item.level_author());
    }
    println!(
        "{} maps from {} pages",
        result.songs.len(),
        result.pages_checked
    );
}

fn print_json(result: &FeedResult) -> Result<()> {
    let output = serde_json::json!({
        "success": result.success,
        "state": result.state,
        "error": result.error.as_ref().map(|e| e.to_string()),
        "error_kind": result.error_kind(),
        "pages_checked": result.pages_checked,
        "songs": result.items().collect::<Vec<_>>(),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("Failed to serialize result")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let ctx = FeedContext::from_config(&config).context("Failed to create HTTP client")?;

    let concurrency = args.concurrency.unwrap_or(config.concurrency);
    let settings: Vec<_> = args
        .feeds
        .iter()
        .map(|&kind| args.settings(kind, concurrency))
        .collect();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, stopping feeds");
            on_interrupt.cancel();
        }
    });

    let result = if args.stream && settings.len() == 1 {
        let mut pages = stream_feed(&ctx, &settings[0], &cancel);
        while let Some(page) = pages.next().await {
            if !args.json {
                println!("-- page {} ({} items) {}", page.index, page.items.len(), page.source);
            }
        }
        pages.finish().await
    } else {
        if args.stream {
            tracing::warn!("--stream applies to a single feed, reading feeds concurrently");
        }
        merge_results(run_feeds(&ctx, &settings, &cancel).await)
    };

    if args.json {
        print_json(&result)?;
    } else {
        print_text(&result);
    }

    if let Some(error) = &result.error {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }
    Ok(())
}
