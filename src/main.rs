use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use feedkeep::config::{self, Config};
use feedkeep::feed::HttpFetcher;
use feedkeep::reader::Reconciler;
use feedkeep::storage::{Feed, FeedItem, FeedRegistry, JsonItemStore};

#[derive(Parser, Debug)]
#[command(name = "feedkeep", version, about = "OPML feed registry and reader")]
struct Args {
    /// Config file (default: <data dir>/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List subscribed feeds
    List {
        /// Show disabled feeds instead of active ones
        #[arg(long)]
        disabled: bool,
    },
    /// Subscribe to a feed (re-enables it if disabled)
    Add {
        url: String,
        /// Feed title (fetched from the feed when omitted)
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long, value_name = "URL")]
        html_url: Option<String>,
    },
    /// Change the metadata of a feed
    Update {
        url: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long, value_name = "URL")]
        html_url: Option<String>,
    },
    /// Move a disabled feed back to the active list
    Enable { url: String },
    /// Keep a feed but stop fetching it
    Disable { url: String },
    /// Fetch feeds and print their items
    Items {
        /// Only this feed
        #[arg(long, value_name = "URL", conflicts_with = "category")]
        feed: Option<String>,
        /// Only active feeds of this category
        #[arg(long)]
        category: Option<String>,
        /// Include items already marked as read
        #[arg(long)]
        all: bool,
    },
    /// Mark a stored item as read
    MarkRead {
        id: String,
        /// Mark as unread instead
        #[arg(long)]
        unread: bool,
    },
    /// Add every feed of an OPML file
    Import { file: PathBuf },
    /// Write the feed document to an OPML file
    Export { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for debug logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let data_dir = config::resolve_data_dir().context("Failed to set up data directory")?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| data_dir.join(config::CONFIG_FILE_NAME));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let registry = FeedRegistry::open(config.opml_path(&data_dir))
        .context("Failed to open feed document")?;
    let store = JsonItemStore::open(config.storage_path(&data_dir))
        .context("Failed to open item storage")?;
    let fetcher = HttpFetcher::from_config(&config).context("Failed to build HTTP client")?;
    let reconciler = Reconciler::new(&registry, &store, &fetcher);

    match args.command {
        Command::List { disabled } => {
            let feeds = if disabled {
                registry.list_disabled()?
            } else {
                registry.list_active()?
            };
            if feeds.is_empty() {
                println!("No feeds.");
            }
            for feed in &feeds {
                print_feed(feed);
            }
        }
        Command::Add {
            url,
            title,
            category,
            html_url,
        } => {
            let mut feed = match title {
                Some(title) => Feed::new(&url).with_title(title),
                None => reconciler
                    .resolve_feed(&url)
                    .await
                    .with_context(|| format!("Failed to fetch {url}"))?,
            };
            if let Some(category) = category {
                feed.category = category;
            }
            if let Some(html_url) = html_url {
                feed.html_url = html_url;
            }
            registry.add(&feed)?;
            println!("Added {}", feed.url);
        }
        Command::Update {
            url,
            title,
            category,
            html_url,
        } => {
            let mut feed = registry.get(&url)?;
            if let Some(title) = title {
                feed.title = title;
            }
            if let Some(category) = category {
                feed.category = category;
            }
            if let Some(html_url) = html_url {
                feed.html_url = html_url;
            }
            registry.update(&feed)?;
            println!("Updated {url}");
        }
        Command::Enable { url } => {
            registry.enable(&url)?;
            println!("Enabled {url}");
        }
        Command::Disable { url } => {
            registry.disable(&url)?;
            println!("Disabled {url}");
        }
        Command::Items {
            feed,
            category,
            all,
        } => {
            let items = match (feed, category) {
                (Some(url), _) => {
                    let mut feed = registry.get(&url)?;
                    reconciler.get_feed_items(&mut feed, all).await?
                }
                (None, Some(category)) => reconciler.get_category_items(&category, all).await?,
                (None, None) => reconciler.get_items(all).await?,
            };
            if items.is_empty() {
                println!("No items.");
            }
            for item in &items {
                print_item(item);
            }
        }
        Command::MarkRead { id, unread } => {
            let item = reconciler.mark_read(&id, !unread)?;
            println!(
                "Marked '{}' as {}",
                item.title,
                if item.read { "read" } else { "unread" }
            );
        }
        Command::Import { file } => {
            let added = registry
                .import_opml(&file)
                .with_context(|| format!("Failed to import {}", file.display()))?;
            println!("Imported {added} feeds from {}", file.display());
        }
        Command::Export { file } => {
            registry
                .export_opml(&file)
                .with_context(|| format!("Failed to export to {}", file.display()))?;
            println!("Exported feeds to {}", file.display());
        }
    }

    Ok(())
}

fn print_feed(feed: &Feed) {
    let title = if feed.title.is_empty() {
        feed.url.as_str()
    } else {
        feed.title.as_str()
    };
    if feed.category.is_empty() {
        println!("{title}\n    {}", feed.url);
    } else {
        println!("{title} [{}]\n    {}", feed.category, feed.url);
    }
}

fn print_item(item: &FeedItem) {
    let marker = if item.read { ' ' } else { '*' };
    println!("{marker} {}  ({})", item.title, item.id);
    if let Some(link) = &item.link {
        println!("    {link}");
    }
}
