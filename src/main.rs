mod cache;
mod catalog;
mod config;
mod query;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cache::{CacheStorage, NoopStorage, SqliteStorage};
use catalog::counts::IncrementOutcome;
use catalog::service::{CatalogService, CatalogView};
use catalog::types::{format_count, CatalogItem, Classification, SortOrder};
use catalog::view::ViewOptions;
use query::{Query, QueryState};

#[derive(Parser, Debug)]
#[command(name = "mural")]
#[command(about = "Catalog browser and download-count client for the wallpaper storefront")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/mural/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Disable the persistent snapshot cache for this run
  #[arg(long)]
  no_cache: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List wallpapers, optionally filtered and sorted
  List {
    /// Classification filter: mobile, desktop or profile
    #[arg(short = 't', long = "type")]
    classification: Option<Classification>,

    /// Tag filter (repeatable, OR semantics, substring match)
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Sort order: newest, oldest, most-downloaded, least-downloaded
    #[arg(short, long, default_value = "newest")]
    sort: SortOrder,
  },

  /// List shop products
  Shop {
    /// Tag filter (repeatable, OR semantics, substring match)
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Sort order: newest, oldest, most-downloaded, least-downloaded
    #[arg(short, long, default_value = "newest")]
    sort: SortOrder,
  },

  /// Print the tag vocabulary
  Tags {
    /// Use the shop products table instead of wallpapers
    #[arg(long)]
    shop: bool,
  },

  /// Record a download for a wallpaper and sync the count
  Download {
    /// Record id
    id: String,
  },

  /// Invalidate cached snapshots and fetch fresh data
  Refresh,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();

  let config = config::Config::load(args.config.as_deref())?;
  let api_key = config::Config::get_api_token()?;

  if args.no_cache {
    let service = Arc::new(CatalogService::new(&config, api_key, NoopStorage));
    return run(service, args.command).await;
  }

  let storage = match &config.cache.db_path {
    Some(path) => SqliteStorage::open_at(path)?,
    None => SqliteStorage::open()?,
  };
  let service = Arc::new(CatalogService::new(&config, api_key, storage));
  run(service, args.command).await
}

async fn run<S: CacheStorage>(service: Arc<CatalogService<S>>, command: Command) -> Result<()> {
  service.start_expiry_sweeper();

  match command {
    Command::List {
      classification,
      tags,
      sort,
    } => {
      let options = ViewOptions {
        classification,
        tags,
        sort,
      };
      let view = resolve(service.view_query(options)).await?;
      print_view(&service, &view, true);
    }

    Command::Shop { tags, sort } => {
      let view = resolve(service.shop_query(tags, sort)).await?;
      print_view(&service, &view, false);
    }

    Command::Tags { shop } => {
      let view = if shop {
        resolve(service.shop_query(Vec::new(), SortOrder::NewestFirst)).await?
      } else {
        resolve(service.view_query(ViewOptions::default())).await?
      };
      for tag in &view.tag_vocabulary {
        println!("{tag}");
      }
    }

    Command::Download { id } => {
      let items = service.wallpapers().await?;
      let item = items
        .iter()
        .find(|item| item.id == id)
        .ok_or_else(|| eyre!("no wallpaper with id {id}"))?;

      println!("Downloading {} from {}", item.name, item.download_url);

      let watch = service.watch_count(&id);
      match service.record_download(&id).await {
        IncrementOutcome::Confirmed(_) => {
          println!("Download count: {}", watch.formatted());
        }
        IncrementOutcome::RolledBack(count) => {
          println!(
            "Count sync failed, download count stays at {}",
            format_count(count)
          );
        }
        IncrementOutcome::Ignored => {
          println!("A download is already being recorded for this item");
        }
      }
      watch.cancel();
    }

    Command::Refresh => {
      let wallpapers = service.refetch_wallpapers().await?;
      let products = service.refetch_products().await?;
      println!(
        "Refreshed {} wallpapers and {} products",
        wallpapers.len(),
        products.len()
      );
    }
  }

  Ok(())
}

/// Drive a query to completion, polling the way an interactive consumer
/// would.
async fn resolve(mut query: Query<CatalogView>) -> Result<CatalogView> {
  query.fetch();
  loop {
    if query.poll() {
      match query.state() {
        QueryState::Success(view) => return Ok(view.clone()),
        QueryState::Error(err) => {
          if matches!(err.status, Some(401) | Some(403)) {
            return Err(eyre!("{err}\nCheck that MURAL_API_KEY grants access to the base."));
          }
          return Err(eyre!("{err}"));
        }
        _ => {}
      }
    }
    tokio::time::sleep(Duration::from_millis(25)).await;
  }
}

fn print_view<S: CacheStorage>(
  service: &Arc<CatalogService<S>>,
  view: &CatalogView,
  with_counts: bool,
) {
  if view.broadened {
    println!("(no matches in this category; showing matches from the whole catalog)\n");
  }

  for item in &view.items {
    println!("{}", format_item_line(service, item, with_counts));
  }

  eprintln!(
    "\n{} items, {} tags",
    view.items.len(),
    view.tag_vocabulary.len()
  );
}

fn format_item_line<S: CacheStorage>(
  service: &Arc<CatalogService<S>>,
  item: &CatalogItem,
  with_counts: bool,
) -> String {
  let hot = if item.is_hot { " *" } else { "" };

  if with_counts {
    let kind = item
      .classification
      .map(|c| c.to_string())
      .unwrap_or_else(|| "product".to_string());
    format!(
      "{}  {:<28} {:<8} {:>8}{}  [{}]",
      item.id,
      item.name,
      kind,
      service.counts().get_formatted(&item.id),
      hot,
      item.tags.join(", ")
    )
  } else {
    format!(
      "{}  {:<28} {}{}  [{}]",
      item.id,
      item.name,
      item.download_url,
      hot,
      item.tags.join(", ")
    )
  }
}
