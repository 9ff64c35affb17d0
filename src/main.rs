use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use futures_util::future::join_all;
use image::DynamicImage;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use pictor::domain::{FetchOutcome, FetchRequest, Transform};
use pictor::infrastructure::config::Command;
use pictor::infrastructure::{AppConfig, CliArgs, ConfigStore, FetchHandle, ImageCache};

fn init_logging(config: &AppConfig) -> Result<()> {
    let default_level = LevelFilter::from_level(config.log_level.to_tracing_level());
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    if let Some(log_path) = &config.log_path {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();

        info!(path = %log_path.display(), "Logging initialized");
    } else {
        let stderr_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
    }

    Ok(())
}

fn load_config(args: &CliArgs) -> Result<AppConfig> {
    let store = ConfigStore::new()?;
    let mut config = store
        .load_config(args.config.as_deref())
        .wrap_err("failed to load configuration")?;
    config.merge_with_args(args);
    Ok(config)
}

struct FetchOptions<'a> {
    transform: Transform,
    refresh: bool,
    use_disk_cache: bool,
    output: Option<&'a Path>,
    json: bool,
}

async fn run_fetch(cache: &ImageCache, urls: &[String], options: FetchOptions<'_>) -> Result<()> {
    if let Some(dir) = options.output {
        tokio::fs::create_dir_all(dir)
            .await
            .wrap_err_with(|| format!("failed to create {}", dir.display()))?;
    }

    let requests = urls.iter().map(|url| {
        FetchRequest::new(url.clone())
            .with_transform(options.transform.clone())
            .with_refresh(options.refresh)
            .with_disk_cache(options.use_disk_cache)
    });
    let handles = cache.request_batch(requests);
    let outcomes = join_all(handles.into_iter().map(FetchHandle::wait)).await;

    let mut failures = 0usize;
    for (url, outcome) in urls.iter().zip(outcomes) {
        let key = ImageCache::cache_key(url, &options.transform);

        let saved = match (options.output, outcome.image()) {
            (Some(dir), Some(image)) => {
                let path = dir.join(format!("{key}.png"));
                save_png(image.clone(), path.clone()).await?;
                Some(path)
            }
            _ => None,
        };

        if !outcome.is_success() {
            failures += 1;
        }

        if options.json {
            println!("{}", outcome_json(url, key.as_str(), &outcome, saved.as_deref()));
        } else {
            match (&outcome, outcome.image()) {
                (_, Some(image)) => println!(
                    "{url}\t{}\t{}x{}\t{key}",
                    outcome.source().map_or_else(String::new, |s| s.to_string()),
                    image.width(),
                    image.height()
                ),
                (FetchOutcome::Failed(e), None) => println!("{url}\tfailed\t{e}"),
                _ => println!("{url}\tcancelled"),
            }
        }
    }

    info!(
        total = urls.len(),
        failures = failures,
        stats = %cache.memory_cache_stats(),
        "Fetch finished"
    );

    if failures > 0 {
        color_eyre::eyre::bail!("{failures} of {} images failed", urls.len());
    }
    Ok(())
}

fn outcome_json(
    url: &str,
    key: &str,
    outcome: &FetchOutcome,
    saved: Option<&Path>,
) -> serde_json::Value {
    serde_json::json!({
        "url": url,
        "key": key,
        "source": outcome.source().map(|s| s.to_string()),
        "width": outcome.image().map(|i| i.width()),
        "height": outcome.image().map(|i| i.height()),
        "error": outcome.error().map(ToString::to_string),
        "cancelled": outcome.is_cancelled(),
        "saved": saved.map(|p| p.display().to_string()),
    })
}

async fn save_png(image: Arc<DynamicImage>, path: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        image
            .save_with_format(&path, image::ImageFormat::Png)
            .wrap_err_with(|| format!("failed to save {}", path.display()))
    })
    .await?
}

async fn run_key(cache: &ImageCache, url: &str, transform: &Transform) {
    let key = ImageCache::cache_key(url, transform);
    let location = cache.disk_cache_location(url, transform);
    let cached = cache.disk_cache().contains(&key).await;

    println!("key:      {key}");
    println!("filename: {}", ImageCache::cache_filename(url, transform));
    println!("location: {}", location.display());
    println!("cached:   {cached}");
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = CliArgs::parse();
    let config = load_config(&args)?;

    init_logging(&config)?;

    info!(version = pictor::VERSION, "Starting pictor");

    let cache = ImageCache::init_shared(config.cache.clone()).await?;

    match &args.command {
        Command::Fetch {
            urls,
            transform,
            refresh,
            no_disk_cache,
            output,
            json,
        } => {
            let options = FetchOptions {
                transform: transform.parse()?,
                refresh: *refresh,
                use_disk_cache: !*no_disk_cache,
                output: output.as_deref(),
                json: *json,
            };
            run_fetch(&cache, urls, options).await?;
        }
        Command::Key { url, transform } => {
            run_key(&cache, url, &transform.parse()?).await;
        }
        Command::Clear => {
            let entries = cache.disk_cache().len();
            let bytes = cache.disk_cache().current_size();
            cache.clear_disk().await?;
            if entries == 0 {
                warn!("Disk cache was already empty");
            }
            println!(
                "Removed {entries} entries ({bytes} bytes) from {}",
                cache.disk_cache().cache_dir().display()
            );
        }
    }

    Ok(())
}
