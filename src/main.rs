use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};

use imgcache::cli::Args;
use imgcache::config::{self, ModifiedBehavior, RegistryConfig};
use imgcache::{Granularity, ImageSaver, ModifiedListChanged, Registry, ResourceHandle, ResourceId, Resolution};

fn init_logging(args: &Args, path_config: &config::PathConfig) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .clone()
            .unwrap_or_else(|| path_config.config_dir().join("imgcache.log"));
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Respects RUST_LOG if set
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

/// Interactive answer for `ModifiedBehavior::Ask`
fn ask_on_stdin(id: &ResourceId) -> Resolution {
    print!("{} has unsaved changes. Save? [y]es / [n]o / [c]ancel: ", id);
    let _ = std::io::stdout().flush();

    let mut line = String::new();
    if std::io::stdin().lock().read_line(&mut line).is_err() {
        return Resolution::Cancel;
    }
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Resolution::Save,
        "n" | "no" => Resolution::Discard,
        _ => Resolution::Cancel,
    }
}

fn describe(handle: &ResourceHandle) -> String {
    let mut line = match handle.metadata() {
        Some(meta) => format!("{}: {}x{} {} [{:?}]", handle.id(), meta.width, meta.height, meta.format, handle.state()),
        None => format!("{}: [{:?}]", handle.id(), handle.state()),
    };
    if let Some(err) = handle.last_error() {
        line.push_str(&format!(" error: {}", err));
    }
    if handle.is_modified() {
        line.push_str(" *modified*");
    }
    line
}

fn main() -> Result<()> {
    let args = Args::parse();

    let path_config = config::PathConfig::from_env_and_cli(args.config_dir.clone());
    init_logging(&args, &path_config)?;
    debug!("Command-line args: {:?}", args);

    let config_file = path_config.config_file();
    let mut registry_config = RegistryConfig::load(&config_file)?;
    if let Some(floor) = args.eviction_floor {
        registry_config.eviction_floor = floor;
    }
    if let Some(workers) = args.workers {
        registry_config.decoder_threads = workers;
    }
    info!("Config path: {}", config_file.display());

    if args.write_config {
        registry_config.save(&config_file)?;
        println!("Wrote {}", config_file.display());
        return Ok(());
    }

    let registry = Registry::with_image_decoder(&registry_config);
    registry.events().subscribe::<ModifiedListChanged, _>(|_| {
        debug!("Modified list changed");
    });

    let granularity = if args.full || !args.edits.is_empty() {
        Granularity::Full
    } else {
        Granularity::MetadataOnly
    };
    let timeout = Duration::from_secs(args.timeout_secs);

    let handles: Vec<ResourceHandle> = args
        .files
        .iter()
        .map(|path| registry.load(path.as_path(), granularity))
        .collect();
    if !registry.wait_idle(timeout) {
        warn!("Timed out waiting for {} decodes", registry.in_flight_count());
    }

    for handle in &handles {
        for &edit in &args.edits {
            if let Err(e) = registry.apply_edit(handle, edit) {
                error!("{}", e);
                break;
            }
        }
    }

    // An explicit destination means "save"; otherwise follow the configured behavior
    let (saver, behavior) = match (&args.output_dir, args.in_place) {
        (Some(dir), _) => (ImageSaver::to_dir(dir), ModifiedBehavior::SaveSilently),
        (None, true) => (ImageSaver::in_place(), ModifiedBehavior::SaveSilently),
        (None, false) => (ImageSaver::in_place(), registry_config.modified_behavior),
    };

    let mut failures = 0;
    for handle in &handles {
        match registry.save_if_modified(handle, &saver, behavior, ask_on_stdin) {
            Ok(true) => {}
            Ok(false) => println!("{}: kept unsaved", handle.id()),
            Err(e) => {
                error!("{}", e);
                failures += 1;
            }
        }
    }
    if !registry.wait_idle(timeout) {
        warn!("Timed out waiting for reloads");
    }

    for handle in &handles {
        println!("{}", describe(handle));
    }

    registry.log_maps();
    let stats = registry.stats();
    info!(
        "Cache stats: hits={} misses={} promotions={} evictions={} hit_rate={:.2}",
        stats.hits(),
        stats.misses(),
        stats.promotions(),
        stats.evictions(),
        stats.hit_rate()
    );

    if failures > 0 {
        anyhow::bail!("{} image(s) failed to save", failures);
    }
    Ok(())
}
