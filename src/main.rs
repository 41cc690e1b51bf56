//! Biblio Translate - command line front end
//!
//! Lists translators, detects the format of a file and converts between
//! formats through an in-memory library.

use biblio_translate::core::{EngineConfig, GlobalArgs, Logger};
use biblio_translate::library::MemoryStore;
use biblio_translate::pipeline::HttpFetcher;
use biblio_translate::translate::{HttpReporter, Services, Translate};
use biblio_translate::translator::{DefaultEngine, DirectorySource, Mode, TranslatorCache};
use biblio_translate::translators::builtin_source;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Timeout for attachment downloads
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "biblio-translate", version, about = "Bibliographic import, export and format conversion")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the loaded translators
    List {
        /// Only translators serving this mode (import, export, web, search)
        #[arg(long = "type", value_name = "MODE")]
        mode: Option<Mode>,
    },
    /// Detect which translators can import a file
    Detect { file: PathBuf },
    /// Import a file and export it with another translator
    Convert {
        input: PathBuf,

        /// ID of the export translator
        #[arg(long, value_name = "TRANSLATOR_ID")]
        to: String,

        /// Output file; stdout when omitted
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Copy attachment files next to the output
        #[arg(long)]
        embed_files: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration (CLI args, env vars, config file)
    let config = match EngineConfig::load(&cli.global) {
        Ok(cfg) => cfg,
        Err(e) => {
            // Logging isn't initialized yet
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let _logger = match Logger::init(&config.logging) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return Err(e);
        }
    };
    info!("Starting biblio-translate v{}", env!("CARGO_PKG_VERSION"));

    // Blocking HTTP clients must be built outside the runtime
    let (cache, services) = build_services(&config)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cli.command, &cache, &services))
}

fn build_services(config: &EngineConfig) -> Result<(Arc<TranslatorCache>, Services)> {
    let mut cache = TranslatorCache::new();
    if let Some(dir) = &config.translators.dir {
        info!(dir = %dir.display(), "Loading translators from directory");
        cache = cache.with_source(DirectorySource::new(dir));
    }
    let cache = Arc::new(cache.with_source(builtin_source()));
    let count = cache.init()?;
    info!(count, "Translators ready");

    let mut services = Services::new(
        cache.clone(),
        Arc::new(DefaultEngine::with_builtins()),
        Arc::new(MemoryStore::new()),
        Arc::new(HttpFetcher::new(FETCH_TIMEOUT)?),
    )
    .with_prefs(config.prefs.clone())
    .with_io(config.io.clone());
    if let Some(reporter) = HttpReporter::from_config(&config.reporting)? {
        services = services.with_reporter(Arc::new(reporter));
    }
    Ok((cache, services))
}

async fn run(command: Command, cache: &TranslatorCache, services: &Services) -> Result<()> {
    match command {
        Command::List { mode } => {
            for descriptor in cache.all() {
                if mode.map_or(true, |m| descriptor.supports(m)) {
                    println!(
                        "{:<38} {:<28} {:?}",
                        descriptor.id, descriptor.label, descriptor.types
                    );
                }
            }
        }
        Command::Detect { file } => {
            let translate = Translate::new(Mode::Import, services.clone());
            translate.set_location(&file)?;
            let found = translate.detect().await?;
            if found.is_empty() {
                println!("No translator can import {}", file.display());
            }
            for f in found {
                println!("{:<38} {}", f.descriptor.id, f.descriptor.label);
            }
        }
        Command::Convert {
            input,
            to,
            output,
            embed_files,
        } => convert(services, input, &to, output, embed_files).await?,
    }
    Ok(())
}

async fn convert(
    services: &Services,
    input: PathBuf,
    to: &str,
    output: Option<PathBuf>,
    embed_files: bool,
) -> Result<()> {
    let import = Translate::new(Mode::Import, services.clone());
    import.set_location(&input)?;
    let found = import.detect().await?;
    let reader = found
        .first()
        .ok_or_else(|| anyhow!("No translator can import {}", input.display()))?;
    info!(translator = %reader.descriptor.label, "Importing {}", input.display());

    import.set_translators(vec![reader.descriptor.clone()]);
    if !import.run().await? {
        bail!(failure(&import, "Import failed"));
    }
    let items = import.saved_items();
    info!(items = items.len(), "Import complete");

    let export = Translate::new(Mode::Export, services.clone());
    export.set_translator(to)?;
    export.set_items(items);
    if embed_files {
        let mut options = serde_json::Map::new();
        options.insert("exportFileData".to_string(), Value::Bool(true));
        export.set_display_options(options);
    }
    if let Some(path) = &output {
        export.set_location(path)?;
    }
    if !export.run().await? {
        bail!(failure(&export, "Export failed"));
    }

    match output {
        Some(path) => info!(path = %path.display(), "Export written"),
        None => print!("{}", export.output().unwrap_or_default()),
    }
    Ok(())
}

fn failure(translate: &Translate, context: &str) -> String {
    match translate.take_error() {
        Some(e) => format!("{}: {}", context, e),
        None => context.to_string(),
    }
}
