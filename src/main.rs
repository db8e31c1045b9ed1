use alphageist::core::config::{AppDirs, Config, ConfigStore, JsonConfigStore};
use alphageist::ui::cli::{parse_config_value, Cli, Commands, ConfigCommand};
use alphageist::{Backend, Orchestrator, OrchestratorState, QueryResult, StreamHandler};
use anyhow::{anyhow, bail, Result};
use clap::Parser;
use std::io::Write;
use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = AppDirs::new(cli.base_dir.clone())?;
    let config_path = cli.config.clone().unwrap_or_else(|| dirs.config_path.clone());
    let store = Arc::new(JsonConfigStore::with_defaults(
        &config_path,
        Config::default_config(&dirs),
    ));

    init_logging(store.load().ok().as_ref());

    match &cli.command {
        Commands::Init => handle_init(&dirs, &config_path),
        Commands::Config { action } => match action {
            ConfigCommand::Show => handle_config_show(store.as_ref()),
            ConfigCommand::Set { key, value } => handle_config_set(store.as_ref(), key, value),
        },
        Commands::Index { rebuild } => handle_index(store, Backend::new(&dirs), *rebuild),
        Commands::Ask { query } => handle_ask(store, Backend::new(&dirs), query),
    }
}

/// `RUST_LOG` wins over the configured `log_level`
fn init_logging(config: Option<&Config>) {
    let level = config.map_or("info", Config::log_filter);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn handle_init(dirs: &AppDirs, config_path: &Path) -> Result<()> {
    println!("Initializing alphageist...");

    if config_path.exists() {
        println!("alphageist is already initialized: {}", config_path.display());
        println!("Use 'alphageist config set' to change settings.");
        return Ok(());
    }

    dirs.init()?;
    println!("✓ Created data directory: {}", dirs.base_dir.display());
    println!("✓ Created index directory: {}", dirs.index_dir.display());

    JsonConfigStore::new(config_path).save(&Config::default_config(dirs))?;
    println!("✓ Wrote default configuration: {}", config_path.display());

    println!("\nInitialization complete!");
    println!("Next steps:");
    println!("  1. Set your API key:      alphageist config set credential <KEY>");
    println!("  2. Choose folders:        alphageist config set search_paths /path/to/docs");
    println!("  3. Build the index:       alphageist index");
    println!("  4. Ask a question:        alphageist ask \"...\"");

    Ok(())
}

fn handle_config_show(store: &dyn ConfigStore) -> Result<()> {
    let config = store.load()?.masked();
    for (key, value) in config.iter() {
        println!("{} = {}", key, value);
    }
    if let Err(e) = config.check() {
        println!("\n⚠ {}", e);
    }
    Ok(())
}

fn handle_config_set(store: &dyn ConfigStore, key: &str, value: &str) -> Result<()> {
    let mut config = store.load()?;
    config.set(key, parse_config_value(key, value));
    store.save(&config)?;
    println!("✓ Set {}", key);

    if let Err(e) = config.check() {
        println!("⚠ {}", e);
    }
    Ok(())
}

fn handle_index(store: Arc<JsonConfigStore>, backend: Backend, rebuild: bool) -> Result<()> {
    let orchestrator = Orchestrator::new(store, backend);
    let states = watch_states(&orchestrator);

    start_index(&orchestrator)?;
    if rebuild && orchestrator.state() == OrchestratorState::Standby {
        println!("Deleting existing index...");
        orchestrator.reset()?;
        start_index(&orchestrator)?;
    }

    wait_for_index(&orchestrator, &states)?;
    println!("✓ Index ready");
    Ok(())
}

fn handle_ask(store: Arc<JsonConfigStore>, backend: Backend, query: &str) -> Result<()> {
    let orchestrator = Orchestrator::new(store, backend);
    let states = watch_states(&orchestrator);

    start_index(&orchestrator)?;
    wait_for_index(&orchestrator, &states)?;

    orchestrator.start_search(query, vec![Arc::new(StdoutStream)])?;
    orchestrator.wait();
    ensure_not_failed(&orchestrator)
}

fn start_index(orchestrator: &Orchestrator) -> Result<()> {
    orchestrator.load_config()?;
    ensure_not_failed(orchestrator)?;
    orchestrator.start_init_index()?;
    ensure_not_failed(orchestrator)
}

/// Forward every state change into a channel the main thread can wait on
fn watch_states(orchestrator: &Orchestrator) -> Receiver<OrchestratorState> {
    let (tx, rx) = mpsc::channel();
    orchestrator.subscribe_to_statechange(move |_, new| {
        let _ = tx.send(new);
    });
    rx
}

fn wait_for_index(orchestrator: &Orchestrator, states: &Receiver<OrchestratorState>) -> Result<()> {
    if orchestrator.state() == OrchestratorState::LoadingIndex {
        println!("Building index...");
    }

    while orchestrator.state() == OrchestratorState::LoadingIndex {
        if let Some(progress) = orchestrator.loading_progress() {
            print!(
                "\r  {}/{} files {}",
                progress.items_loaded,
                progress.total_items,
                progress.current_item.as_deref().unwrap_or("")
            );
            let _ = std::io::stdout().flush();
        }
        let _ = states.recv_timeout(Duration::from_millis(250));
    }
    orchestrator.wait();
    println!();

    ensure_not_failed(orchestrator)
}

fn ensure_not_failed(orchestrator: &Orchestrator) -> Result<()> {
    if orchestrator.state() != OrchestratorState::Error {
        return Ok(());
    }
    match orchestrator.exception() {
        Some(e) => Err(anyhow!("{}", e)),
        None => bail!("alphageist failed without an error message"),
    }
}

/// Prints tokens as they arrive, then the cited sources
struct StdoutStream;

impl StreamHandler for StdoutStream {
    fn on_token(&self, token: &str) {
        print!("{}", token);
        let _ = std::io::stdout().flush();
    }

    fn on_completion(&self, result: &QueryResult) {
        println!();
        let sources = result.source_list();
        if !sources.is_empty() {
            println!("\nSources:");
            for source in sources {
                println!("  • {}", source);
            }
        }
    }
}
