use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;

use rescache::cache::DurableStore;
use rescache::config::Config;
use rescache::provider::router::{best_match, RouteTemplate};
use rescache::ResourceRef;

#[derive(Parser, Debug)]
#[command(name = "rescache")]
#[command(about = "Inspect and maintain rescache stores")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/rescache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List the durable stores with their size
  Stores,

  /// Purge one store, or all of them
  Clear {
    /// Store name, e.g. `note` or `note_fetchAll`
    store: Option<String>,
  },

  /// Show which route template a reference selects
  Route {
    /// Route template, in declaration order (repeatable)
    #[arg(short, long = "template", required = true)]
    templates: Vec<String>,

    /// Resource reference, e.g. app://notes/items/4
    resource: String,
  },
}

fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = rescache::logging::init()?;

  match args.command {
    Command::Stores => stores(&config),
    Command::Clear { store } => clear(&config, store.as_deref()),
    Command::Route {
      templates,
      resource,
    } => route(&templates, &resource),
  }
}

fn stores(config: &Config) -> Result<()> {
  let dir = config.cache.resolved_dir()?;
  let paths = DurableStore::list(&dir)?;
  if paths.is_empty() {
    println!("No stores in {}", dir.display());
    return Ok(());
  }

  println!("{:<32} {:>8} {:>12} {:>8}", "STORE", "ENTRIES", "BYTES", "VERSION");
  for path in paths {
    let stats = DurableStore::inspect(&path)?;
    let version = stats
      .version
      .map(|v| v.to_string())
      .unwrap_or_else(|| "-".to_string());
    println!(
      "{:<32} {:>8} {:>12} {:>8}",
      stats.name, stats.entries, stats.bytes, version
    );
  }
  Ok(())
}

fn clear(config: &Config, store: Option<&str>) -> Result<()> {
  let dir = config.cache.resolved_dir()?;
  let paths: Vec<PathBuf> = DurableStore::list(&dir)?
    .into_iter()
    .filter(|path| match store {
      Some(name) => path.file_stem().is_some_and(|stem| stem == name),
      None => true,
    })
    .collect();

  if let (Some(name), true) = (store, paths.is_empty()) {
    return Err(eyre!("No store named `{}` in {}", name, dir.display()));
  }

  for path in paths {
    let removed = DurableStore::purge(&path)?;
    tracing::info!(store = %path.display(), removed, "store purged");
    println!("{}: removed {} entries", path.display(), removed);
  }
  Ok(())
}

fn route(templates: &[String], resource: &str) -> Result<()> {
  let resource = ResourceRef::parse(resource)?;
  let templates: Vec<RouteTemplate> = templates.iter().map(|t| RouteTemplate::parse(t)).collect();

  for template in &templates {
    match template.matches(&resource) {
      Some(m) => println!("{:<40} substitutions={}", template, m.substitutions),
      None => println!("{:<40} no match", template),
    }
  }

  match best_match(&templates, &resource) {
    Some((index, matched)) => {
      println!("\nselected: {}", templates[index]);
      let mut params: Vec<_> = matched.params.into_iter().collect();
      params.sort();
      for (name, value) in params {
        println!("  {} = {}", name, value);
      }
    }
    None => println!("\nno route matches {}", resource),
  }
  Ok(())
}
