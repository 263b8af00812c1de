use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use dxcodes::api::{
  BulkUpdate, CodesClient, CsvUpload, DiagnosticCode, DiagnosticCodeCreate, DiagnosticCodeUpdate,
  ExportFilter, ListParams, Severity,
};
use dxcodes::cache::CacheSource;
use dxcodes::config::Config;
use dxcodes::db::{SavedFilter, SavedFilterStore};
use dxcodes::logging;
use dxcodes::search::Autocomplete;

#[derive(Parser, Debug)]
#[command(name = "dxcodes")]
#[command(about = "Browse and edit diagnostic codes")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/dxcodes/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Backend base URL, overriding the config file
  #[arg(long, global = true)]
  api_url: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List codes, optionally filtered
  List {
    #[command(flatten)]
    filter: FilterArgs,
    #[arg(long)]
    active: Option<bool>,
    #[arg(long, default_value_t = 0)]
    skip: u64,
    #[arg(long)]
    limit: Option<u64>,
    /// Start from a saved filter (by id)
    #[arg(long)]
    saved: Option<i64>,
  },
  /// Show one code by id, or by code string with --by-code
  Show {
    target: String,
    #[arg(long)]
    by_code: bool,
  },
  Create {
    code: String,
    description: String,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    subcategory: Option<String>,
    #[arg(long)]
    severity: Option<Severity>,
    #[arg(long)]
    inactive: bool,
  },
  Update {
    id: i64,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    subcategory: Option<String>,
    #[arg(long)]
    severity: Option<Severity>,
    #[arg(long)]
    active: Option<bool>,
  },
  Delete {
    id: i64,
  },
  BulkDelete {
    #[arg(required = true)]
    ids: Vec<i64>,
  },
  /// Set category, severity or active flag on several codes
  BulkUpdate {
    #[arg(required = true)]
    ids: Vec<i64>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    severity: Option<Severity>,
    #[arg(long)]
    active: Option<bool>,
  },
  /// Create or update codes from a CSV file
  Import {
    file: PathBuf,
  },
  /// Restore a code to an earlier version
  Restore {
    id: i64,
    version_id: i64,
    #[arg(long)]
    comment: Option<String>,
  },
  /// Manage the current user's favorites
  Favorites {
    #[command(subcommand)]
    command: FavoritesCommand,
  },
  /// Autocomplete suggestions for a partial query
  Suggest {
    query: String,
  },
  /// Export codes as CSV
  Export {
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    severity: Option<Severity>,
    #[arg(long)]
    active: Option<bool>,
    /// Output file (default: the file name suggested by the server)
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Manage saved filters
  Filters {
    #[command(subcommand)]
    command: FiltersCommand,
  },
}

#[derive(Subcommand, Debug)]
enum FavoritesCommand {
  List,
  Add { id: i64 },
  Remove { id: i64 },
  /// Check one or more ids
  Check {
    #[arg(required = true)]
    ids: Vec<i64>,
  },
}

#[derive(Subcommand, Debug)]
enum FiltersCommand {
  Save {
    name: String,
    #[command(flatten)]
    filter: FilterArgs,
  },
  List,
  Show { id: i64 },
  Delete { id: i64 },
}

#[derive(clap::Args, Debug, Clone, Default)]
struct FilterArgs {
  #[arg(long)]
  search: Option<String>,
  #[arg(long)]
  category: Option<String>,
  #[arg(long)]
  severity: Option<Severity>,
}

impl FilterArgs {
  fn is_empty(&self) -> bool {
    self.search.is_none() && self.category.is_none() && self.severity.is_none()
  }

  fn to_list_params(&self) -> ListParams {
    ListParams {
      search: self.search.clone(),
      category: self.category.clone(),
      severity: self.severity,
      ..Default::default()
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Override API url if specified on command line
  if let Some(url) = args.api_url {
    config.api.url = url;
  }

  let _log_guard = logging::init(&config.log)?;
  info!(url = %config.api.url, "dxcodes starting");

  match args.command {
    Command::Filters { command } => run_filters(command),
    command => {
      let client = CodesClient::new(&config)?;
      run(command, &client, &config).await
    }
  }
}

async fn run(command: Command, client: &CodesClient, config: &Config) -> Result<()> {
  match command {
    Command::List {
      filter,
      active,
      skip,
      limit,
      saved,
    } => {
      let mut params = match saved {
        Some(id) => load_filter(id)?.to_list_params(None),
        None => ListParams::default(),
      };
      if !filter.is_empty() {
        let extra = filter.to_list_params();
        params.search = extra.search.or(params.search);
        params.category = extra.category.or(params.category);
        params.severity = extra.severity.or(params.severity);
      }
      params.is_active = active;
      params.skip = Some(skip);
      params.limit = Some(limit.unwrap_or_else(|| config.page_size()));

      let result = client.list(&params).await?;
      if result.source == CacheSource::Offline {
        eprintln!("backend unreachable, showing cached data");
      }
      let page = result.data;
      for code in &page.items {
        print_row(code);
      }
      println!(
        "{}-{} of {}",
        skip + u64::from(!page.items.is_empty()),
        skip + page.items.len() as u64,
        page.total
      );
    }
    Command::Show { target, by_code } => {
      let code = if by_code {
        client.get_by_code(&target).await?
      } else {
        let id: i64 = target
          .parse()
          .map_err(|_| eyre!("'{}' is not an id (use --by-code for code strings)", target))?;
        client.get(id).await?.data
      };
      print_detail(&code);
    }
    Command::Create {
      code,
      description,
      category,
      subcategory,
      severity,
      inactive,
    } => {
      let input = DiagnosticCodeCreate {
        category,
        subcategory,
        severity,
        is_active: !inactive,
        ..DiagnosticCodeCreate::new(code, description)
      };
      let created = client.create(&input).await?;
      println!("created {} (id {})", created.code, created.id);
    }
    Command::Update {
      id,
      description,
      category,
      subcategory,
      severity,
      active,
    } => {
      let patch = DiagnosticCodeUpdate {
        description,
        category,
        subcategory,
        severity,
        is_active: active,
      };
      let updated = client.update(id, &patch).await?;
      print_detail(&updated);
    }
    Command::Delete { id } => {
      client.delete(id).await?;
      println!("deleted {}", id);
    }
    Command::BulkDelete { ids } => {
      let result = client.bulk_delete(&ids).await?;
      println!("deleted {} of {}", result.deleted, result.total);
      for error in &result.errors {
        eprintln!("  {}", error);
      }
    }
    Command::BulkUpdate {
      ids,
      category,
      severity,
      active,
    } => {
      let update = BulkUpdate {
        category,
        severity,
        is_active: active,
      };
      let result = client.bulk_update(&ids, &update).await?;
      println!("updated {} of {}", result.updated, result.total);
      for error in &result.errors {
        eprintln!("  {}", error);
      }
    }
    Command::Import { file } => {
      let content =
        std::fs::read(&file).map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?;
      let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
      let result = client.import_csv(&CsvUpload::new(filename, content)).await?;
      println!(
        "imported {} rows ({} created, {} updated)",
        result.total_processed, result.created, result.updated
      );
      for error in &result.errors {
        eprintln!("  {}", error);
      }
    }
    Command::Restore {
      id,
      version_id,
      comment,
    } => {
      let version = client
        .restore_version(id, version_id, comment.as_deref())
        .await?;
      println!(
        "restored {} from version entry {} (now version {})",
        version.code, version_id, version.version_number
      );
    }
    Command::Favorites { command } => run_favorites(command, client).await?,
    Command::Suggest { query } => {
      // One-shot lookup, so no need to wait for typing to pause
      let no_delay = Config {
        cache: dxcodes::config::CacheConfig {
          autocomplete_delay_ms: 0,
          ..config.cache.clone()
        },
        ..config.clone()
      };
      let mut autocomplete = Autocomplete::for_client(client.clone(), &no_delay);
      autocomplete.set_input(&query);
      while autocomplete.is_pending() {
        tokio::time::sleep(Duration::from_millis(20)).await;
        autocomplete.poll();
      }
      for s in autocomplete.suggestions() {
        println!("{:<16} {:<10} {}", s.code, s.match_type, s.description);
      }
    }
    Command::Export {
      category,
      severity,
      active,
      output,
    } => {
      let filter = ExportFilter {
        category,
        severity,
        is_active: active,
      };
      let export = client.export_csv(&filter).await?;
      let path = output.unwrap_or_else(|| PathBuf::from(&export.filename));
      std::fs::write(&path, &export.content)
        .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
      println!("exported {} codes to {}", export.count, path.display());
    }
    Command::Filters { command } => run_filters(command)?,
  }
  Ok(())
}

async fn run_favorites(command: FavoritesCommand, client: &CodesClient) -> Result<()> {
  match command {
    FavoritesCommand::List => {
      let favorites = client.favorites().await?.data;
      for code in &favorites.items {
        print_row(code);
      }
      println!("{} favorites", favorites.total);
    }
    FavoritesCommand::Add { id } => {
      client.add_favorite(id).await?;
      println!("added {} to favorites", id);
    }
    FavoritesCommand::Remove { id } => {
      client.remove_favorite(id).await?;
      println!("removed {} from favorites", id);
    }
    FavoritesCommand::Check { ids } => {
      use futures::{StreamExt, TryStreamExt};

      let checks: Vec<(i64, bool)> = futures::stream::iter(ids)
        .map(|id| async move { client.is_favorite(id).await.map(|f| (id, f)) })
        .buffered(4)
        .try_collect()
        .await?;
      for (id, favorite) in checks {
        println!("{:>6}  {}", id, if favorite { "favorite" } else { "not a favorite" });
      }
    }
  }
  Ok(())
}

fn run_filters(command: FiltersCommand) -> Result<()> {
  let store = SavedFilterStore::open_default()?;
  match command {
    FiltersCommand::Save { name, filter } => {
      let params = filter.to_list_params();
      if let Some(existing) = store.find_by_params(&params)? {
        println!("note: same filter already saved as '{}' ({})", existing.name, existing.id);
      }
      let saved = store.save(&name, &params)?;
      println!("saved filter '{}' ({})", saved.name, saved.id);
    }
    FiltersCommand::List => {
      for filter in store.list()? {
        print_filter(&filter);
      }
    }
    FiltersCommand::Show { id } => {
      let filter = store
        .load(id)?
        .ok_or_else(|| eyre!("No saved filter with id {}", id))?;
      print_filter(&filter);
    }
    FiltersCommand::Delete { id } => {
      if !store.delete(id)? {
        return Err(eyre!("No saved filter with id {}", id));
      }
      println!("deleted filter {}", id);
    }
  }
  Ok(())
}

fn load_filter(id: i64) -> Result<SavedFilter> {
  SavedFilterStore::open_default()?
    .load(id)?
    .ok_or_else(|| eyre!("No saved filter with id {}", id))
}

fn print_row(code: &DiagnosticCode) {
  println!(
    "{:>6}  {:<16} {:<10} {:<8} {}{}",
    code.id,
    code.code,
    code.category.as_deref().unwrap_or("-"),
    code.severity.map(|s| s.as_str()).unwrap_or("-"),
    code.description,
    if code.is_active { "" } else { " (inactive)" }
  );
}

fn print_detail(code: &DiagnosticCode) {
  println!("id:          {}", code.id);
  println!("code:        {}", code.code);
  println!("description: {}", code.description);
  println!("category:    {}", code.category.as_deref().unwrap_or("-"));
  println!("subcategory: {}", code.subcategory.as_deref().unwrap_or("-"));
  println!(
    "severity:    {}",
    code.severity.map(|s| s.as_str()).unwrap_or("-")
  );
  println!("active:      {}", code.is_active);
  println!("created:     {}", code.created_at.format("%Y-%m-%d %H:%M:%S"));
  println!("updated:     {}", code.updated_at.format("%Y-%m-%d %H:%M:%S"));
}

fn print_filter(filter: &SavedFilter) {
  println!(
    "{:>4}  {:<20} search={} category={} severity={}  ({})",
    filter.id,
    filter.name,
    filter.search.as_deref().unwrap_or("-"),
    filter.category.as_deref().unwrap_or("-"),
    filter.severity.map(|s| s.as_str()).unwrap_or("-"),
    filter.created_at.format("%Y-%m-%d")
  );
}
