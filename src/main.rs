mod app;
mod config;
mod render;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use crudkit::Filters;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "crudkit")]
#[command(about = "Browse and edit REST entities with a local query cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/crudkit/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
  /// List one page of an entity
  List {
    entity: String,
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = crudkit::query::DEFAULT_PAGE_SIZE)]
    page_size: u32,
    /// Filter as field=value (repeatable); values are JSON when they parse
    #[arg(short, long = "filter", value_parser = parse_filter)]
    filters: Vec<(String, Value)>,
    /// Field to sort by
    #[arg(long)]
    sort: Option<String>,
    /// Sort descending
    #[arg(long)]
    desc: bool,
    /// Include audit columns
    #[arg(long)]
    all_columns: bool,
  },
  /// Show one record by its key token (composite keys joined with `-`)
  Show {
    entity: String,
    token: String,
    #[arg(long)]
    all_columns: bool,
  },
  /// Create a record from JSON
  Create {
    entity: String,
    #[arg(long, value_parser = parse_json)]
    data: Value,
  },
  /// Update a record from JSON
  Update {
    entity: String,
    #[arg(long, value_parser = parse_json)]
    data: Value,
  },
  /// Delete a record by its key token
  Delete {
    entity: String,
    token: String,
    /// Skip the confirmation prompt
    #[arg(short, long)]
    yes: bool,
  },
  /// Invoke a custom method
  Call {
    entity: String,
    method: String,
    #[arg(long, value_parser = parse_json, default_value = "null")]
    args: Value,
  },
}

fn parse_json(s: &str) -> Result<Value, String> {
  serde_json::from_str(s).map_err(|e| format!("invalid JSON: {}", e))
}

fn parse_filter(s: &str) -> Result<(String, Value), String> {
  let (field, value) = s
    .split_once('=')
    .ok_or_else(|| format!("expected field=value, got `{}`", s))?;
  if field.is_empty() {
    return Err("filter field must not be empty".to_string());
  }
  let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
  Ok((field.to_string(), value))
}

impl From<CliCommand> for app::Command {
  fn from(command: CliCommand) -> Self {
    match command {
      CliCommand::List {
        entity,
        page,
        page_size,
        filters,
        sort,
        desc,
        all_columns,
      } => app::Command::List {
        entity,
        page,
        page_size,
        filters: filters.into_iter().collect::<Filters>(),
        sort,
        desc,
        all_columns,
      },
      CliCommand::Show {
        entity,
        token,
        all_columns,
      } => app::Command::Show {
        entity,
        token,
        all_columns,
      },
      CliCommand::Create { entity, data } => app::Command::Create { entity, data },
      CliCommand::Update { entity, data } => app::Command::Update { entity, data },
      CliCommand::Delete { entity, token, yes } => app::Command::Delete { entity, token, yes },
      CliCommand::Call {
        entity,
        method,
        args,
      } => app::Command::Call {
        entity,
        method,
        args,
      },
    }
  }
}

/// Log to stderr, or to daily files when a directory is configured.
///
/// The level comes from CRUDKIT_LOG (default `warn`).
fn init_logging(dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env("CRUDKIT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));

  match dir {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let appender = tracing_appender::rolling::daily(dir, "crudkit.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      Ok(None)
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = config::Config::load(args.config.as_deref())?;
  let _guard = init_logging(config.log.dir.as_deref())?;

  let app = app::App::new(config)?;
  app.run(args.command.into()).await?;

  Ok(())
}
