use crate::config::{CacheBackend, Config, EntityConfig};
use crate::render;
use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use crudkit::table::{self, ActionCapabilities, TableData, TableOptions};
use crudkit::{
  AutoConfirm, ConfirmRequest, Confirmer, Crud, CrudError, CrudFactory, CrudOptions, EntityService,
  Filters, HttpEntityService, LogNavigator, MutationOutcome, Notifier, Pagination, QueryCacheStore,
  Route, SortOrder, SqliteStorage,
};
use serde_json::Value;
use std::io::{BufRead, Write};
use std::sync::Arc;
use tracing::{debug, info};

type Service = HttpEntityService<Value>;

/// Prints notifications to stderr, keeping stdout for data.
struct TerminalNotifier;

impl Notifier for TerminalNotifier {
  fn success(&self, message: &str) {
    eprintln!("✓ {}", message);
  }

  fn error(&self, message: &str) {
    eprintln!("✗ {}", message);
  }
}

/// Asks on the terminal; anything but `y`/`yes` declines.
struct TerminalConfirmer;

#[async_trait]
impl Confirmer for TerminalConfirmer {
  async fn confirm(&self, request: ConfirmRequest) -> bool {
    let answer = tokio::task::spawn_blocking(move || {
      let mut stderr = std::io::stderr();
      let _ = write!(
        stderr,
        "{}\n{} [{}/{}] ",
        request.title, request.body, request.confirm_label, request.cancel_label
      );
      let _ = stderr.flush();

      let mut line = String::new();
      std::io::stdin().lock().read_line(&mut line).map(|_| line)
    })
    .await;

    match answer {
      Ok(Ok(line)) => matches!(line.trim().to_lowercase().as_str(), "y" | "yes"),
      _ => false,
    }
  }
}

/// What the user asked for on the command line.
#[derive(Debug, Clone)]
pub enum Command {
  List {
    entity: String,
    page: u32,
    page_size: u32,
    filters: Filters,
    sort: Option<String>,
    desc: bool,
    all_columns: bool,
  },
  Show {
    entity: String,
    token: String,
    all_columns: bool,
  },
  Create {
    entity: String,
    data: Value,
  },
  Update {
    entity: String,
    data: Value,
  },
  Delete {
    entity: String,
    token: String,
    yes: bool,
  },
  Call {
    entity: String,
    method: String,
    args: Value,
  },
}

/// Runs commands against the configured backend.
pub struct App {
  config: Config,
  client: reqwest::Client,
  store: Arc<QueryCacheStore>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let token = Config::get_api_token();
    let client = crudkit::http::build_client(token.as_deref(), config.timeout())?;

    let store = match config.cache.backend {
      CacheBackend::Memory => QueryCacheStore::in_memory(),
      CacheBackend::Sqlite => {
        let storage = match &config.cache.path {
          Some(path) => SqliteStorage::open_at(path)?,
          None => SqliteStorage::open()?,
        };
        QueryCacheStore::new(storage)
      }
    };
    debug!(backend = ?config.cache.backend, "cache ready");

    Ok(Self {
      config,
      client,
      store: Arc::new(store),
    })
  }

  fn factory(&self, name: &str, assume_yes: bool) -> Result<CrudFactory<Value, Service>> {
    let entity = self.config.entity(name)?;
    let service = HttpEntityService::new(
      self.client.clone(),
      &self.config.api.base_url,
      &entity.path,
      entity.identifier_fields.clone(),
    )?;

    let confirmer: Arc<dyn Confirmer> = if assume_yes {
      Arc::new(AutoConfirm(true))
    } else {
      Arc::new(TerminalConfirmer)
    };

    Ok(
      CrudFactory::new(name, Arc::new(service), self.store.clone())
        .preset(entity.preset)
        .notifier(Arc::new(TerminalNotifier))
        .confirmer(confirmer)
        .navigator(Arc::new(LogNavigator))
        .custom_method("count", count_matching),
    )
  }

  fn table(entity: &EntityConfig) -> TableData {
    table::build(
      entity.columns.clone(),
      TableOptions {
        include_audit_fields: entity.include_audit_fields,
        enable_selection: false,
        actions: ActionCapabilities::default(),
      },
    )
  }

  pub async fn run(&self, command: Command) -> Result<()> {
    match command {
      Command::List {
        entity,
        page,
        page_size,
        filters,
        sort,
        desc,
        all_columns,
      } => {
        let mut pagination = Pagination::new(page, page_size);
        pagination.sort_by = sort;
        pagination.sort_order = if desc { SortOrder::Desc } else { SortOrder::Asc };

        let crud = self
          .factory(&entity, false)?
          .mount(
            CrudOptions::table()
              .with_filters(filters)
              .with_pagination(pagination)
              .with_auto_load(true),
          )
          .await?;
        surface(&crud)?;

        let table = Self::table(self.config.entity(&entity)?);
        match crud.page() {
          Some(page) => {
            println!("{}", render::render_table(&table, &page.items, all_columns, false));
            println!("{}", render::page_footer(&page));
          }
          None => println!("No results"),
        }
      }

      Command::Show {
        entity,
        token,
        all_columns,
      } => {
        let route = Route::new(format!("/{}/{}", entity, token), Some(token));
        let crud = self
          .factory(&entity, false)?
          .mount(CrudOptions::page(route).with_auto_load(true))
          .await?;
        surface(&crud)?;

        let item = crud
          .selected_item()
          .ok_or_else(|| eyre!("{} not found", entity))?;
        let table = Self::table(self.config.entity(&entity)?);
        println!("{}", render::render_record(&table, &item, all_columns));
      }

      Command::Create { entity, data } => {
        let crud = self.mount_quiet(&entity, false).await?;
        let response = crud.create(&data).await?;
        print_data(response.data)?;
      }

      Command::Update { entity, data } => {
        let crud = self.mount_quiet(&entity, false).await?;
        let response = crud.update(&data).await?;
        print_data(response.data)?;
      }

      Command::Delete { entity, token, yes } => {
        let crud = self.mount_quiet(&entity, yes).await?;
        let id = crudkit::decode(crud.descriptor().identifier_fields(), &token);
        let item = crud
          .get_by_id(&id)
          .await?
          .ok_or_else(|| eyre!("{} `{}` not found", entity, token))?;

        match crud.delete_item(&item).await? {
          MutationOutcome::Declined => eprintln!("Cancelled"),
          MutationOutcome::Completed(_) => info!(entity = %entity, token = %token, "deleted"),
        }
      }

      Command::Call {
        entity,
        method,
        args,
      } => {
        let crud = self.mount_quiet(&entity, false).await?;
        let result = crud.call(&method, args).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
      }
    }
    Ok(())
  }

  /// A list facade that does not fetch until asked to.
  async fn mount_quiet(&self, entity: &str, assume_yes: bool) -> Result<Crud<Value>> {
    let crud = self
      .factory(entity, assume_yes)?
      .mount(CrudOptions::list().with_auto_load(false))
      .await?;
    Ok(crud)
  }
}

/// `count` custom method: total rows matching the filters given as args.
async fn count_matching(service: Arc<Service>, args: Value) -> crudkit::Result<Value> {
  let filters: Filters = match args {
    Value::Null => Filters::new(),
    other => serde_json::from_value(other)?,
  };
  let page = EntityService::<Value>::search(service.as_ref(), &filters, &Pagination::new(1, 1)).await?;
  Ok(Value::from(page.total_count))
}

/// Turn a failure recorded by the facade into the command's error.
fn surface(crud: &Crud<Value>) -> Result<(), CrudError> {
  match crud.error() {
    Some(err) => Err(err),
    None => Ok(()),
  }
}

fn print_data(data: Option<Value>) -> Result<()> {
  if let Some(data) = data {
    println!("{}", serde_json::to_string_pretty(&data)?);
  }
  Ok(())
}
