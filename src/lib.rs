//! Entity-agnostic CRUD data access.
//!
//! Features plug in an [`EntityService`] and get a cached, paginated and
//! filtered listing, optimistic create/update/delete with rollback,
//! single-entity resolution from a route (simple or composite keys) and
//! table column metadata.
//!
//! ```no_run
//! use std::sync::Arc;
//! use crudkit::{CrudFactory, CrudOptions, CachePreset, HttpEntityService, QueryCacheStore};
//!
//! # async fn demo() -> crudkit::Result<()> {
//! let client = crudkit::http::build_client(None, std::time::Duration::from_secs(30))?;
//! let users = HttpEntityService::<serde_json::Value>::new(
//!   client,
//!   "https://api.example.com",
//!   "users",
//!   vec!["id".to_string()],
//! )?;
//! let store = Arc::new(QueryCacheStore::in_memory());
//! let crud: crudkit::Crud<serde_json::Value> = CrudFactory::new("User", Arc::new(users), store)
//!   .preset(CachePreset::Dynamic)
//!   .mount(CrudOptions::table())
//!   .await?;
//! println!("{} users", crud.total_count());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod error;
pub mod facade;
pub mod factory;
pub mod http;
pub mod key;
pub mod mutation;
pub mod notify;
pub mod query;
pub mod resolver;
pub mod service;
pub mod table;

#[cfg(test)]
mod testing;

pub use cache::{CacheEntry, MemoryStorage, QueryCacheStore, QueryKey, SqliteStorage};
pub use error::{CrudError, Operation, Result};
pub use facade::{CacheTiming, Collaborators, Crud, CrudMode, CrudOptions};
pub use factory::{CachePreset, CrudFactory};
pub use http::HttpEntityService;
pub use key::{decode, encode, IdRecord};
pub use mutation::{MutationCoordinator, MutationOutcome};
pub use notify::{AutoConfirm, ConfirmRequest, Confirmer, Notifier, TracingNotifier};
pub use query::{Filters, Pagination, SortOrder};
pub use resolver::{LogNavigator, Navigator, ResolverState, Route, SingleEntityResolver};
pub use service::{Entity, EntityDescriptor, EntityService, SearchPage, ServiceResponse};
pub use table::{ColumnConfig, TableData, TableOptions};
