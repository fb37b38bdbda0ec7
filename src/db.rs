use std::{collections::BTreeSet, future::Future, path::Path, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use surrealdb::engine::local::{Db, Mem, SurrealKv};
use surrealdb::types::SurrealValue;
use surrealdb::Surreal;
use tracing::warn;

use crate::{
	catalog::{CatalogError, CatalogStore},
	models::{FileKey, FileRecord},
};

const MUTATION_ATTEMPTS: u32 = 4;
const RETRY_BACKOFF: Duration = Duration::from_millis(25);

/// Wrapper around the SurrealDB handle.
/// Clone is cheap (Arc internally).
#[derive(Clone)]
pub struct DbHandle {
	pub db: Surreal<Db>,
}

/// Open (or create) the on-disk catalog at `path` and run migrations.
pub async fn init(path: &Path) -> Result<DbHandle, CatalogError> {
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)
			.map_err(|e| CatalogError::Unavailable(format!("{}: {e}", parent.display())))?;
	}
	let db = Surreal::new::<SurrealKv>(path.to_path_buf())
		.await
		.map_err(unavailable)?;
	prepare(db).await
}

/// In-process catalog that lives as long as the handle.
pub async fn init_memory() -> Result<DbHandle, CatalogError> {
	let db = Surreal::new::<Mem>(()).await.map_err(unavailable)?;
	prepare(db).await
}

async fn prepare(db: Surreal<Db>) -> Result<DbHandle, CatalogError> {
	db.use_ns("stash").use_db("stash").await.map_err(unavailable)?;
	run_migrations(&db).await.map_err(unavailable)?;
	Ok(DbHandle { db })
}

/// Run schema migrations. DEFINE statements are idempotent.
async fn run_migrations(db: &Surreal<Db>) -> Result<(), surrealdb::Error> {
	db.query(SCHEMA_V1).await?.check()?;
	Ok(())
}

fn unavailable(e: surrealdb::Error) -> CatalogError {
	CatalogError::Unavailable(e.to_string())
}

#[derive(Debug, Clone, SurrealValue)]
struct KeyRow {
	folder: String,
	name: String,
}

#[derive(Debug, Clone, SurrealValue)]
struct RecordRow {
	folder: String,
	name: String,
	owner: String,
	discovered_at: String,
}

impl RecordRow {
	fn into_record(self) -> Result<FileRecord, CatalogError> {
		let discovered_at = parse_datetime(&self.discovered_at)?;
		let key = FileKey::new(self.folder, self.name);
		Ok(FileRecord {
			id: key.record_key(),
			folder: key.folder,
			name: key.name,
			owner: self.owner,
			discovered_at,
		})
	}
}

/// Accepts both a bare RFC 3339 string and SurrealQL's `d'...'` literal form.
fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, CatalogError> {
	let trimmed = raw
		.strip_prefix("d'")
		.or_else(|| raw.strip_prefix("d\""))
		.map(|s| s.trim_end_matches(['\'', '"']))
		.unwrap_or(raw);
	DateTime::parse_from_rfc3339(trimmed)
		.map(|d| d.with_timezone(&Utc))
		.map_err(|e| CatalogError::Decode(format!("discovered_at {raw:?}: {e}")))
}

/// Run an idempotent mutation, retrying transient failures such as
/// optimistic transaction conflicts between concurrent writers.
async fn retry_idempotent<F, Fut>(op: &'static str, key: &FileKey, mut attempt_op: F) -> Result<(), CatalogError>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<(), surrealdb::Error>>,
{
	let mut attempt = 1;
	loop {
		match attempt_op().await {
			Ok(()) => return Ok(()),
			Err(e) if attempt < MUTATION_ATTEMPTS => {
				warn!(op, %key, attempt, error = %e, "catalog mutation failed, retrying");
				tokio::time::sleep(RETRY_BACKOFF * attempt).await;
				attempt += 1;
			}
			Err(e) => return Err(unavailable(e)),
		}
	}
}

impl DbHandle {
	async fn try_insert(&self, key: &FileKey, owner: &str) -> Result<(), surrealdb::Error> {
		self.db
			.query(
				"INSERT IGNORE INTO catalog_entry {
                    id: $key,
                    folder: $folder,
                    name: $name,
                    owner: $owner,
                    discovered_at: time::now(),
                }",
			)
			.bind(("key", key.record_key()))
			.bind(("folder", key.folder.clone()))
			.bind(("name", key.name.clone()))
			.bind(("owner", owner.to_string()))
			.await?
			.check()?;
		Ok(())
	}

	async fn try_delete(&self, key: &FileKey) -> Result<(), surrealdb::Error> {
		self.db
			.query("DELETE type::record('catalog_entry', $key)")
			.bind(("key", key.record_key()))
			.await?
			.check()?;
		Ok(())
	}

	async fn select_records(&self, owner: Option<&str>) -> Result<Vec<FileRecord>, CatalogError> {
		let query = match owner {
			Some(_) => {
				"SELECT folder, name, owner, <string> discovered_at AS discovered_at
                 FROM catalog_entry WHERE owner = $owner"
			}
			None => "SELECT folder, name, owner, <string> discovered_at AS discovered_at FROM catalog_entry",
		};
		let mut response = self
			.db
			.query(query)
			.bind(("owner", owner.unwrap_or_default().to_string()))
			.await
			.map_err(unavailable)?;

		let rows: Vec<RecordRow> = response.take(0).map_err(unavailable)?;
		rows.into_iter().map(RecordRow::into_record).collect()
	}
}

#[async_trait]
impl CatalogStore for DbHandle {
	async fn insert_if_absent(&self, key: &FileKey, owner: &str) -> Result<(), CatalogError> {
		retry_idempotent("insert", key, || self.try_insert(key, owner)).await
	}

	async fn delete_if_present(&self, key: &FileKey) -> Result<(), CatalogError> {
		retry_idempotent("delete", key, || self.try_delete(key)).await
	}

	async fn list_all(&self) -> Result<BTreeSet<FileKey>, CatalogError> {
		let mut response = self
			.db
			.query("SELECT folder, name FROM catalog_entry")
			.await
			.map_err(unavailable)?;

		let rows: Vec<KeyRow> = response.take(0).map_err(unavailable)?;
		Ok(rows.into_iter().map(|r| FileKey::new(r.folder, r.name)).collect())
	}

	async fn find_owner(&self, key: &FileKey) -> Result<Option<String>, CatalogError> {
		let mut response = self
			.db
			.query("SELECT owner FROM type::record('catalog_entry', $key)")
			.bind(("key", key.record_key()))
			.await
			.map_err(unavailable)?;

		response.take("owner").map_err(unavailable)
	}

	async fn list_owned(&self, owner: &str) -> Result<Vec<FileRecord>, CatalogError> {
		let mut records = self.select_records(Some(owner)).await?;
		records.sort_by(|a, b| b.discovered_at.cmp(&a.discovered_at).then_with(|| a.key().cmp(&b.key())));
		Ok(records)
	}

	async fn list_records(&self) -> Result<Vec<FileRecord>, CatalogError> {
		let mut records = self.select_records(None).await?;
		records.sort_by_key(FileRecord::key);
		Ok(records)
	}
}

const SCHEMA_V1: &str = "
    DEFINE TABLE OVERWRITE catalog_entry SCHEMAFULL;
    DEFINE FIELD OVERWRITE folder ON catalog_entry TYPE string;
    DEFINE FIELD OVERWRITE name ON catalog_entry TYPE string;
    DEFINE FIELD OVERWRITE owner ON catalog_entry TYPE string;
    DEFINE FIELD OVERWRITE discovered_at ON catalog_entry TYPE datetime;
    DEFINE INDEX OVERWRITE idx_catalog_key ON catalog_entry FIELDS folder, name UNIQUE;
    DEFINE INDEX OVERWRITE idx_catalog_owner ON catalog_entry FIELDS owner;
";
