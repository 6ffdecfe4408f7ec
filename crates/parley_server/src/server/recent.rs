#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use tokio::sync::Mutex;

/// Storage of the newest-first window.
#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
	/// Prepend `payload` and trim the window to `max_records`, atomically.
	async fn push(&self, payload: Vec<u8>, max_records: usize) -> anyhow::Result<()>;

	/// Up to `count` payloads, newest first.
	async fn read_newest(&self, count: usize) -> anyhow::Result<Vec<Vec<u8>>>;
}

#[derive(Debug, Default)]
pub struct InMemoryCacheBackend {
	window: Mutex<VecDeque<Vec<u8>>>,
}

#[async_trait::async_trait]
impl CacheBackend for InMemoryCacheBackend {
	async fn push(&self, payload: Vec<u8>, max_records: usize) -> anyhow::Result<()> {
		let mut window = self.window.lock().await;
		window.push_front(payload);
		window.truncate(max_records);
		Ok(())
	}

	async fn read_newest(&self, count: usize) -> anyhow::Result<Vec<Vec<u8>>> {
		let window = self.window.lock().await;
		Ok(window.iter().take(count).cloned().collect())
	}
}

/// Window persisted in SQLite or Postgres, partitioned by a cache key.
#[derive(Clone)]
pub struct PersistentCacheBackend {
	backend: PersistentBackend,
	cache_key: String,
}

#[derive(Clone)]
enum PersistentBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl PersistentCacheBackend {
	pub async fn connect(database_url: &str, cache_key: impl Into<String>) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			Self::from_sqlite_pool(pool, cache_key).await
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			let mut migrator = sqlx::migrate!("migrations/postgres");
			migrator.set_ignore_missing(true);
			migrator.run(&pool).await.context("run postgres migrations")?;

			Ok(Self {
				backend: PersistentBackend::Postgres(pool),
				cache_key: cache_key.into(),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	pub async fn from_sqlite_pool(pool: sqlx::SqlitePool, cache_key: impl Into<String>) -> anyhow::Result<Self> {
		let mut migrator = sqlx::migrate!("migrations/sqlite");
		migrator.set_ignore_missing(true);
		migrator.run(&pool).await.context("run sqlite migrations")?;

		Ok(Self {
			backend: PersistentBackend::Sqlite(pool),
			cache_key: cache_key.into(),
		})
	}
}

#[async_trait::async_trait]
impl CacheBackend for PersistentCacheBackend {
	async fn push(&self, payload: Vec<u8>, max_records: usize) -> anyhow::Result<()> {
		let keep = i64::try_from(max_records).unwrap_or(i64::MAX);
		match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;
				sqlx::query("INSERT INTO recent_messages (cache_key, payload) VALUES (?, ?)")
					.bind(&self.cache_key)
					.bind(payload)
					.execute(&mut *tx)
					.await
					.context("insert recent message (sqlite)")?;
				sqlx::query(
					"DELETE FROM recent_messages WHERE cache_key = ? AND id NOT IN \
					(SELECT id FROM recent_messages WHERE cache_key = ? ORDER BY id DESC LIMIT ?)",
				)
				.bind(&self.cache_key)
				.bind(&self.cache_key)
				.bind(keep)
				.execute(&mut *tx)
				.await
				.context("trim recent messages (sqlite)")?;
				tx.commit().await.context("commit sqlite tx")?;
			}
			PersistentBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;
				sqlx::query("INSERT INTO recent_messages (cache_key, payload) VALUES ($1, $2)")
					.bind(&self.cache_key)
					.bind(payload)
					.execute(&mut *tx)
					.await
					.context("insert recent message (postgres)")?;
				sqlx::query(
					"DELETE FROM recent_messages WHERE cache_key = $1 AND id NOT IN \
					(SELECT id FROM recent_messages WHERE cache_key = $1 ORDER BY id DESC LIMIT $2)",
				)
				.bind(&self.cache_key)
				.bind(keep)
				.execute(&mut *tx)
				.await
				.context("trim recent messages (postgres)")?;
				tx.commit().await.context("commit postgres tx")?;
			}
		}
		Ok(())
	}

	async fn read_newest(&self, count: usize) -> anyhow::Result<Vec<Vec<u8>>> {
		let limit = i64::try_from(count).unwrap_or(i64::MAX);
		let rows: Vec<(Vec<u8>,)> = match &self.backend {
			PersistentBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT payload FROM recent_messages WHERE cache_key = ? ORDER BY id DESC LIMIT ?",
			)
			.bind(&self.cache_key)
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("select recent messages (sqlite)")?,
			PersistentBackend::Postgres(pool) => sqlx::query_as(
				"SELECT payload FROM recent_messages WHERE cache_key = $1 ORDER BY id DESC LIMIT $2",
			)
			.bind(&self.cache_key)
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("select recent messages (postgres)")?,
		};
		Ok(rows.into_iter().map(|(p,)| p).collect())
	}
}

/// Bounded, insertion-ordered window of the newest serialized messages.
#[derive(Clone)]
pub struct RecentMessageCache {
	backend: Arc<dyn CacheBackend>,
	max_records: usize,
}

impl RecentMessageCache {
	pub fn new_in_memory(max_records: usize) -> Self {
		Self::new(Arc::new(InMemoryCacheBackend::default()), max_records)
	}

	pub fn new(backend: Arc<dyn CacheBackend>, max_records: usize) -> Self {
		Self { backend, max_records }
	}

	pub fn max_records(&self) -> usize {
		self.max_records
	}

	pub async fn push(&self, payload: Vec<u8>) -> anyhow::Result<()> {
		self.backend.push(payload, self.max_records).await
	}

	/// Up to `head_size` newest payloads in chronological order.
	pub async fn read_recent(&self, head_size: usize) -> anyhow::Result<Vec<Vec<u8>>> {
		let count = head_size.min(self.max_records);
		if count == 0 {
			return Ok(Vec::new());
		}
		let mut payloads = self.backend.read_newest(count).await?;
		payloads.reverse();
		Ok(payloads)
	}
}
