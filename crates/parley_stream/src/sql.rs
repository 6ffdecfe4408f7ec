#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::{StreamBackend, StreamError, StreamRecord};

/// Stream log persisted in SQLite or Postgres.
///
/// Each topic is a single ordered partition; the row id is the offset.
#[derive(Clone)]
pub struct PersistentStreamBackend {
	backend: PersistentBackend,
}

#[derive(Clone)]
enum PersistentBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl PersistentStreamBackend {
	pub async fn connect(database_url: &str) -> Result<Self, StreamError> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await?;
			Self::from_sqlite_pool(pool).await
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await?;
			let mut migrator = sqlx::migrate!("migrations/postgres");
			migrator.set_ignore_missing(true);
			migrator.run(&pool).await?;
			info!("stream log ready (postgres)");
			Ok(Self {
				backend: PersistentBackend::Postgres(pool),
			})
		} else {
			Err(StreamError::UnsupportedUrl)
		}
	}

	/// Use an existing SQLite pool (migrations are applied).
	pub async fn from_sqlite_pool(pool: sqlx::SqlitePool) -> Result<Self, StreamError> {
		let mut migrator = sqlx::migrate!("migrations/sqlite");
		migrator.set_ignore_missing(true);
		migrator.run(&pool).await?;
		info!("stream log ready (sqlite)");
		Ok(Self {
			backend: PersistentBackend::Sqlite(pool),
		})
	}
}

#[async_trait::async_trait]
impl StreamBackend for PersistentStreamBackend {
	async fn append(&self, topic: &str, payloads: Vec<Vec<u8>>) -> Result<i64, StreamError> {
		let mut last = 0;
		match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await?;
				for payload in payloads {
					let res = sqlx::query(
						"INSERT INTO stream_records (topic, payload, created_at) VALUES (?, ?, strftime('%s','now'))",
					)
					.bind(topic)
					.bind(payload)
					.execute(&mut *tx)
					.await?;
					last = res.last_insert_rowid();
				}
				tx.commit().await?;
			}
			PersistentBackend::Postgres(pool) => {
				let mut tx = pool.begin().await?;
				for payload in payloads {
					let (id,): (i64,) =
						sqlx::query_as("INSERT INTO stream_records (topic, payload) VALUES ($1, $2) RETURNING id")
							.bind(topic)
							.bind(payload)
							.fetch_one(&mut *tx)
							.await?;
					last = id;
				}
				tx.commit().await?;
			}
		}
		Ok(last)
	}

	async fn read_after(&self, topic: &str, after: i64, limit: usize) -> Result<Vec<StreamRecord>, StreamError> {
		let limit = i64::try_from(limit).unwrap_or(i64::MAX);
		let rows: Vec<(i64, Vec<u8>)> = match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				sqlx::query_as(
					"SELECT id, payload FROM stream_records WHERE topic = ? AND id > ? ORDER BY id ASC LIMIT ?",
				)
				.bind(topic)
				.bind(after)
				.bind(limit)
				.fetch_all(pool)
				.await?
			}
			PersistentBackend::Postgres(pool) => {
				sqlx::query_as(
					"SELECT id, payload FROM stream_records WHERE topic = $1 AND id > $2 ORDER BY id ASC LIMIT $3",
				)
				.bind(topic)
				.bind(after)
				.bind(limit)
				.fetch_all(pool)
				.await?
			}
		};

		Ok(rows
			.into_iter()
			.map(|(offset, payload)| StreamRecord {
				topic: topic.to_string(),
				offset,
				payload,
			})
			.collect())
	}

	async fn committed_offset(&self, topic: &str, group_id: &str) -> Result<i64, StreamError> {
		let row: Option<(i64,)> = match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT committed_offset FROM stream_offsets WHERE topic = ? AND group_id = ?")
					.bind(topic)
					.bind(group_id)
					.fetch_optional(pool)
					.await?
			}
			PersistentBackend::Postgres(pool) => {
				sqlx::query_as("SELECT committed_offset FROM stream_offsets WHERE topic = $1 AND group_id = $2")
					.bind(topic)
					.bind(group_id)
					.fetch_optional(pool)
					.await?
			}
		};
		Ok(row.map(|(o,)| o).unwrap_or(0))
	}

	async fn commit(&self, topic: &str, group_id: &str, offset: i64) -> Result<(), StreamError> {
		match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO stream_offsets (topic, group_id, committed_offset) VALUES (?, ?, ?) \
					ON CONFLICT(topic, group_id) DO UPDATE SET committed_offset = MAX(committed_offset, excluded.committed_offset)",
				)
				.bind(topic)
				.bind(group_id)
				.bind(offset)
				.execute(pool)
				.await?;
			}
			PersistentBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO stream_offsets (topic, group_id, committed_offset) VALUES ($1, $2, $3) \
					ON CONFLICT (topic, group_id) DO UPDATE SET committed_offset = GREATEST(stream_offsets.committed_offset, EXCLUDED.committed_offset)",
				)
				.bind(topic)
				.bind(group_id)
				.bind(offset)
				.execute(pool)
				.await?;
			}
		}
		Ok(())
	}

	async fn acquire_lease(&self, topic: &str, group_id: &str, member: &str, ttl: Duration) -> Result<bool, StreamError> {
		// Lease clocks are wall-clock milliseconds; members on different hosts need roughly synced clocks.
		let now = epoch_millis();
		let expires_at = now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
		let res = match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO stream_leases (topic, group_id, owner, expires_at_ms) VALUES (?, ?, ?, ?) \
					ON CONFLICT(topic, group_id) DO UPDATE SET owner = excluded.owner, expires_at_ms = excluded.expires_at_ms \
					WHERE stream_leases.owner = excluded.owner OR stream_leases.expires_at_ms <= ?",
				)
				.bind(topic)
				.bind(group_id)
				.bind(member)
				.bind(expires_at)
				.bind(now)
				.execute(pool)
				.await?
				.rows_affected()
			}
			PersistentBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO stream_leases (topic, group_id, owner, expires_at_ms) VALUES ($1, $2, $3, $4) \
					ON CONFLICT (topic, group_id) DO UPDATE SET owner = EXCLUDED.owner, expires_at_ms = EXCLUDED.expires_at_ms \
					WHERE stream_leases.owner = EXCLUDED.owner OR stream_leases.expires_at_ms <= $5",
				)
				.bind(topic)
				.bind(group_id)
				.bind(member)
				.bind(expires_at)
				.bind(now)
				.execute(pool)
				.await?
				.rows_affected()
			}
		};
		Ok(res > 0)
	}

	async fn release_lease(&self, topic: &str, group_id: &str, member: &str) -> Result<(), StreamError> {
		match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				sqlx::query("DELETE FROM stream_leases WHERE topic = ? AND group_id = ? AND owner = ?")
					.bind(topic)
					.bind(group_id)
					.bind(member)
					.execute(pool)
					.await?;
			}
			PersistentBackend::Postgres(pool) => {
				sqlx::query("DELETE FROM stream_leases WHERE topic = $1 AND group_id = $2 AND owner = $3")
					.bind(topic)
					.bind(group_id)
					.bind(member)
					.execute(pool)
					.await?;
			}
		}
		Ok(())
	}
}

fn epoch_millis() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
		.unwrap_or(0)
}
