#![forbid(unsafe_code)]

use std::time::Instant;

use anyhow::Context as _;
use parley_domain::{UserId, Username};
use tracing::{debug, info};

/// Durable home of users and chat messages.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	async fn add_message(&self, user_id: UserId, text: &str) -> anyhow::Result<()>;

	/// Create a user row and return its newly issued id.
	async fn add_user(&self, username: &Username) -> anyhow::Result<UserId>;
}

/// SQLite or Postgres store, selected by the database URL scheme.
#[derive(Clone)]
pub struct SqlMessageStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl SqlMessageStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url)
				.await
				.context("connect sqlite store")?;
			Self::from_sqlite_pool(pool).await
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url)
				.await
				.context("connect postgres store")?;
			let mut migrator = sqlx::migrate!("migrations/postgres");
			migrator.set_ignore_missing(true);
			migrator.run(&pool).await.context("run postgres store migrations")?;
			info!("message store ready (postgres)");
			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			anyhow::bail!("unsupported store database_url (use sqlite: or postgres:)")
		}
	}

	/// Use an existing SQLite pool (migrations are applied).
	pub async fn from_sqlite_pool(pool: sqlx::SqlitePool) -> anyhow::Result<Self> {
		let mut migrator = sqlx::migrate!("migrations/sqlite");
		migrator.set_ignore_missing(true);
		migrator.run(&pool).await.context("run sqlite store migrations")?;
		info!("message store ready (sqlite)");
		Ok(Self {
			backend: SqlBackend::Sqlite(pool),
		})
	}
}

#[async_trait::async_trait]
impl MessageStore for SqlMessageStore {
	async fn add_message(&self, user_id: UserId, text: &str) -> anyhow::Result<()> {
		let start = Instant::now();
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("INSERT INTO messages (user_id, content) VALUES (?, ?)")
					.bind(user_id.get())
					.bind(text)
					.execute(pool)
					.await
					.context("insert message")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("INSERT INTO messages (user_id, content) VALUES ($1, $2)")
					.bind(user_id.get())
					.bind(text)
					.execute(pool)
					.await
					.context("insert message")?;
			}
		}
		debug!(%user_id, elapsed_ms = start.elapsed().as_millis() as u64, "message stored");
		Ok(())
	}

	async fn add_user(&self, username: &Username) -> anyhow::Result<UserId> {
		let start = Instant::now();
		let (id,): (i64,) = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("INSERT INTO users (username) VALUES (?) RETURNING user_id")
				.bind(username.as_str())
				.fetch_one(pool)
				.await
				.context("insert user")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("INSERT INTO users (username) VALUES ($1) RETURNING user_id")
				.bind(username.as_str())
				.fetch_one(pool)
				.await
				.context("insert user")?,
		};
		debug!(user_id = id, elapsed_ms = start.elapsed().as_millis() as u64, "user stored");
		Ok(UserId::new(id))
	}
}
