use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

/// Database connection wrapper shared by the cache and queue stores.
pub struct Database {
  conn: Connection,
}

impl Database {
  /// Open or create a database file, running the given migrations.
  pub fn open(path: &Path, schema: &str) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    let db = Self { conn };
    db.run_migrations(schema)?;

    Ok(db)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory(schema: &str) -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

    let db = Self { conn };
    db.run_migrations(schema)?;

    Ok(db)
  }

  /// Get the default data directory
  pub fn default_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("innkeep"))
  }

  /// Run database migrations
  fn run_migrations(&self, schema: &str) -> Result<()> {
    self
      .conn
      .execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
      .map_err(|e| eyre!("Failed to configure database: {}", e))?;
    self
      .conn
      .execute_batch(schema)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Take ownership of the connection
  pub fn into_conn(self) -> Connection {
    self.conn
  }
}
