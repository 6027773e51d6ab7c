//! Ingestd-DB: Catalog schema, migrations, and query operations
//!
//! The catalog is the only state shared between worker servers. This crate
//! keeps it in SQLite, accessed through rusqlite with r2d2 connection
//! pooling.
//!
//! # Modules
//!
//! - `migrations` - Embedded schema migrations
//! - `pool` - Connection pool management
//! - `models` - Rust models matching the catalog schema
//! - `queries` - Catalog query operations
//!
//! # Example
//!
//! ```no_run
//! use ingestd_db::pool::{init_pool, get_conn, PoolOptions};
//! use ingestd_db::queries::artifacts;
//! use ingestd_common::ArtifactId;
//!
//! let pool = init_pool("/var/lib/ingestd/catalog.sqlite", PoolOptions::default()).unwrap();
//! let conn = get_conn(&pool).unwrap();
//!
//! if let Some(artifact) = artifacts::get_artifact(&conn, ArtifactId::new(42)).unwrap() {
//!     println!("artifact {} is {}", artifact.id, artifact.process_state);
//! }
//! ```

pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;

pub use models::{from_db_time, to_db_time};
