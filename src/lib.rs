//! # lablink
//!
//! Ingestion service for clinical-chemistry and hematology analyzers.
//! Listens on one TCP port per instrument, speaks its wire protocol
//! (ASTM E1394 and vendor dialects, HL7 v2 over MLLP, a proprietary LIS
//! dialect, or XML-framed POCT1-A), normalizes messages into patient and
//! result records, persists them in SQLite, and forwards unsynced
//! records to a remote HTTP endpoint on a configurable schedule.
//!
//! ## Example
//!
//! ```no_run
//! use lablink::config::{AnalyzerType, ListenerConfig, ProtocolKind, SyncConfig};
//! use lablink::io::ListenerManager;
//! use lablink::model::NullObserver;
//! use lablink::store::SqliteStore;
//! use lablink::sync::SyncEngine;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> lablink::Result<()> {
//!     let store = Arc::new(SqliteStore::open("lablink.db")?);
//!     let engine = Arc::new(SyncEngine::new(
//!         SyncConfig::new("https://lis.example.org", "lab-01"),
//!         store.clone(),
//!     )?);
//!     engine.start().await;
//!
//!     let mut listeners = ListenerManager::new(store, Arc::new(NullObserver));
//!     listeners.set_sync_trigger(engine.realtime_trigger());
//!     listeners
//!         .start(&[ListenerConfig {
//!             port: 5100,
//!             analyzer: AnalyzerType::SysmexXn,
//!             protocol: ProtocolKind::Astm,
//!             name: "xn-550".to_string(),
//!         }])
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     listeners.stop().await;
//!     engine.stop().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod io;
pub mod model;
pub mod protocol;
pub mod scattergram;
pub mod store;
pub mod sync;

pub use config::{AnalyzerType, ListenerConfig, ProtocolKind, SyncConfig, SyncMode};
pub use error::{LinkError, Result};
pub use io::ListenerManager;
pub use model::{LinkObserver, PatientRecord, ResultRecord, ResultValue, SyncStatus};
pub use protocol::Parser;
pub use scattergram::ScatterGrid;
pub use store::{ResultStore, SqliteStore};
pub use sync::SyncEngine;
