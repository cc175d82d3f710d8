//! # audiodock
//!
//! A download manager and playback queue engine for remote audio.
//!
//! ## Features
//!
//! - **Download lifecycle**: concurrent transfers tracked from link
//!   resolution through pause/resume to durable completion records
//! - **Playback queue**: insert-next-to-current ordering, exhaustion-based
//!   shuffle, three repeat modes, pending items resolved out-of-band
//! - **Crash-safe persistence**: atomic replace-on-write JSON documents;
//!   corrupt state loads as empty instead of failing startup
//! - **Typed events**: one broadcast bus decouples both engines from
//!   their observers
//! - **Async**: built on Tokio; every public operation returns
//!   immediately and reports outcomes through events
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use audiodock::{
//!     Config, DownloadManager, DownloadRequest, EventBus, HttpTransfer,
//!     JsonStore, PlaylistEngine,
//! };
//!
//! # async fn run(
//! #     resolver: Arc<dyn audiodock::LinkResolver>,
//! #     driver: Arc<dyn audiodock::PlaybackDriver>,
//! # ) -> audiodock::Result<()> {
//! let config = Config::default();
//! let events = EventBus::new(config.event_capacity);
//! let store = Arc::new(JsonStore::open(config.data_dir.clone()).await?);
//! let transfer = Arc::new(HttpTransfer::new(&config)?);
//!
//! let downloads = DownloadManager::new(
//!     config.clone(), resolver, transfer, Arc::clone(&store), events.clone(),
//! ).await?;
//! let playlist = PlaylistEngine::new(&config, driver, store, events.clone()).await?;
//!
//! downloads.start(
//!     DownloadRequest {
//!         track_id: "dQw4w9WgXcQ".into(),
//!         title: "Some Song".into(),
//!         owner: "Some Channel".into(),
//!         thumbnail: None,
//!     },
//!     None,
//! )?;
//!
//! let mut rx = events.subscribe();
//! while let Ok(event) = rx.recv().await {
//!     println!("event: {:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

// Modules
pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod playback;
pub mod playlist;
pub mod resolver;
pub mod store;
pub mod transfer;
pub mod types;

// Re-exports for convenience
pub use config::{Config, MIN_ARTIFACT_SIZE};
pub use download::{
    DownloadManager, DownloadRecord, DownloadRequest, FailedDownload, OnComplete, TaskSnapshot,
    TaskStatus,
};
pub use error::{Error, Result};
pub use events::{Event, EventBus};
pub use playback::{PlaybackDriver, PlaybackSignal};
pub use playlist::{PlaylistEngine, PlaylistItem, RepeatMode};
pub use resolver::LinkResolver;
pub use store::JsonStore;
pub use transfer::{
    HttpTransfer, ProgressFn, ResumeToken, TransferExecutor, TransferOutcome,
};
pub use types::{InstanceId, TrackId};
