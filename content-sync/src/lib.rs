//! Consumer-side content synchronization for the Nexus host.
//!
//! Keeps locally cached views of articles and case studies consistent with
//! the authoritative content store. Changes arrive as signed webhooks
//! ([`webhook::WebhookProcessor`]) or are discovered by polling
//! ([`poller::DriftDetector`]); either way they flow through the
//! [`cache::InvalidationEngine`], which refreshes the cache and announces the
//! update on the [`bus::BroadcastBus`]. The [`monitor::Monitor`] watches every
//! stage through the records they emit.

pub mod bus;
pub mod cache;
pub mod config;
pub mod error;
pub mod monitor;
pub mod poller;
pub mod service;
pub mod source;
pub mod types;
pub mod verification;
pub mod webhook;

#[cfg(test)]
mod testing;

pub use cache::{ContentView, InvalidationEngine, ViewScope};
pub use config::SyncConfig;
pub use error::{FetchError, SyncError};
pub use service::ContentSync;
pub use source::{ContentFilter, ContentSource, HttpContentSource};
pub use types::{CacheUpdate, ChangeAction, ChangeEvent, ContentType, ProcessingResult};
