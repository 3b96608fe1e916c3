//! Concurrent HTTP transfer engine: download and multipart-upload
//! coordinators with progress/pause/resume event streams.
//!
//! The two entry points are [`downloader::Downloader`] and
//! [`uploader::Uploader`]. Each owns a batch of transfer records, runs a
//! single-writer actor that serializes every state mutation (commands and
//! HTTP-task callbacks alike), and exposes that batch's lifecycle as a
//! two-level event stream (per-unit streams multiplexed under one aggregate
//! stream).

pub mod descriptor;
pub mod downloader;
pub mod error;
pub mod events;
pub mod reachability;
pub mod rest;
pub mod throttle;
pub mod uploader;

mod gate;
mod http_task;
mod record;

pub use descriptor::{CachePolicy, DownloadDescriptor, UploadDescriptor, UploadPayload};
pub use downloader::Downloader;
pub use error::{TransferError, TransferResult};
pub use events::{AggregateEvent, AggregateEventStream, TransferInfo, UnitEvent, UnitEventStream};
pub use reachability::{AlwaysOnline, ReachabilityEvent, ReachabilityObserver, ReachabilityProbe};
pub use rest::{CookieStorage, RawResponse, RestClient, RestDescriptor};
pub use throttle::ProgressThrottle;
pub use uploader::Uploader;
