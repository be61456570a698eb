// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! tvtrack - episode tracking client library
//!
//! Background downloads and offline mode for a TV tracking server.
//!
//! # Core Modules
//!
//! - [`download`] - Persistent download queue with bounded concurrency
//! - [`transfer`] - Resumable single-file transfers over HTTP
//! - [`offline`] - Offline snapshot, local writes and sync on reconnect
//! - [`api`] - Tracking server API client
//! - [`assets`] - Content-addressed image cache
//! - [`store`] - Durable blob storage for service state
//! - [`config`] - Client configuration
//! - [`library`] - Helpers combining downloads with server data

pub mod api;
pub mod assets;
pub mod config;
pub mod download;
pub mod library;
pub mod locks;
pub mod observe;
pub mod offline;
pub mod store;
pub mod transfer;

pub use api::{ApiError, HttpApi, RemoteApi};
pub use assets::ImageCache;
pub use config::ClientConfig;
pub use download::{ItemKey, QueueOptions, TransferItem, TransferQueue, TransferStatus};
pub use observe::Subscription;
pub use offline::{OfflineReconciler, SyncReport};
pub use store::{BlobStore, FileStore, MemoryStore};
pub use transfer::{HttpTransport, MemoryTransport, Transport};
