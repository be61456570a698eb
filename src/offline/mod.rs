// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Offline mode: snapshot, local writes and sync on reconnect.
//!
//! ```text
//! online ──enter_offline_mode(items)──▶ offline
//!   ▲      fetch monitor/config/details     │  reads  → snapshot
//!   │                                        │  writes → snapshot + pending_sync
//!   └──────────leave_offline_mode()──────────┘
//!          push pending_sync, drop snapshot
//! ```

pub mod reconciler;
pub mod snapshot;

pub use reconciler::{OfflineReconciler, SyncReport};
pub use snapshot::{OfflineSnapshot, OFFLINE_BLOB};
