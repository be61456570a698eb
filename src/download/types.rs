// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transfer item types and the per-item state machine.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a queued episode. Stable for the item's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub show_id: u64,
    pub episode: u32,
}

impl ItemKey {
    pub fn new(show_id: u64, episode: u32) -> Self {
        Self { show_id, episode }
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tv{}-ep{}", self.show_id, self.episode)
    }
}

impl FromStr for ItemKey {
    type Err = String;

    /// Parses the `tv{show}-ep{episode}` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("Invalid item key '{}', expected tv<show>-ep<episode>", s);
        let rest = s.strip_prefix("tv").ok_or_else(invalid)?;
        let (show, episode) = rest.split_once("-ep").ok_or_else(invalid)?;
        Ok(Self {
            show_id: show.parse().map_err(|_| invalid())?,
            episode: episode.parse().map_err(|_| invalid())?,
        })
    }
}

/// Status of a transfer item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Waiting for a free slot
    Pending,
    /// Holding a slot and moving bytes
    Downloading,
    /// Stopped by the user or by a restart
    Paused,
    /// File complete on disk
    Finished,
    /// Transfer failed; not retried
    Error,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Finished => "finished",
            Self::Error => "error",
        }
    }

    /// Finished and error items never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }

    /// Pending and downloading items still need work.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Downloading)
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition was requested from a status that does not allow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    pub from: TransferStatus,
    pub to: TransferStatus,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cannot move a transfer from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}

/// One queued, running or completed episode download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferItem {
    pub key: ItemKey,
    pub source_url: String,
    /// File name inside the media directory, unique across the queue.
    pub destination_name: String,
    pub status: TransferStatus,
    /// Fraction in `[0, 1]`; only meaningful while downloading.
    #[serde(default)]
    pub progress: f64,
    /// Set once the file is complete.
    #[serde(default)]
    pub local_uri: Option<PathBuf>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferItem {
    /// Create a pending item.
    pub fn new(key: ItemKey, source_url: impl Into<String>, destination_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key,
            source_url: source_url.into(),
            destination_name: destination_name.into(),
            status: TransferStatus::Pending,
            progress: 0.0,
            local_uri: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, allowed: &[TransferStatus], to: TransferStatus) -> Result<(), TransitionError> {
        if !allowed.contains(&self.status) {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// pending → downloading
    pub fn begin(&mut self) -> Result<(), TransitionError> {
        self.transition(&[TransferStatus::Pending], TransferStatus::Downloading)
    }

    /// pending | downloading → paused
    pub fn pause(&mut self) -> Result<(), TransitionError> {
        self.transition(
            &[TransferStatus::Pending, TransferStatus::Downloading],
            TransferStatus::Paused,
        )
    }

    /// paused → pending
    pub fn resume(&mut self) -> Result<(), TransitionError> {
        self.transition(&[TransferStatus::Paused], TransferStatus::Pending)
    }

    /// downloading → finished
    pub fn finish(&mut self, local_uri: PathBuf) -> Result<(), TransitionError> {
        self.transition(&[TransferStatus::Downloading], TransferStatus::Finished)?;
        self.progress = 1.0;
        self.local_uri = Some(local_uri);
        self.last_error = None;
        Ok(())
    }

    /// downloading → error
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(&[TransferStatus::Downloading], TransferStatus::Error)?;
        self.last_error = Some(message.into());
        Ok(())
    }

    /// Record progress. Ignored unless the item is downloading.
    pub fn set_progress(&mut self, fraction: f64) -> bool {
        if self.status != TransferStatus::Downloading {
            return false;
        }
        self.progress = fraction.clamp(0.0, 1.0);
        self.updated_at = Utc::now();
        true
    }

    /// Demote work interrupted by a restart. Returns true if the item changed.
    pub fn recover(&mut self) -> bool {
        if self.status.is_active() {
            self.status = TransferStatus::Paused;
            self.updated_at = Utc::now();
            true
        } else {
            false
        }
    }
}
