// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Helpers that combine the download queue's view with server data.

use std::collections::BTreeSet;

use crate::api::types::TvDetail;
use crate::download::{TransferItem, TransferStatus};

/// Shows with at least one finished download.
pub fn offline_eligible_shows(items: &[TransferItem]) -> BTreeSet<u64> {
    items
        .iter()
        .filter(|item| item.status == TransferStatus::Finished)
        .map(|item| item.key.show_id)
        .collect()
}

/// Point episodes of `show_id` at their downloaded files.
///
/// Episode index is the position in `detail.episodes`. Returns how many
/// episodes were rewritten.
pub fn attach_local_media(detail: &mut TvDetail, show_id: u64, items: &[TransferItem]) -> usize {
    let mut attached = 0;
    for item in items {
        if item.key.show_id != show_id || item.status != TransferStatus::Finished {
            continue;
        }
        let (Some(episode), Some(local)) = (
            detail.episodes.get_mut(item.key.episode as usize),
            item.local_uri.as_ref(),
        ) else {
            continue;
        };
        episode.url = local.to_string_lossy().into_owned();
        attached += 1;
    }
    attached
}
