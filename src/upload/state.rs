use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::remote::UploadSession;
use crate::transfer::instance::{Versioned, STATE_VERSION};
use crate::transfer::range::Range;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockState {
    pub id: usize,
    pub range: Range,
    pub upload_done: bool,
}

/// Saved progress of a multipart upload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadInstanceState {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    pub file_size: i64,
    pub block_size: i64,
    #[serde(default)]
    pub session: Option<UploadSession>,
    pub blocks: Vec<BlockState>,
}

impl UploadInstanceState {
    pub fn new(
        file_size: i64,
        block_size: i64,
        session: Option<UploadSession>,
        blocks: Vec<BlockState>,
    ) -> Self {
        Self {
            version: STATE_VERSION,
            saved_at: Some(Utc::now()),
            file_size,
            block_size,
            session,
            blocks,
        }
    }

    pub fn uploaded(&self) -> i64 {
        self.blocks
            .iter()
            .filter(|b| b.upload_done)
            .map(|b| b.range.len())
            .sum()
    }

    /// Ids of the parts still to send, in order.
    pub fn pending_parts(&self) -> Vec<usize> {
        pending_parts(&self.blocks)
    }
}

pub fn pending_parts(blocks: &[BlockState]) -> Vec<usize> {
    blocks
        .iter()
        .filter(|b| !b.upload_done)
        .map(|b| b.id)
        .collect()
}

impl Versioned for UploadInstanceState {
    fn version(&self) -> u32 {
        self.version
    }
}
