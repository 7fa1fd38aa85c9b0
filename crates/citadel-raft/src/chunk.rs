//! Chunked command assembly.
//!
//! Commands larger than the log-entry size limit are split by the submitting
//! layer into numbered chunks persisted under a reserved prefix:
//!
//! ```text
//! raftchunking/<op_num>/<seq_num>
//! ```
//!
//! Each chunk is an ordinary log write, so replication and snapshotting need
//! no special handling. Once every chunk of an operation is present the
//! state machine reassembles the original command, applies it, and deletes
//! the chunk prefix. Numbers are zero-padded in the key so lexicographic
//! order equals numeric order.

use serde::{Deserialize, Serialize};

use crate::error::RaftError;
use crate::fsm::Fsm;
use crate::log::{LogBody, LogData, LogEntry, Operation};

/// Reserved storage prefix for in-flight chunked operations.
pub const CHUNK_PREFIX: &str = "raftchunking/";

/// One chunk of a split command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkedOp {
    /// Identifier shared by all chunks of one logical command.
    pub op_num: u64,
    /// Position of this chunk, starting at 0.
    pub seq_num: u32,
    /// Total number of chunks in the command.
    pub num_chunks: u32,
    /// This chunk's slice of the encoded [`LogData`].
    pub data: Vec<u8>,
}

impl ChunkedOp {
    fn storage_key(&self) -> String {
        chunk_key(self.op_num, self.seq_num)
    }
}

fn chunk_key(op_num: u64, seq_num: u32) -> String {
    format!("{CHUNK_PREFIX}{op_num:020}/{seq_num:010}")
}

fn op_prefix(op_num: u64) -> String {
    format!("{CHUNK_PREFIX}{op_num:020}/")
}

/// Split an encoded command into chunks of at most `chunk_size` bytes.
///
/// # Errors
///
/// Returns [`RaftError::MalformedEntry`] when `chunk_size` is zero.
pub fn split_command(
    op_num: u64,
    encoded: &[u8],
    chunk_size: usize,
) -> Result<Vec<ChunkedOp>, RaftError> {
    if chunk_size == 0 {
        return Err(RaftError::MalformedEntry {
            reason: "chunk size must be non-zero".to_owned(),
        });
    }
    let pieces: Vec<&[u8]> = encoded.chunks(chunk_size).collect();
    let num_chunks = u32::try_from(pieces.len()).map_err(|_| RaftError::MalformedEntry {
        reason: "command requires too many chunks".to_owned(),
    })?;
    Ok(pieces
        .into_iter()
        .enumerate()
        .map(|(i, data)| ChunkedOp {
            op_num,
            #[allow(clippy::cast_possible_truncation)]
            seq_num: i as u32,
            num_chunks,
            data: data.to_vec(),
        })
        .collect())
}

impl Fsm {
    /// Store one chunk, applying the assembled command once complete.
    ///
    /// The chunk write, the assembled command's operations, and the cleanup
    /// of the chunk prefix all go through ordinary log application so every
    /// replica performs the identical sequence. Returns the assembled
    /// command's apply outcome when this chunk completed the set.
    ///
    /// # Errors
    ///
    /// - [`RaftError::MalformedEntry`] if the assembled bytes do not decode.
    /// - Apply errors from the assembled command.
    pub fn apply_chunk(
        &self,
        entry_index: u64,
        entry_term: u64,
        chunk: &ChunkedOp,
    ) -> Result<Option<crate::fsm::ApplyResponse>, RaftError> {
        let raw = serde_json::to_vec(chunk).map_err(RaftError::store)?;
        self.apply_batch(&[LogEntry {
            index: entry_index,
            term: entry_term,
            body: LogBody::Command(LogData::new(vec![Operation::put(
                chunk.storage_key(),
                raw,
            )])),
        }])?;

        let prefix = op_prefix(chunk.op_num);
        let stored = self.list_prefix(&prefix)?;
        if stored.len() < chunk.num_chunks as usize {
            return Ok(None);
        }

        // All chunks present: reassemble in key order (zero-padded, so
        // lexicographic equals numeric).
        let mut encoded = Vec::new();
        for key in &stored {
            let raw = self.get(key)?.ok_or_else(|| RaftError::Store {
                reason: format!("chunk '{key}' vanished during assembly"),
            })?;
            let piece: ChunkedOp = serde_json::from_slice(&raw).map_err(|e| {
                RaftError::MalformedEntry {
                    reason: format!("chunk '{key}' undecodable: {e}"),
                }
            })?;
            encoded.extend_from_slice(&piece.data);
        }

        let command = LogData::decode(&encoded)?;

        // Apply the assembled command, then drop the chunk prefix.
        let mut responses = self.apply_batch(&[LogEntry {
            index: entry_index,
            term: entry_term,
            body: LogBody::Command(command),
        }])?;

        let cleanup: Vec<Operation> = stored.iter().map(|k| Operation::delete(k.as_str())).collect();
        self.apply_batch(&[LogEntry {
            index: entry_index,
            term: entry_term,
            body: LogBody::Command(LogData::new(cleanup)),
        }])?;

        Ok(responses.pop())
    }
}
