use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::{debug, warn};
use tokio::time::Instant;

use crate::metrics::METRICS;
use crate::protocol::{ChunkPayload, Frame, FrameKind};
use crate::util;

// ------------------------------------------------------------
// Chunking constants
// ------------------------------------------------------------
//
// The broker enforces a hard 1 MiB ceiling per WebSocket message. A
// frame whose serialization stays under the ceiling is sent as-is;
// anything larger is split into chunk frames. The per-chunk payload
// budget leaves room for the JSON envelope around the slice.
//

/// Hard per-message ceiling imposed by the broker.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Payload budget per chunk slice.
pub const CHUNK_BUDGET_BYTES: usize = 768 * 1024;

/// Assemblies older than this are garbage.
pub const ASSEMBLY_MAX_AGE: Duration = Duration::from_secs(30);

/// Upper bound on simultaneously open assemblies.
pub const MAX_ASSEMBLIES: usize = 100;

// ------------------------------------------------------------
// Outbound splitting
// ------------------------------------------------------------

/// Serializes a frame into the WebSocket text messages that carry it.
///
/// Small frames become exactly one message. Oversized frames become N
/// chunk frames sharing a message id, ascending indexes, and the
/// original frame's type tag.
///
/// CONTRACT:
/// - Returned messages must be written to the socket contiguously and
///   in order, so the slices of one logical frame never interleave
///   with another chunked frame.
///
pub fn encode_frame(frame: &Frame) -> anyhow::Result<Vec<String>> {
    let serialized = serde_json::to_string(frame)?;
    if serialized.len() <= MAX_MESSAGE_BYTES {
        return Ok(vec![serialized]);
    }

    let slices = split_utf8(&serialized, CHUNK_BUDGET_BYTES)?;
    let total = slices.len();
    let message_id = util::message_id();
    let original_type = frame.kind();

    debug!(
        "splitting {}-byte frame into {} chunks (messageId={})",
        serialized.len(),
        total,
        message_id
    );

    let mut out = Vec::with_capacity(total);
    for (index, slice) in slices.into_iter().enumerate() {
        let chunk = Frame::Chunk(ChunkPayload {
            message_id: message_id.clone(),
            chunk_index: index,
            total_chunks: total,
            chunk: slice.to_string(),
            original_type,
        });
        out.push(serde_json::to_string(&chunk)?);
    }
    METRICS.chunks_sent.fetch_add(total, Ordering::Relaxed);
    Ok(out)
}

/// Splits `text` into slices of at most `budget` UTF-8 bytes, never
/// bisecting a code point: each cut walks back to the nearest char
/// boundary.
///
/// Fails only if a single code point exceeds the budget, which cannot
/// happen for any budget of 4 bytes or more. The check stays anyway;
/// a corrupt slice here would poison the reassembled JSON on the
/// broker side.
fn split_utf8(text: &str, budget: usize) -> anyhow::Result<Vec<&str>> {
    let mut slices = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        if rest.len() <= budget {
            slices.push(rest);
            break;
        }
        let mut cut = budget;
        while cut > 0 && !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            anyhow::bail!("single UTF-8 code point exceeds the {} byte chunk budget", budget);
        }
        slices.push(&rest[..cut]);
        rest = &rest[cut..];
    }
    Ok(slices)
}

// ------------------------------------------------------------
// Inbound reassembly
// ------------------------------------------------------------

/// A partially received chunked message.
struct ChunkAssembly {
    total_chunks: usize,
    received: usize,
    /// Slices stored by index; `None` marks a hole.
    chunks: Vec<Option<String>>,
    original_type: FrameKind,
    created_at: Instant,
}

/// Reassembled logical frame, ready to be re-parsed.
pub struct Reassembled {
    pub text: String,
    pub original_type: FrameKind,
}

/// Table of open assemblies, owned by the session and touched only by
/// the WebSocket reader.
///
/// Eviction:
/// - assemblies older than [`ASSEMBLY_MAX_AGE`]
/// - oldest-first once the table exceeds [`MAX_ASSEMBLIES`]
///
/// A sweep runs on roughly one in ten chunk arrivals and on session
/// close; a stalled sender therefore leaks at most a bounded amount
/// for a bounded time.
pub struct ChunkTable {
    entries: HashMap<String, ChunkAssembly>,
    arrivals: u64,
}

impl ChunkTable {
    pub fn new() -> Self {
        ChunkTable {
            entries: HashMap::new(),
            arrivals: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ingests one chunk frame. Returns the reassembled text once the
    /// final slice lands.
    ///
    /// Duplicate indexes overwrite their slot without advancing the
    /// received count, so a replayed chunk can never complete an
    /// assembly that still has holes.
    pub fn ingest(&mut self, payload: ChunkPayload) -> Option<Reassembled> {
        self.arrivals += 1;
        if self.arrivals % 10 == 0 {
            self.cleanup(ASSEMBLY_MAX_AGE, MAX_ASSEMBLIES);
        }
        METRICS.chunks_received.fetch_add(1, Ordering::Relaxed);

        // 10k chunks would be a ~7.5 GiB logical frame; nothing sane
        // sends that, so treat it as malformed rather than allocate.
        if payload.total_chunks == 0
            || payload.total_chunks > 10_000
            || payload.chunk_index >= payload.total_chunks
        {
            warn!(
                "dropping malformed chunk (messageId={}, index={}, total={})",
                payload.message_id, payload.chunk_index, payload.total_chunks
            );
            return None;
        }

        let assembly = self
            .entries
            .entry(payload.message_id.clone())
            .or_insert_with(|| ChunkAssembly {
                total_chunks: payload.total_chunks,
                received: 0,
                chunks: vec![None; payload.total_chunks],
                original_type: payload.original_type,
                created_at: Instant::now(),
            });

        if assembly.total_chunks != payload.total_chunks {
            warn!(
                "chunk total mismatch for messageId={} ({} vs {}), dropping chunk",
                payload.message_id, payload.total_chunks, assembly.total_chunks
            );
            return None;
        }

        let slot = &mut assembly.chunks[payload.chunk_index];
        if slot.is_none() {
            assembly.received += 1;
        } else {
            debug!(
                "duplicate chunk {} for messageId={}, overwriting",
                payload.chunk_index, payload.message_id
            );
        }
        *slot = Some(payload.chunk);

        if assembly.received < assembly.total_chunks {
            return None;
        }

        let assembly = self
            .entries
            .remove(&payload.message_id)
            .expect("assembly present");
        let mut text = String::new();
        for slice in assembly.chunks {
            // received == total guarantees every slot is filled
            text.push_str(&slice.expect("complete assembly has no holes"));
        }
        METRICS.reassemblies_completed.fetch_add(1, Ordering::Relaxed);
        Some(Reassembled {
            text,
            original_type: assembly.original_type,
        })
    }

    /// Evicts assemblies older than `max_age`, then trims oldest-first
    /// down to `max_entries`.
    pub fn cleanup(&mut self, max_age: Duration, max_entries: usize) {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, a| now.duration_since(a.created_at) <= max_age);

        if self.entries.len() > max_entries {
            let mut by_age: Vec<(String, Instant)> = self
                .entries
                .iter()
                .map(|(id, a)| (id.clone(), a.created_at))
                .collect();
            by_age.sort_by_key(|(_, created)| *created);
            let excess = self.entries.len() - max_entries;
            for (id, _) in by_age.into_iter().take(excess) {
                self.entries.remove(&id);
            }
        }

        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!("chunk GC evicted {} stale assemblies", evicted);
            METRICS
                .reassemblies_discarded
                .fetch_add(evicted, Ordering::Relaxed);
        }
    }

    /// Drops every open assembly. Called on session close.
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            debug!("dropping {} open assemblies", self.entries.len());
        }
        self.entries.clear();
    }
}

impl Default for ChunkTable {
    fn default() -> Self {
        Self::new()
    }
}
