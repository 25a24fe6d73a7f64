//! Receiver side: rebuilds blobs from WRITE_DATA chunks and produces the
//! acknowledgements the sender waits for.

use super::blob_crc;
use super::message::Message;
use crate::logutil::escape_log;
use log::{debug, info, trace, warn};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Instant;

/// Request ids remembered after completion so late duplicates are re-acked.
const FINISHED_MEMORY: usize = 16;
/// WRITE_RESEND messages emitted per WRITE_DONE.
const MAX_RESEND_PER_DONE: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedBlob {
    pub request_id: u8,
    pub data: Vec<u8>,
    pub crc32: u32,
}

/// What to send back, plus the finished blob when this message completed one.
#[derive(Debug, Default)]
pub struct Reply {
    pub responses: Vec<Message>,
    pub completed: Option<CompletedBlob>,
}

impl Reply {
    fn respond(msg: Message) -> Self {
        Self {
            responses: vec![msg],
            completed: None,
        }
    }
}

#[derive(Debug)]
struct Assembly {
    total_length: u32,
    chunk_count: u32,
    chunks: BTreeMap<u32, Vec<u8>>,
    started: Instant,
}

impl Assembly {
    fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.chunk_count).filter(|s| !self.chunks.contains_key(s))
    }

    fn is_complete(&self) -> bool {
        self.chunks.len() as u32 >= self.chunk_count
    }
}

#[derive(Debug)]
pub struct Reassembler {
    active: HashMap<u8, Assembly>,
    finished: VecDeque<u8>,
    max_active: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(4)
    }
}

impl Reassembler {
    pub fn new(max_active: usize) -> Self {
        Self {
            active: HashMap::new(),
            finished: VecDeque::with_capacity(FINISHED_MEMORY),
            max_active: max_active.max(1),
        }
    }

    pub fn active_transfers(&self) -> usize {
        self.active.len()
    }

    pub fn handle(&mut self, msg: &Message) -> Reply {
        match msg {
            Message::Hello { text } => {
                info!("hello from sender: {}", escape_log(text));
                Reply::respond(Message::Hello { text: text.clone() })
            }
            Message::WriteRequest {
                request_id,
                total_length,
                chunk_count,
            } => self.on_request(*request_id, *total_length, *chunk_count),
            Message::WriteData {
                request_id,
                sequence,
                chunk,
            } => self.on_data(*request_id, *sequence, chunk),
            Message::WriteDone { request_id, .. } => self.on_done(*request_id),
            Message::Command(cmd) => {
                debug!("ignoring command 0x{:02x} addressed to the sender role", cmd);
                Reply::default()
            }
            other => {
                trace!("receiver ignoring message 0x{:02x}", other.tag());
                Reply::default()
            }
        }
    }

    fn on_request(&mut self, request_id: u8, total_length: u32, chunk_count: u32) -> Reply {
        // Every chunk carries at least one byte; only an empty blob may
        // announce a single (empty) chunk or none.
        if chunk_count > total_length.max(1) || (chunk_count == 0 && total_length > 0) {
            warn!(
                "rejecting WRITE_REQUEST {}: {} chunk(s) cannot carry {} bytes",
                request_id, chunk_count, total_length
            );
            return Reply::default();
        }
        let ack = Message::WriteRequestAck {
            request_id,
            total_length,
        };
        if let Some(existing) = self.active.get(&request_id) {
            if existing.total_length == total_length && existing.chunk_count == chunk_count {
                debug!("duplicate WRITE_REQUEST {}; re-acking", request_id);
                return Reply::respond(ack);
            }
            warn!(
                "WRITE_REQUEST {} replaces an unfinished transfer with the same id",
                request_id
            );
        }
        // The id space wraps; a fresh request supersedes any memory of it.
        self.finished.retain(|&id| id != request_id);

        if self.active.len() >= self.max_active && !self.active.contains_key(&request_id) {
            if let Some(oldest) = self
                .active
                .iter()
                .min_by_key(|(_, a)| a.started)
                .map(|(&id, _)| id)
            {
                warn!("abandoning stalled transfer {}", oldest);
                self.active.remove(&oldest);
            }
        }

        info!(
            "transfer {}: expecting {} bytes in {} chunk(s)",
            request_id, total_length, chunk_count
        );
        self.active.insert(
            request_id,
            Assembly {
                total_length,
                chunk_count,
                chunks: BTreeMap::new(),
                started: Instant::now(),
            },
        );
        Reply::respond(ack)
    }

    fn on_data(&mut self, request_id: u8, sequence: u32, chunk: &[u8]) -> Reply {
        let ack = Message::WriteDataAck {
            request_id,
            sequence,
        };
        let Some(assembly) = self.active.get_mut(&request_id) else {
            if self.finished.contains(&request_id) {
                trace!("late chunk {}/{} for finished transfer", request_id, sequence);
                return Reply::respond(ack);
            }
            debug!("chunk {}/{} for unknown transfer; not acking", request_id, sequence);
            return Reply::default();
        };
        if sequence >= assembly.chunk_count {
            warn!(
                "chunk {}/{} outside announced count {}",
                request_id, sequence, assembly.chunk_count
            );
            return Reply::default();
        }
        if assembly.chunks.insert(sequence, chunk.to_vec()).is_some() {
            trace!("duplicate chunk {}/{}", request_id, sequence);
        }
        Reply::respond(ack)
    }

    fn on_done(&mut self, request_id: u8) -> Reply {
        let done_ack = Message::WriteDoneAck { request_id };
        let Some(assembly) = self.active.get(&request_id) else {
            if self.finished.contains(&request_id) {
                debug!("repeated WRITE_DONE {}; re-acking", request_id);
                return Reply::respond(done_ack);
            }
            debug!("WRITE_DONE for unknown transfer {}", request_id);
            return Reply::default();
        };

        if !assembly.is_complete() {
            warn!(
                "transfer {}: WRITE_DONE with {} chunk(s) missing",
                request_id,
                assembly.chunk_count as usize - assembly.chunks.len()
            );
            return Reply {
                responses: assembly
                    .missing()
                    .take(MAX_RESEND_PER_DONE)
                    .map(|sequence| Message::WriteResend {
                        request_id,
                        sequence,
                    })
                    .collect(),
                completed: None,
            };
        }

        let Some(assembly) = self.active.remove(&request_id) else {
            return Reply::default();
        };
        let mut data: Vec<u8> = assembly.chunks.into_values().flatten().collect();
        if data.len() != assembly.total_length as usize {
            warn!(
                "transfer {}: assembled {} bytes, announced {}",
                request_id,
                data.len(),
                assembly.total_length
            );
            data.truncate(assembly.total_length as usize);
        }
        if self.finished.len() >= FINISHED_MEMORY {
            self.finished.pop_front();
        }
        self.finished.push_back(request_id);

        let crc32 = blob_crc(&data);
        info!(
            "transfer {} received: {} bytes, crc32 {:08x}, {} ms",
            request_id,
            data.len(),
            crc32,
            assembly.started.elapsed().as_millis()
        );
        Reply {
            responses: vec![done_ack],
            completed: Some(CompletedBlob {
                request_id,
                data,
                crc32,
            }),
        }
    }
}
