//! Datagram framing: `{message_id}@{index}@{total}@{payload}`.
//!
//! Payloads are raw byte slices of a UTF-8 document cut at fixed offsets, so a
//! fragment may end in the middle of a character. Bytes are joined before any
//! decoding happens.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    #[error("missing `@` delimiter in fragment header")]
    MissingDelimiter,
    #[error("empty message id")]
    EmptyId,
    #[error("fragment header field `{0}` is not a decimal number")]
    NotANumber(&'static str),
    #[error("fragment index {index} outside 1..={total}")]
    IndexOutOfRange { index: usize, total: usize },
    #[error("fragment count {0} exceeds limit")]
    TooManyFragments(usize),
    #[error("fragment count changed from {expected} to {actual}")]
    TotalChanged { expected: usize, actual: usize },
}

#[derive(Debug, PartialEq, Eq)]
pub struct Fragment<'a> {
    pub message_id: &'a str,
    pub index: usize,
    pub total: usize,
    pub payload: &'a [u8],
}

fn parse_number(field: &[u8], name: &'static str) -> Result<usize, FragmentError> {
    if field.is_empty() || !field.iter().all(u8::is_ascii_digit) {
        return Err(FragmentError::NotANumber(name));
    }
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(FragmentError::NotANumber(name))
}

impl<'a> Fragment<'a> {
    pub fn parse(raw: &'a [u8], max_fragments: usize) -> Result<Self, FragmentError> {
        let mut fields = raw.splitn(4, |b| *b == b'@');
        let (Some(id), Some(index), Some(total), Some(payload)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(FragmentError::MissingDelimiter);
        };

        let message_id = std::str::from_utf8(id)
            .ok()
            .filter(|id| !id.is_empty())
            .ok_or(FragmentError::EmptyId)?;
        let index = parse_number(index, "index")?;
        let total = parse_number(total, "total")?;

        if total > max_fragments {
            return Err(FragmentError::TooManyFragments(total));
        }
        if index == 0 || index > total {
            return Err(FragmentError::IndexOutOfRange { index, total });
        }

        Ok(Self {
            message_id,
            index,
            total,
            payload,
        })
    }
}

/// Cuts `payload` into framed datagrams of at most `max_packet_size` payload bytes.
pub fn split_message(message_id: &str, payload: &[u8], max_packet_size: usize) -> Vec<Vec<u8>> {
    let max_packet_size = max_packet_size.max(1);
    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![payload]
    } else {
        payload.chunks(max_packet_size).collect()
    };
    let total = chunks.len();

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut packet = format!("{message_id}@{}@{total}@", i + 1).into_bytes();
            packet.extend_from_slice(chunk);
            packet
        })
        .collect()
}

struct Partial {
    total: usize,
    slices: Vec<Option<Vec<u8>>>,
    received: usize,
    bytes: usize,
    first_seen: Instant,
}

#[derive(Debug, Clone)]
pub struct ReassemblerOptions {
    pub timeout: Duration,
    pub max_pending: usize,
    pub max_pending_bytes: usize,
    pub max_fragments: usize,
}

impl Default for ReassemblerOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_pending: 1024,
            max_pending_bytes: 64 * 1024 * 1024,
            max_fragments: 4096,
        }
    }
}

/// Collects fragments per message id until every index has arrived.
///
/// Incomplete messages are dropped after `timeout`. At most `max_pending` of
/// them, holding at most `max_pending_bytes` of payload, are kept; the oldest
/// is evicted first. Ids that completed recently are remembered for one
/// timeout window so stray duplicates are ignored.
pub struct Reassembler {
    options: ReassemblerOptions,
    partial: HashMap<String, Partial>,
    pending_bytes: usize,
    completed: HashMap<String, Instant>,
}

impl Reassembler {
    pub fn new(options: ReassemblerOptions) -> Self {
        Self {
            options,
            partial: HashMap::new(),
            pending_bytes: 0,
            completed: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    #[cfg(test)]
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub fn ingest(&mut self, raw: &[u8]) -> Option<Vec<u8>> {
        self.ingest_at(raw, Instant::now())
    }

    pub fn ingest_at(&mut self, raw: &[u8], now: Instant) -> Option<Vec<u8>> {
        self.purge(now);

        let fragment = match Fragment::parse(raw, self.options.max_fragments) {
            Ok(fragment) => fragment,
            Err(e) => {
                log::warn!(
                    "dropping malformed datagram ({e}): {:?}",
                    String::from_utf8_lossy(&raw[..raw.len().min(64)])
                );
                return None;
            }
        };

        if self.completed.contains_key(fragment.message_id) {
            log::debug!(
                "ignoring fragment {} of completed message {}",
                fragment.index,
                fragment.message_id
            );
            return None;
        }

        if fragment.total == 1 {
            self.completed.insert(fragment.message_id.to_string(), now);
            return Some(fragment.payload.to_vec());
        }

        if !self.partial.contains_key(fragment.message_id) {
            self.make_room();
        }
        if !self.reserve(fragment.message_id, fragment.payload.len()) {
            log::warn!(
                "message {} exceeds the pending byte budget, dropping it",
                fragment.message_id
            );
            self.remove_partial(fragment.message_id);
            return None;
        }
        let partial = self
            .partial
            .entry(fragment.message_id.to_string())
            .or_insert_with(|| Partial {
                total: fragment.total,
                slices: vec![None; fragment.total],
                received: 0,
                bytes: 0,
                first_seen: now,
            });

        if partial.total != fragment.total {
            log::warn!(
                "dropping fragment of {}: {}",
                fragment.message_id,
                FragmentError::TotalChanged {
                    expected: partial.total,
                    actual: fragment.total,
                }
            );
            return None;
        }

        let slot = &mut partial.slices[fragment.index - 1];
        match slot {
            Some(old) => {
                partial.bytes -= old.len();
                self.pending_bytes -= old.len();
            }
            None => partial.received += 1,
        }
        *slot = Some(fragment.payload.to_vec());
        partial.bytes += fragment.payload.len();
        self.pending_bytes += fragment.payload.len();

        if partial.received < partial.total {
            return None;
        }

        let partial = self.remove_partial(fragment.message_id)?;
        self.completed.insert(fragment.message_id.to_string(), now);
        Some(partial.slices.into_iter().flatten().flatten().collect())
    }

    fn remove_partial(&mut self, id: &str) -> Option<Partial> {
        let partial = self.partial.remove(id)?;
        self.pending_bytes -= partial.bytes;
        Some(partial)
    }

    /// Evicts other incomplete messages, oldest first, until `incoming` more
    /// bytes fit. Returns false when even that is not enough.
    fn reserve(&mut self, id: &str, incoming: usize) -> bool {
        while self.pending_bytes + incoming > self.options.max_pending_bytes {
            let Some(oldest) = self
                .partial
                .iter()
                .filter(|(other, _)| other.as_str() != id)
                .min_by_key(|(_, p)| p.first_seen)
                .map(|(other, _)| other.clone())
            else {
                return false;
            };
            log::warn!("pending byte budget exhausted, evicting {oldest}");
            self.remove_partial(&oldest);
        }
        true
    }

    /// Drops incomplete messages and completion markers older than the timeout.
    pub fn purge(&mut self, now: Instant) {
        let timeout = self.options.timeout;
        let pending_bytes = &mut self.pending_bytes;
        self.partial.retain(|id, p| {
            let alive = now.saturating_duration_since(p.first_seen) < timeout;
            if !alive {
                log::warn!(
                    "discarding incomplete message {id}: {}/{} fragments",
                    p.received,
                    p.total
                );
                *pending_bytes -= p.bytes;
            }
            alive
        });
        self.completed
            .retain(|_, at| now.saturating_duration_since(*at) < timeout);
    }

    fn make_room(&mut self) {
        while self.partial.len() >= self.options.max_pending.max(1) {
            let Some(oldest) = self
                .partial
                .iter()
                .min_by_key(|(_, p)| p.first_seen)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            log::warn!("too many incomplete messages, evicting {oldest}");
            self.remove_partial(&oldest);
        }
    }
}
