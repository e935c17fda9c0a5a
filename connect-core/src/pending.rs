//! Pending-request table: correlates responses to requests by envelope id and
//! drives tick-based timeouts with a bounded number of re-sends.

use std::collections::HashMap;

use uuid::Uuid;

use crate::protocol::ActionTag;

/// One request awaiting its response.
#[derive(Debug)]
pub struct PendingRequest<K> {
    pub id: Uuid,
    pub expected: ActionTag,
    pub kind: K,
    frame: Vec<u8>,
    sent_tick: u64,
    resends: u32,
}

impl<K> PendingRequest<K> {
    pub fn resends(&self) -> u32 {
        self.resends
    }
}

/// What a tick decided for an overdue request.
#[derive(Debug)]
pub enum Expiry<K> {
    /// Re-send these exact bytes (same envelope id).
    Resend(Vec<u8>),
    /// Out of re-sends; the request is removed.
    GiveUp(PendingRequest<K>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("a request expecting {expected} is still outstanding")]
pub struct Busy {
    pub expected: ActionTag,
}

/// Requests awaiting a response, keyed by envelope id. At most `max_outstanding`
/// entries; a session uses one so requests never pipeline.
#[derive(Debug)]
pub struct PendingTable<K> {
    entries: HashMap<Uuid, PendingRequest<K>>,
    max_outstanding: usize,
}

impl<K> PendingTable<K> {
    pub fn new(max_outstanding: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_outstanding: max_outstanding.max(1),
        }
    }

    pub fn insert(
        &mut self,
        id: Uuid,
        expected: ActionTag,
        kind: K,
        frame: Vec<u8>,
        now: u64,
    ) -> Result<(), Busy> {
        if self.entries.len() >= self.max_outstanding {
            let expected = self
                .entries
                .values()
                .next()
                .map(|p| p.expected)
                .unwrap_or(expected);
            return Err(Busy { expected });
        }
        self.entries.insert(
            id,
            PendingRequest {
                id,
                expected,
                kind,
                frame,
                sent_tick: now,
                resends: 0,
            },
        );
        Ok(())
    }

    /// Remove and return the request answered by an envelope with this id.
    pub fn take(&mut self, id: &Uuid) -> Option<PendingRequest<K>> {
        self.entries.remove(id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.entries.contains_key(id)
    }

    /// Requests older than `timeout_ticks` are re-sent until `max_resends` is used
    /// up, then given up.
    pub fn expire(&mut self, now: u64, timeout_ticks: u64, max_resends: u32) -> Vec<Expiry<K>> {
        let overdue: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|(_, p)| now.saturating_sub(p.sent_tick) > timeout_ticks)
            .map(|(&id, _)| id)
            .collect();
        let mut out = Vec::with_capacity(overdue.len());
        for id in overdue {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            if entry.resends < max_resends {
                entry.resends += 1;
                entry.sent_tick = now;
                out.push(Expiry::Resend(entry.frame.clone()));
            } else if let Some(entry) = self.entries.remove(&id) {
                out.push(Expiry::GiveUp(entry));
            }
        }
        out
    }

    /// Cancel everything outstanding.
    pub fn drain(&mut self) -> Vec<PendingRequest<K>> {
        self.entries.drain().map(|(_, p)| p).collect()
    }

    /// Put a drained request back under its original envelope id with a fresh
    /// clock and re-send budget. Returns the frame to send again.
    pub fn restore(&mut self, request: PendingRequest<K>, now: u64) -> Result<Vec<u8>, Busy> {
        let PendingRequest {
            id,
            expected,
            kind,
            frame,
            ..
        } = request;
        self.insert(id, expected, kind, frame.clone(), now)?;
        Ok(frame)
    }
}
