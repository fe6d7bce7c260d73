/// Shared text document: the authoritative operation log and the client side
///
/// The server sequences every batch. A batch is written against the version
/// its author last saw; the server transforms it over everything accepted
/// since, applies it and assigns the next version. Clients keep at most one
/// batch in flight and buffer further edits until it is acknowledged.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    apply_all, transform, Bias, CollaborationError, LamportClock, OperationId, PresenceState,
    Result, TextOp, UserId, VectorClock,
};

/// One batch of edits submitted by a participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextOperation {
    pub id: OperationId,
    pub author: UserId,
    /// Document version the batch was written against
    pub base_version: u64,
    /// Assigned on acceptance, zero while pending
    #[serde(default)]
    pub version: u64,
    pub clock: LamportClock,
    pub ops: Vec<TextOp>,
    pub timestamp: DateTime<Utc>,
}

impl TextOperation {
    pub fn new(author: UserId, base_version: u64, clock: LamportClock, ops: Vec<TextOp>) -> Self {
        Self {
            id: OperationId::new(),
            author,
            base_version,
            version: 0,
            clock,
            ops,
            timestamp: Utc::now(),
        }
    }
}

/// Content and version sent to joining participants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub content: String,
    pub version: u64,
    pub last_modified_by: Option<UserId>,
    pub last_modified_at: Option<DateTime<Utc>>,
}

/// Server-side document. `operations[i]` holds version `i + 1`.
#[derive(Debug, Clone, Default)]
pub struct DocumentState {
    content: String,
    version: u64,
    operations: Vec<TextOperation>,
    clock: LamportClock,
    vector_clock: VectorClock,
    last_modified_by: Option<UserId>,
    last_modified_at: Option<DateTime<Utc>>,
}

impl DocumentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn operations(&self) -> &[TextOperation] {
        &self.operations
    }

    pub fn vector_clock(&self) -> &VectorClock {
        &self.vector_clock
    }

    /// Length in characters
    pub fn len(&self) -> usize {
        self.content.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn contains(&self, id: OperationId) -> bool {
        self.operations.iter().any(|op| op.id == id)
    }

    /// Sequence, transform and apply a batch, returning the accepted record.
    ///
    /// Resubmitting an accepted id returns the stored record without applying
    /// anything again.
    pub fn submit(&mut self, operation: TextOperation) -> Result<TextOperation> {
        if let Some(existing) = self.operations.iter().find(|op| op.id == operation.id) {
            debug!("Operation {} already accepted at v{}", existing.id.0, existing.version);
            return Ok(existing.clone());
        }
        if operation.base_version > self.version {
            return Err(CollaborationError::VersionAhead {
                base: operation.base_version,
                current: self.version,
            });
        }
        if operation.ops.is_empty() {
            return Err(CollaborationError::InvalidOp("empty operation".to_string()));
        }

        let concurrent: Vec<TextOp> = self.operations[operation.base_version as usize..]
            .iter()
            .flat_map(|op| op.ops.iter().cloned())
            .collect();
        let (ops, _) = transform(&operation.ops, &concurrent, Bias::Right);

        apply_all(&mut self.content, &ops)?;

        self.version += 1;
        self.clock.update(operation.clock);
        self.vector_clock.increment(operation.author);
        self.last_modified_by = Some(operation.author);
        self.last_modified_at = Some(Utc::now());

        let accepted = TextOperation {
            version: self.version,
            clock: self.clock,
            ops,
            ..operation
        };
        trace!(
            "Accepted op {} from {} (base v{}, now v{})",
            accepted.id.0,
            accepted.author,
            accepted.base_version,
            accepted.version
        );
        self.operations.push(accepted.clone());
        Ok(accepted)
    }

    /// Accepted operations with a version greater than `version`
    pub fn operations_since(&self, version: u64) -> Result<&[TextOperation]> {
        if version > self.version {
            return Err(CollaborationError::VersionAhead {
                base: version,
                current: self.version,
            });
        }
        Ok(&self.operations[version as usize..])
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            content: self.content.clone(),
            version: self.version,
            last_modified_by: self.last_modified_by,
            last_modified_at: self.last_modified_at,
        }
    }

    /// Reconstruct content by applying accepted operations to an empty document
    pub fn replay(operations: &[TextOperation]) -> Result<String> {
        let mut content = String::new();
        for (index, op) in operations.iter().enumerate() {
            let expected = index as u64 + 1;
            if op.version != expected {
                return Err(CollaborationError::OutOfOrder {
                    expected,
                    received: op.version,
                });
            }
            apply_all(&mut content, &op.ops)?;
        }
        Ok(content)
    }

    /// Recompute `content` from the log
    pub fn rebuild(&mut self) -> Result<()> {
        self.content = Self::replay(&self.operations)?;
        Ok(())
    }
}

/// Move a participant's cursor and selection across an applied batch
pub fn transform_presence(presence: &mut PresenceState, ops: &[TextOp]) {
    let shift = |offset: usize| ops.iter().fold(offset, |acc, op| op.transform_offset(acc));

    if let Some(cursor) = presence.cursor.as_mut() {
        cursor.offset = shift(cursor.offset);
    }
    if let Some(selection) = presence.selection.as_mut() {
        selection.anchor = shift(selection.anchor);
        selection.head = shift(selection.head);
    }
}

/// Client replica of the document
///
/// Local edits apply immediately. At most one batch is in flight; edits made
/// while waiting for its acknowledgement are composed into a buffer that is
/// sent as the next batch.
#[derive(Debug, Clone)]
pub struct DocumentClient {
    user_id: UserId,
    content: String,
    version: u64,
    clock: LamportClock,
    in_flight: Option<TextOperation>,
    buffer: Vec<TextOp>,
}

impl DocumentClient {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            content: String::new(),
            version: 0,
            clock: LamportClock::new(),
            in_flight: None,
            buffer: Vec::new(),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Last server version this replica has incorporated
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn in_flight(&self) -> Option<&TextOperation> {
        self.in_flight.as_ref()
    }

    pub fn has_pending(&self) -> bool {
        self.in_flight.is_some() || !self.buffer.is_empty()
    }

    /// Apply a local edit; returns the batch to send if nothing is in flight
    pub fn apply_local(&mut self, ops: Vec<TextOp>) -> Result<Option<TextOperation>> {
        apply_all(&mut self.content, &ops)?;
        self.clock.tick();

        if self.in_flight.is_some() {
            self.buffer.extend(ops);
            return Ok(None);
        }
        Ok(self.send(ops))
    }

    /// Server accepted our in-flight batch as `version`
    pub fn receive_ack(&mut self, id: OperationId, version: u64) -> Result<Option<TextOperation>> {
        match &self.in_flight {
            Some(op) if op.id == id => {}
            _ if version <= self.version => return Ok(None),
            _ => {
                return Err(CollaborationError::InvalidOp(format!(
                    "ack for unknown operation {}",
                    id.0
                )))
            }
        }
        self.expect_next(version)?;

        self.version = version;
        self.in_flight = None;
        let buffered = std::mem::take(&mut self.buffer);
        Ok(self.send(buffered))
    }

    /// Incorporate an operation accepted by the server.
    ///
    /// Returns the next batch to send when `operation` turns out to be the
    /// echo of our own in-flight batch.
    pub fn receive_remote(&mut self, operation: &TextOperation) -> Result<Option<TextOperation>> {
        if operation.version <= self.version {
            return Ok(None);
        }
        if self.in_flight.as_ref().map(|op| op.id) == Some(operation.id) {
            return self.receive_ack(operation.id, operation.version);
        }
        self.expect_next(operation.version)?;

        let mut remote = operation.ops.clone();
        if let Some(in_flight) = self.in_flight.as_mut() {
            let (remote_after, in_flight_after) = transform(&remote, &in_flight.ops, Bias::Left);
            remote = remote_after;
            in_flight.ops = in_flight_after;
            in_flight.base_version = operation.version;
        }
        if !self.buffer.is_empty() {
            let (remote_after, buffer_after) = transform(&remote, &self.buffer, Bias::Left);
            remote = remote_after;
            self.buffer = buffer_after;
        }

        apply_all(&mut self.content, &remote)?;
        self.clock.update(operation.clock);
        self.version = operation.version;
        Ok(None)
    }

    /// The server refused our in-flight batch. Local edits built on it are
    /// dropped and the replica resyncs from `snapshot`; returns how many
    /// pending ops were discarded, zero when `id` is not in flight.
    pub fn reject(&mut self, id: OperationId, snapshot: &DocumentSnapshot) -> Result<usize> {
        let Some(in_flight) = self.in_flight.as_ref().filter(|op| op.id == id) else {
            return Ok(0);
        };
        if snapshot.version < self.version {
            return Err(CollaborationError::OutOfOrder {
                expected: self.version,
                received: snapshot.version,
            });
        }

        let dropped = in_flight.ops.len() + self.buffer.len();
        self.in_flight = None;
        self.buffer.clear();
        self.content = snapshot.content.clone();
        self.version = snapshot.version;
        Ok(dropped)
    }

    /// Replace local state with a server snapshot; only valid with nothing pending
    pub fn reset(&mut self, snapshot: &DocumentSnapshot) -> Result<()> {
        if self.has_pending() {
            return Err(CollaborationError::InvalidOp(
                "cannot reset with local edits pending".to_string(),
            ));
        }
        self.content = snapshot.content.clone();
        self.version = snapshot.version;
        Ok(())
    }

    fn expect_next(&self, version: u64) -> Result<()> {
        let expected = self.version + 1;
        if version != expected {
            return Err(CollaborationError::OutOfOrder {
                expected,
                received: version,
            });
        }
        Ok(())
    }

    fn send(&mut self, ops: Vec<TextOp>) -> Option<TextOperation> {
        if ops.is_empty() {
            return None;
        }
        let operation = TextOperation::new(self.user_id, self.version, self.clock, ops);
        self.in_flight = Some(operation.clone());
        Some(operation)
    }
}
