/// Server-side cursors as an explicit state machine
///
/// A cursor is pinned to the endpoint that created it. Every `getMore` and
/// the final `killCursors` go to that endpoint; if it goes down the cursor
/// fails instead of moving to another server.
use crate::core::{Endpoint, Preference};
use crate::dispatch::{CommandDispatcher, Operation, Reply};
use crate::error::{Error, NetworkError, NetworkErrorKind, Result};
use crate::utils::get_int;
use bson::{doc, Bson, Document};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Documents are buffered locally
    OpenWithBatch,
    /// Buffer empty, the server still holds more
    OpenNeedingFetch,
    /// Every document has been returned
    Exhausted,
    Closed,
}

impl fmt::Display for CursorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CursorState::OpenWithBatch => "open (batch buffered)",
            CursorState::OpenNeedingFetch => "open (needs fetch)",
            CursorState::Exhausted => "exhausted",
            CursorState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Single-owner handle on a server cursor. Not closed on drop: call
/// [`close`](CursorSession::close) unless the cursor was drained.
pub struct CursorSession {
    dispatcher: Arc<CommandDispatcher>,
    database: String,
    collection: String,
    id: i64,
    endpoint: Endpoint,
    preference: Preference,
    buffer: VecDeque<Document>,
    state: CursorState,
    batch_size: Option<u32>,
    seen: u64,
    get_mores: u32,
    failure: Option<String>,
}

impl fmt::Debug for CursorSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorSession")
            .field("namespace", &format_args!("{}.{}", self.database, self.collection))
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .field("buffered", &self.buffer.len())
            .field("seen", &self.seen)
            .finish()
    }
}

impl CursorSession {
    /// Build a cursor from a `find` or `aggregate` reply.
    ///
    /// `database` is used when the reply's `ns` is missing or malformed.
    pub fn from_reply(
        dispatcher: Arc<CommandDispatcher>,
        database: &str,
        reply: Reply,
        preference: Preference,
        batch_size: Option<u32>,
    ) -> Result<Self> {
        let cursor = reply.document.get_document("cursor").map_err(|_| {
            Error::network(
                reply.endpoint.clone(),
                NetworkErrorKind::Protocol,
                "reply carries no cursor document",
            )
        })?;
        let id = get_int(cursor, "id").unwrap_or(0);
        let (database, collection) = match cursor.get_str("ns").ok().and_then(|ns| ns.split_once('.')) {
            Some((db, coll)) => (db.to_string(), coll.to_string()),
            None => (database.to_string(), String::new()),
        };
        let buffer = batch(cursor, "firstBatch");

        let mut session = Self {
            dispatcher,
            database,
            collection,
            id,
            endpoint: reply.endpoint,
            preference,
            buffer,
            state: CursorState::OpenNeedingFetch,
            batch_size,
            seen: 0,
            get_mores: 0,
            failure: None,
        };
        session.refresh_state();
        debug!(
            "Opened cursor {} on {} with {} document(s)",
            session.id,
            session.endpoint,
            session.buffer.len()
        );
        Ok(session)
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Endpoint every fetch is pinned to
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn namespace(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Documents returned by `next` so far
    pub fn num_seen(&self) -> u64 {
        self.seen
    }

    pub fn num_get_mores(&self) -> u32 {
        self.get_mores
    }

    pub fn batch_size(&self) -> Option<u32> {
        self.batch_size
    }

    /// Batch size requested on later `getMore`s
    pub fn set_batch_size(&mut self, batch_size: Option<u32>) {
        self.batch_size = batch_size;
    }

    /// Documents buffered locally
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn refresh_state(&mut self) {
        if self.state == CursorState::Closed {
            return;
        }
        self.state = if !self.buffer.is_empty() {
            CursorState::OpenWithBatch
        } else if self.id != 0 {
            CursorState::OpenNeedingFetch
        } else {
            CursorState::Exhausted
        };
    }

    /// True when `next` will yield a document, fetching the next batch from
    /// the pinned endpoint if needed
    pub async fn has_next(&mut self) -> Result<bool> {
        loop {
            match self.state {
                CursorState::OpenWithBatch => return Ok(true),
                CursorState::Exhausted | CursorState::Closed => return Ok(false),
                CursorState::OpenNeedingFetch => self.get_more().await?,
            }
        }
    }

    pub async fn next(&mut self) -> Result<Document> {
        if !self.has_next().await? {
            return Err(Error::NoMoreDocuments);
        }
        let document = self.buffer.pop_front().ok_or(Error::NoMoreDocuments)?;
        self.seen += 1;
        self.refresh_state();
        Ok(document)
    }

    /// Drain every remaining document
    pub async fn to_vec(&mut self) -> Result<Vec<Document>> {
        let mut documents = Vec::new();
        while self.has_next().await? {
            documents.push(self.next().await?);
        }
        Ok(documents)
    }

    async fn get_more(&mut self) -> Result<()> {
        if let Some(reason) = &self.failure {
            return Err(Error::Network(NetworkError::new(
                self.endpoint.clone(),
                NetworkErrorKind::Unavailable,
                reason.clone(),
            )));
        }

        let mut command = doc! { "getMore": self.id, "collection": self.collection.as_str() };
        if let Some(batch_size) = self.batch_size {
            command.insert("batchSize", batch_size as i64);
        }
        let operation =
            Operation::read(self.database.as_str(), command, self.preference.clone()).pinned_to(self.endpoint.clone());

        let reply = match self.dispatcher.execute(operation).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!("getMore for cursor {} on {} failed: {}", self.id, self.endpoint, err);
                self.failure = Some(format!("cursor {} failed on {}: {}", self.id, self.endpoint, err));
                return Err(err);
            }
        };
        self.get_mores += 1;

        let cursor = reply.document.get_document("cursor").map_err(|_| {
            Error::network(
                self.endpoint.clone(),
                NetworkErrorKind::Protocol,
                "getMore reply carries no cursor document",
            )
        })?;
        self.id = get_int(cursor, "id").unwrap_or(0);
        self.buffer.extend(batch(cursor, "nextBatch"));
        self.refresh_state();
        Ok(())
    }

    /// Release the server cursor. Failures are logged, never returned.
    /// Closing twice is a no-op.
    pub async fn close(&mut self) {
        if self.state == CursorState::Closed {
            return;
        }
        let was = self.state;
        self.state = CursorState::Closed;
        self.buffer.clear();

        if self.id == 0 || was == CursorState::Exhausted {
            return;
        }
        let command = doc! { "killCursors": self.collection.as_str(), "cursors": [self.id] };
        let operation = Operation::write(self.database.as_str(), command).pinned_to(self.endpoint.clone());
        match self.dispatcher.execute(operation).await {
            Ok(_) => debug!("Killed cursor {} on {}", self.id, self.endpoint),
            Err(err) => warn!("Ignoring killCursors failure for cursor {} on {}: {}", self.id, self.endpoint, err),
        }
        self.id = 0;
    }
}

fn batch(cursor: &Document, field: &str) -> VecDeque<Document> {
    cursor
        .get_array(field)
        .map(|documents| {
            documents
                .iter()
                .filter_map(|d| match d {
                    Bson::Document(d) => Some(d.clone()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}
