//! Cursors: lazily evaluated query descriptions.

use crate::connection::Connection;
use crate::crossbar::InvalidationKey;
use crate::error::LiveResult;
use crate::live_query::{LiveQuery, ObserveCallbacks};
use livedata_store::{Document, FindOptions, Selector};

/// Everything needed to run a query again.
#[derive(Debug, Clone)]
pub struct CursorDescription {
    /// Collection queried.
    pub collection: String,
    /// Normalized selector.
    pub selector: Selector,
    /// Sort, window and projection.
    pub options: FindOptions,
    /// Keys that invalidate live queries built from this description.
    ///
    /// Defaults to the collection key.
    pub keys: Vec<InvalidationKey>,
}

impl CursorDescription {
    /// Creates a description listening on the collection key.
    pub fn new(collection: impl Into<String>, selector: Selector, options: FindOptions) -> Self {
        let collection = collection.into();
        let keys = vec![InvalidationKey::collection(collection.clone())];
        Self {
            collection,
            selector,
            options,
            keys,
        }
    }
}

/// A query against one collection, read on demand.
///
/// The first read fetches the full result set; later reads continue from
/// the current position until [`Cursor::rewind`] is called.
#[derive(Debug)]
pub struct Cursor {
    conn: Connection,
    description: CursorDescription,
    buffer: Option<Vec<Document>>,
    position: usize,
}

impl Cursor {
    pub(crate) fn new(conn: Connection, description: CursorDescription) -> Self {
        Self {
            conn,
            description,
            buffer: None,
            position: 0,
        }
    }

    /// Returns the query this cursor runs.
    pub fn description(&self) -> &CursorDescription {
        &self.description
    }

    /// Replaces the invalidation keys used by [`Cursor::observe`].
    ///
    /// Lets several live queries share a finer-grained key than the whole
    /// collection; writers must then fire it with [`Connection::refresh`].
    #[must_use]
    pub fn invalidation_keys(mut self, keys: Vec<InvalidationKey>) -> Self {
        self.description.keys = keys;
        self
    }

    async fn buffered(&mut self) -> LiveResult<&[Document]> {
        if self.buffer.is_none() {
            let docs = self.conn.fetch(&self.description).await?;
            self.buffer = Some(docs);
        }
        Ok(self.buffer.as_deref().unwrap_or_default())
    }

    /// Returns the remaining documents and exhausts the cursor.
    pub async fn fetch(&mut self) -> LiveResult<Vec<Document>> {
        let position = self.position;
        let docs = self.buffered().await?;
        let rest = docs.get(position..).unwrap_or_default().to_vec();
        self.position += rest.len();
        Ok(rest)
    }

    /// Calls `f` on every remaining document.
    pub async fn for_each<F>(&mut self, mut f: F) -> LiveResult<()>
    where
        F: FnMut(&Document),
    {
        for doc in &self.fetch().await? {
            f(doc);
        }
        Ok(())
    }

    /// Maps every remaining document through `f`.
    pub async fn map<T, F>(&mut self, f: F) -> LiveResult<Vec<T>>
    where
        F: FnMut(&Document) -> T,
    {
        Ok(self.fetch().await?.iter().map(f).collect())
    }

    /// Resets the cursor so the next read re-runs the query.
    pub fn rewind(&mut self) {
        self.buffer = None;
        self.position = 0;
    }

    /// Counts matching documents, ignoring skip and limit.
    pub async fn count(&self) -> LiveResult<u64> {
        self.conn.count(&self.description).await
    }

    /// Starts a live query over this cursor's results.
    ///
    /// `added` fires once for every document already matching before this
    /// returns. The query keeps running until the returned handle is stopped
    /// or dropped.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the initial fetch fails; no query is
    /// left running in that case.
    pub async fn observe(&self, callbacks: ObserveCallbacks) -> LiveResult<LiveQuery> {
        LiveQuery::start(self.conn.clone(), self.description.clone(), callbacks).await
    }
}
