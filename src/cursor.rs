//! Server-side cursors and row streams.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;

use crate::client::Client;
use crate::error::{PgError, PgResult};
use crate::query::Query;
use crate::result::{Row, SharedColumns};

/// A named portal read in batches.
///
/// While a cursor is open its connection runs nothing else; queued queries
/// wait until it is closed or read to the end. Dropping an open cursor
/// closes it in the background.
pub struct Cursor<'a> {
    client: &'a Client,
    id: u64,
    columns: SharedColumns,
    finished: bool,
}

impl<'a> Cursor<'a> {
    pub(crate) async fn open(client: &'a Client, query: Query) -> PgResult<Cursor<'a>> {
        let id = client.next_cursor_id();
        let columns = client.cursor_open(id, query).await?;
        Ok(Cursor {
            client,
            id,
            columns,
            finished: false,
        })
    }

    pub fn columns(&self) -> &SharedColumns {
        &self.columns
    }

    /// Whether every row has been read.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Fetch up to `rows` more rows; 0 fetches all that remain.
    ///
    /// Returns an empty batch once the portal is exhausted, at which point
    /// the cursor has already been closed on the server.
    pub async fn read(&mut self, rows: u32) -> PgResult<Vec<Row>> {
        if self.finished {
            return Ok(Vec::new());
        }

        let batch = match self.client.cursor_read(self.id, rows).await {
            Ok(batch) => batch,
            Err(e) => {
                // The driver released the cursor with the error
                self.finished = true;
                return Err(e);
            }
        };

        if !batch.suspended {
            self.finished = true;
            self.client.cursor_close(self.id).await?;
        }
        Ok(batch.rows)
    }

    /// Close the portal and free the connection.
    pub async fn close(mut self) -> PgResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.client.cursor_close(self.id).await
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.client.cursor_close_detached(self.id);
        }
    }
}

impl std::fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("id", &self.id)
            .field("columns", &self.columns.len())
            .field("finished", &self.finished)
            .finish()
    }
}

/// Rows of a cursor as a [`Stream`], fetched `batch_size` at a time.
pub struct RowStream<'a> {
    inner: Pin<Box<dyn Stream<Item = PgResult<Row>> + Send + 'a>>,
}

impl<'a> RowStream<'a> {
    pub fn new(cursor: Cursor<'a>, batch_size: u32) -> Self {
        let batch_size = batch_size.max(1);
        let rows = futures::stream::try_unfold(
            (cursor, VecDeque::new()),
            move |(mut cursor, mut buffered)| async move {
                loop {
                    if let Some(row) = buffered.pop_front() {
                        return Ok::<_, PgError>(Some((row, (cursor, buffered))));
                    }
                    if cursor.is_finished() {
                        return Ok(None);
                    }
                    buffered.extend(cursor.read(batch_size).await?);
                }
            },
        );
        Self {
            inner: Box::pin(rows),
        }
    }
}

impl Stream for RowStream<'_> {
    type Item = PgResult<Row>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
