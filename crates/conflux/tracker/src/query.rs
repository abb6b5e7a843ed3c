//! Lazy, restartable run queries
//!
//! A [`RunQuery`] fetches pages on demand as its stream is polled. Calling
//! [`RunQuery::stream`] again restarts from the newest run.

use crate::error::Result;
use crate::tracker::{QueryCursor, RunFilter, RunSnapshot, RunTracker};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::collections::VecDeque;
use std::sync::Arc;

const DEFAULT_PAGE_SIZE: usize = 100;

/// A query over the run tracker, ordered by creation time descending
#[derive(Clone)]
pub struct RunQuery {
    tracker: Arc<dyn RunTracker>,
    filter: RunFilter,
    page_size: usize,
}

struct PageState {
    cursor: Option<QueryCursor>,
    buffer: VecDeque<RunSnapshot>,
    exhausted: bool,
    remaining: Option<usize>,
}

impl RunQuery {
    pub fn new(tracker: Arc<dyn RunTracker>, filter: RunFilter) -> Self {
        Self {
            tracker,
            filter,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn filter(&self) -> &RunFilter {
        &self.filter
    }

    /// Stream matching snapshots, fetching pages lazily
    pub fn stream(&self) -> BoxStream<'static, Result<RunSnapshot>> {
        let tracker = self.tracker.clone();
        let filter = self.filter.clone();
        let page_size = self.page_size;
        let state = PageState {
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
            remaining: filter.limit,
        };

        stream::unfold(
            (tracker, filter, state),
            move |(tracker, filter, mut state)| async move {
                loop {
                    if state.remaining == Some(0) {
                        return None;
                    }
                    if let Some(snapshot) = state.buffer.pop_front() {
                        if let Some(remaining) = state.remaining.as_mut() {
                            *remaining -= 1;
                        }
                        return Some((Ok(snapshot), (tracker, filter, state)));
                    }
                    if state.exhausted {
                        return None;
                    }
                    match tracker
                        .query_page(&filter, state.cursor.as_ref(), page_size)
                        .await
                    {
                        Ok(page) => {
                            state.exhausted = page.next_cursor.is_none();
                            state.cursor = page.next_cursor;
                            state.buffer.extend(page.runs);
                        }
                        Err(e) => {
                            state.exhausted = true;
                            return Some((Err(e), (tracker, filter, state)));
                        }
                    }
                }
            },
        )
        .boxed()
    }

    /// Drain the whole query into memory
    pub async fn collect(&self) -> Result<Vec<RunSnapshot>> {
        self.stream().try_collect().await
    }

    /// Newest matching run, if any
    pub async fn first(&self) -> Result<Option<RunSnapshot>> {
        let mut stream = self.stream();
        stream.next().await.transpose()
    }
}

impl std::fmt::Debug for RunQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunQuery")
            .field("filter", &self.filter)
            .field("page_size", &self.page_size)
            .finish()
    }
}
