//! Paginated traversal of a key's revision history
//!
//! The iterator walks the revisions written inside an optional
//! `[min_date, max_date]` window, oldest to newest. Listing pages are pulled
//! from the backend only when the cursor moves past what has been fetched,
//! and only revision metadata is ever fetched, never document contents.
//!
//! Pages are fetched from both ends of the window. Moving forward from the
//! start pulls oldest-first pages into the head run; jumping to the end
//! pulls newest-first pages into the tail run, so `skip_end` costs one page
//! however long the history is. When the two runs meet they are merged and
//! the whole window is known.
//!
//! The cursor is one of: before the first revision, on a revision, or after
//! the last one. `skip_start`/`skip_end` place it *on* the oldest/newest
//! revision; `next` past the newest returns `None` and leaves the cursor
//! after the end, from where `previous` returns the newest again.
//!
//! An iterator is stateful and single-use; build a new one from the keep to
//! traverse again from scratch.

use datakeep_core::{KeepResult, Timestamp, VersionInfo};
use datakeep_storage::{Backend, BackendKey, VersionPage, VersionQuery};
use std::sync::Arc;
use tracing::trace;

use crate::health::HealthMonitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    BeforeStart,
    /// Index into the head run
    Head(usize),
    /// Index into the tail run
    Tail(usize),
    AfterEnd,
}

/// Revisions fetched from one end of the window, kept oldest first.
#[derive(Debug, Default)]
struct Run {
    items: Vec<VersionInfo>,
    next_page: Option<String>,
}

/// Bidirectional cursor over historical revisions of one key.
pub struct VersionIterator {
    backend: Arc<dyn Backend>,
    health: Arc<HealthMonitor>,
    key: BackendKey,
    min_date: Option<Timestamp>,
    max_date: Option<Timestamp>,
    page_size: usize,
    /// Oldest revisions of the window, contiguous from the first one
    head: Run,
    /// Newest revisions of the window, contiguous up to the last one
    tail: Run,
    /// Head covers the whole window; the tail is then always empty
    complete: bool,
    cursor: Cursor,
}

impl VersionIterator {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        health: Arc<HealthMonitor>,
        key: BackendKey,
        min_date: Option<Timestamp>,
        max_date: Option<Timestamp>,
        page_size: usize,
    ) -> Self {
        VersionIterator {
            backend,
            health,
            key,
            min_date,
            max_date,
            page_size: page_size.max(1),
            head: Run::default(),
            tail: Run::default(),
            complete: false,
            cursor: Cursor::BeforeStart,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    async fn list(&self, newest_first: bool, after: Option<String>) -> KeepResult<VersionPage> {
        let mut query = VersionQuery::new(self.page_size)
            .window(self.min_date, self.max_date)
            .after(after);
        if newest_first {
            query = query.newest_first();
        }
        let page = self
            .health
            .observe(self.backend.list_versions(&self.key, &query).await)?;
        trace!(
            target: "datakeep::keep",
            key = %self.key,
            newest_first,
            fetched = page.versions.len(),
            more = page.cursor.is_some(),
            "Version page"
        );
        Ok(page)
    }

    /// Append the tail to the head; the window is then fully known.
    fn merge_tail(&mut self) {
        let offset = self.head.items.len();
        self.head.items.append(&mut self.tail.items);
        if let Cursor::Tail(idx) = self.cursor {
            self.cursor = Cursor::Head(offset + idx);
        }
        self.head.next_page = None;
        self.tail = Run::default();
        self.complete = true;
    }

    /// Pull the next oldest-first page into the head.
    async fn grow_head(&mut self) -> KeepResult<()> {
        if self.complete {
            return Ok(());
        }
        let next_page = self.head.next_page.take();
        let page = self.list(false, next_page).await?;
        let meets_tail = self.tail.items.first().and_then(|first| {
            page.versions
                .iter()
                .position(|info| info.version == first.version)
        });
        match meets_tail {
            Some(pos) => {
                self.head.items.extend(page.versions.into_iter().take(pos));
                self.merge_tail();
            }
            None if page.cursor.is_none() || page.versions.is_empty() => {
                self.head.items.extend(page.versions);
                // Nothing left to meet: the tail can only repeat the head.
                if let Cursor::Tail(idx) = self.cursor {
                    let found = self.tail.items.get(idx).and_then(|under| {
                        self.head
                            .items
                            .iter()
                            .position(|info| info.version == under.version)
                    });
                    self.cursor = found.map_or(Cursor::AfterEnd, Cursor::Head);
                }
                self.tail = Run::default();
                self.head.next_page = None;
                self.complete = true;
            }
            None => {
                self.head.items.extend(page.versions);
                self.head.next_page = page.cursor;
            }
        }
        Ok(())
    }

    /// Pull the next newest-first page into the tail.
    async fn grow_tail(&mut self) -> KeepResult<()> {
        if self.complete {
            return Ok(());
        }
        let next_page = self.tail.next_page.take();
        let page = self.list(true, next_page).await?;
        let last_page = page.cursor.is_none() || page.versions.is_empty();
        let meets_head = self.head.items.last().and_then(|last| {
            page.versions
                .iter()
                .position(|info| info.version == last.version)
        });
        let mut older: Vec<VersionInfo> = match meets_head {
            Some(pos) => page.versions.into_iter().take(pos).collect(),
            None => page.versions,
        };
        older.reverse();
        let added = older.len();
        older.append(&mut self.tail.items);
        self.tail.items = older;
        self.tail.next_page = page.cursor;
        if let Cursor::Tail(idx) = self.cursor {
            self.cursor = Cursor::Tail(idx + added);
        }

        if meets_head.is_some() {
            self.merge_tail();
        } else if last_page {
            // The tail reached the oldest revision; the head is a prefix of it.
            self.head.items.clear();
            self.merge_tail();
        }
        Ok(())
    }

    /// Make sure head index `idx` is fetched if it exists at all.
    async fn ensure_head(&mut self, idx: usize) -> KeepResult<bool> {
        while idx >= self.head.items.len() && !self.complete {
            self.grow_head().await?;
        }
        Ok(idx < self.head.items.len())
    }

    fn at(&mut self, cursor: Cursor) -> Option<VersionInfo> {
        self.cursor = cursor;
        self.current()
    }

    /// Move back `steps` revisions, stopping on the oldest.
    async fn back(&mut self, steps: usize) -> KeepResult<Option<VersionInfo>> {
        loop {
            match self.cursor {
                Cursor::Head(idx) => return Ok(self.at(Cursor::Head(idx.saturating_sub(steps)))),
                Cursor::Tail(idx) if idx >= steps => return Ok(self.at(Cursor::Tail(idx - steps))),
                Cursor::Tail(_) => {
                    let before = self.tail.items.len();
                    self.grow_tail().await?;
                    if matches!(self.cursor, Cursor::Tail(_)) && self.tail.items.len() == before {
                        return Ok(self.at(Cursor::Tail(0)));
                    }
                }
                Cursor::BeforeStart | Cursor::AfterEnd => return Ok(None),
            }
        }
    }

    /// Revision under the cursor.
    pub fn current(&self) -> Option<VersionInfo> {
        match self.cursor {
            Cursor::Head(idx) => self.head.items.get(idx).cloned(),
            Cursor::Tail(idx) => self.tail.items.get(idx).cloned(),
            _ => None,
        }
    }

    /// Move one revision forward.
    pub async fn next(&mut self) -> KeepResult<Option<VersionInfo>> {
        let target = match self.cursor {
            Cursor::BeforeStart => 0,
            Cursor::Head(idx) => idx + 1,
            Cursor::Tail(idx) if idx + 1 < self.tail.items.len() => {
                return Ok(self.at(Cursor::Tail(idx + 1)));
            }
            Cursor::Tail(_) | Cursor::AfterEnd => {
                self.cursor = Cursor::AfterEnd;
                return Ok(None);
            }
        };
        if self.ensure_head(target).await? {
            Ok(self.at(Cursor::Head(target)))
        } else {
            self.cursor = Cursor::AfterEnd;
            Ok(None)
        }
    }

    /// Move one revision backward.
    pub async fn previous(&mut self) -> KeepResult<Option<VersionInfo>> {
        match self.cursor {
            Cursor::BeforeStart => Ok(None),
            Cursor::AfterEnd => self.skip_end().await,
            Cursor::Head(0) => {
                self.cursor = Cursor::BeforeStart;
                Ok(None)
            }
            Cursor::Head(idx) => Ok(self.at(Cursor::Head(idx - 1))),
            Cursor::Tail(idx) if idx > 0 => Ok(self.at(Cursor::Tail(idx - 1))),
            Cursor::Tail(_) => {
                self.grow_tail().await?;
                match self.cursor {
                    Cursor::Tail(idx) if idx > 0 => Ok(self.at(Cursor::Tail(idx - 1))),
                    Cursor::Head(idx) if idx > 0 => Ok(self.at(Cursor::Head(idx - 1))),
                    _ => {
                        self.cursor = Cursor::BeforeStart;
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Jump forward a full page, stopping on the newest revision.
    pub async fn page_down(&mut self) -> KeepResult<Option<VersionInfo>> {
        let target = match self.cursor {
            Cursor::BeforeStart => self.page_size - 1,
            Cursor::Head(idx) => idx + self.page_size,
            Cursor::Tail(idx) => {
                let newest = self.tail.items.len().saturating_sub(1);
                return Ok(self.at(Cursor::Tail((idx + self.page_size).min(newest))));
            }
            Cursor::AfterEnd => return Ok(None),
        };
        if self.ensure_head(target).await? {
            return Ok(self.at(Cursor::Head(target)));
        }
        match self.head.items.len() {
            0 => Ok(None),
            len => Ok(self.at(Cursor::Head(len - 1))),
        }
    }

    /// Jump back a full page, stopping on the oldest revision.
    pub async fn page_up(&mut self) -> KeepResult<Option<VersionInfo>> {
        match self.cursor {
            Cursor::BeforeStart => Ok(None),
            Cursor::AfterEnd => {
                if self.skip_end().await?.is_none() {
                    return Ok(None);
                }
                self.back(self.page_size - 1).await
            }
            _ => self.back(self.page_size).await,
        }
    }

    /// Place the cursor on the oldest revision in the window.
    pub async fn skip_start(&mut self) -> KeepResult<Option<VersionInfo>> {
        if self.ensure_head(0).await? {
            Ok(self.at(Cursor::Head(0)))
        } else {
            self.cursor = Cursor::BeforeStart;
            Ok(None)
        }
    }

    /// Place the cursor on the newest revision in the window.
    pub async fn skip_end(&mut self) -> KeepResult<Option<VersionInfo>> {
        if self.tail.items.is_empty() {
            self.grow_tail().await?;
        }
        if let Some(newest) = self.tail.items.len().checked_sub(1) {
            return Ok(self.at(Cursor::Tail(newest)));
        }
        match self.head.items.len() {
            0 => {
                self.cursor = Cursor::BeforeStart;
                Ok(None)
            }
            len => Ok(self.at(Cursor::Head(len - 1))),
        }
    }

    /// Revisions fetched so far from either end.
    fn fetched(&self) -> usize {
        self.head.items.len() + self.tail.items.len()
    }
}

impl std::fmt::Debug for VersionIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionIterator")
            .field("key", &self.key)
            .field("cursor", &self.cursor)
            .field("fetched", &self.fetched())
            .field("complete", &self.complete)
            .finish()
    }
}
