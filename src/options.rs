//! Per-operation options.
//!
//! # Example
//!
//! ```
//! use mongowire::FindOptions;
//! use mongowire::protocol::query_flags;
//!
//! let opts = FindOptions::new().skip(5).limit(10).slave_ok(true);
//! assert_eq!(opts.flags(), query_flags::SLAVE_OK);
//! assert_eq!(opts.initial_number_to_return(), 10);
//! ```

use bson::Document;

use crate::protocol::{delete_flags, query_flags, update_flags};

/// Options for [`Connection::update`](crate::Connection::update).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Insert when nothing matches.
    pub upsert: bool,
    /// Update all matches.
    pub multi: bool,
}

impl UpdateOptions {
    /// Create options for a plain single-document update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the update as a new document when nothing matches.
    ///
    /// Default: false
    pub fn upsert(mut self, upsert: bool) -> Self {
        self.upsert = upsert;
        self
    }

    /// Update every matching document.
    ///
    /// Default: false
    pub fn multi(mut self, multi: bool) -> Self {
        self.multi = multi;
        self
    }

    /// Wire flags for OP_UPDATE.
    pub fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.upsert {
            flags |= update_flags::UPSERT;
        }
        if self.multi {
            flags |= update_flags::MULTI;
        }
        flags
    }
}

/// Options for [`Connection::remove`](crate::Connection::remove).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Remove only the first match.
    pub single: bool,
}

impl RemoveOptions {
    /// Create options that remove every match.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove at most one document.
    ///
    /// Default: false
    pub fn single(mut self, single: bool) -> Self {
        self.single = single;
        self
    }

    /// Wire flags for OP_DELETE.
    pub fn flags(&self) -> u32 {
        if self.single {
            delete_flags::SINGLE_REMOVE
        } else {
            0
        }
    }
}

/// Options for [`Connection::find`](crate::Connection::find).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Matching documents to skip.
    pub skip: u32,
    /// Maximum documents to return in total (0 = no limit).
    pub limit: u32,
    /// Maximum documents per batch (0 = server default).
    pub batch_size: u32,
    /// Fields to return.
    pub projection: Option<Document>,
    /// Keep the cursor open after the last document.
    pub tailable: bool,
    /// Allow reads from a secondary.
    pub slave_ok: bool,
    /// Ask the server not to time out an idle cursor.
    pub no_cursor_timeout: bool,
    /// With `tailable`, let the server wait for new data.
    pub await_data: bool,
    /// Stream every batch without getMore requests.
    pub exhaust: bool,
}

impl FindOptions {
    /// Create options that return every match in server-sized batches.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of matches to skip.
    ///
    /// Default: 0
    pub fn skip(mut self, skip: u32) -> Self {
        self.skip = skip;
        self
    }

    /// Set the total number of documents to return.
    ///
    /// Default: 0 (no limit)
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// Set the number of documents per batch.
    ///
    /// Default: 0 (server default)
    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the fields to return.
    ///
    /// Default: all fields
    pub fn projection(mut self, projection: Document) -> Self {
        self.projection = Some(projection);
        self
    }

    /// Set the tailable flag.
    ///
    /// Default: false
    pub fn tailable(mut self, tailable: bool) -> Self {
        self.tailable = tailable;
        self
    }

    /// Set the slave-ok flag.
    ///
    /// Default: false
    pub fn slave_ok(mut self, slave_ok: bool) -> Self {
        self.slave_ok = slave_ok;
        self
    }

    /// Set the no-cursor-timeout flag.
    ///
    /// Default: false
    pub fn no_cursor_timeout(mut self, no_cursor_timeout: bool) -> Self {
        self.no_cursor_timeout = no_cursor_timeout;
        self
    }

    /// Set the await-data flag.
    ///
    /// Default: false
    pub fn await_data(mut self, await_data: bool) -> Self {
        self.await_data = await_data;
        self
    }

    /// Set the exhaust flag.
    ///
    /// Default: false
    pub fn exhaust(mut self, exhaust: bool) -> Self {
        self.exhaust = exhaust;
        self
    }

    /// Wire flags for OP_QUERY.
    pub fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.tailable {
            flags |= query_flags::TAILABLE;
        }
        if self.slave_ok {
            flags |= query_flags::SLAVE_OK;
        }
        if self.no_cursor_timeout {
            flags |= query_flags::NO_CURSOR_TIMEOUT;
        }
        if self.await_data {
            flags |= query_flags::AWAIT_DATA;
        }
        if self.exhaust {
            flags |= query_flags::EXHAUST;
        }
        flags
    }

    /// `numberToReturn` for the initial OP_QUERY.
    pub fn initial_number_to_return(&self) -> i32 {
        let limit = if self.limit == 0 {
            None
        } else {
            Some(i64::from(self.limit))
        };
        number_to_return(limit, self.batch_size)
    }
}

/// Documents to ask for given what is still wanted and the batch size.
///
/// `remaining` is `None` when no limit was requested. 0 leaves the choice to
/// the server.
pub(crate) fn number_to_return(remaining: Option<i64>, batch_size: u32) -> i32 {
    let batch = i64::from(batch_size);
    let wanted = match remaining {
        Some(remaining) if batch > 0 => remaining.min(batch),
        Some(remaining) => remaining,
        None => batch,
    };
    wanted.clamp(0, i64::from(i32::MAX)) as i32
}
