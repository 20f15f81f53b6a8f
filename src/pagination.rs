//! Relay pagination: argument validation, slice algebra, per-partition
//! window planning, and the connection/cursor types.
//!
//! Top-level connections slice with plain `[start, stop)` bounds computed
//! against a known size. Nested connections cannot know their partition
//! sizes up front, so the same algebra is re-expressed as expression trees
//! over the per-partition count and attached as a row-number window.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::query::{Cond, Expr, Row};

/// Validation failures for connection pagination arguments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaginationError {
    #[error("`first` must be a positive integer")]
    NonPositiveFirst,
    #[error("`last` must be a positive integer")]
    NonPositiveLast,
    #[error("`offset` must be a non-negative integer")]
    NegativeOffset,
    #[error("`offset` cannot be combined with `after` or `before`")]
    OffsetWithCursor,
    #[error("`after` must not be greater than `before`")]
    AfterExceedsBefore,
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
}

/// Raw pagination arguments as they arrive from the GraphQL layer.
#[derive(Debug, Clone, Default)]
pub struct PaginationInput {
    pub first: Option<i64>,
    pub last: Option<i64>,
    pub offset: Option<i64>,
    pub after: Option<String>,
    pub before: Option<String>,
}

impl PaginationInput {
    /// Pull pagination arguments out of a captured filter map.
    pub(crate) fn from_filters(filters: &IndexMap<String, async_graphql::Value>) -> Self {
        let int = |name: &str| -> Option<i64> {
            match filters.get(name) {
                Some(async_graphql::Value::Number(n)) => n.as_i64(),
                _ => None,
            }
        };
        let string = |name: &str| -> Option<String> {
            match filters.get(name) {
                Some(async_graphql::Value::String(s)) => Some(s.clone()),
                _ => None,
            }
        };
        PaginationInput {
            first: int("first"),
            last: int("last"),
            offset: int("offset"),
            after: string("after"),
            before: string("before"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
            && self.last.is_none()
            && self.offset.is_none()
            && self.after.is_none()
            && self.before.is_none()
    }
}

/// Validated pagination arguments. `after`/`before` are absolute indexes
/// into the ordered result (cursors already decoded, `offset` folded into
/// `after`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaginationArgs {
    pub first: Option<u64>,
    pub last: Option<u64>,
    pub after: Option<u64>,
    pub before: Option<u64>,
}

impl PaginationArgs {
    /// Validate raw arguments against the rules of the Relay pagination
    /// algorithm, capping `first`/`last` at `max_limit` when configured.
    /// With no explicit page size and a configured limit, `first` defaults
    /// to the limit.
    pub fn validate(
        input: &PaginationInput,
        max_limit: Option<u64>,
    ) -> Result<PaginationArgs, PaginationError> {
        let mut first = match input.first {
            Some(first) if first <= 0 => return Err(PaginationError::NonPositiveFirst),
            Some(first) => Some(first as u64),
            None => None,
        };
        let mut last = match input.last {
            Some(last) if last <= 0 => return Err(PaginationError::NonPositiveLast),
            Some(last) => Some(last as u64),
            None => None,
        };

        let mut after = input
            .after
            .as_deref()
            .map(|cursor| decode_cursor(cursor).map(|offset| offset + 1))
            .transpose()?;
        let before = input
            .before
            .as_deref()
            .map(decode_cursor)
            .transpose()?;

        match input.offset {
            Some(offset) if offset < 0 => return Err(PaginationError::NegativeOffset),
            Some(_) if after.is_some() || before.is_some() => {
                return Err(PaginationError::OffsetWithCursor);
            }
            Some(offset) => after = Some(offset as u64),
            None => {}
        }

        if let (Some(after), Some(before)) = (after, before) {
            if after > before {
                return Err(PaginationError::AfterExceedsBefore);
            }
        }

        if let Some(limit) = max_limit {
            first = first.map(|f| f.min(limit));
            last = last.map(|l| l.min(limit));
            if first.is_none() && last.is_none() {
                first = Some(limit);
            }
        }

        Ok(PaginationArgs {
            first,
            last,
            after,
            before,
        })
    }

    /// No argument constrains the result; nothing to window or slice.
    pub fn is_unbounded(&self) -> bool {
        self.first.is_none() && self.last.is_none() && self.after.is_none() && self.before.is_none()
    }
}

/// The Relay pagination algorithm over a known size: returns the
/// `[start, stop)` range to fetch.
pub fn queryset_slice(args: &PaginationArgs, size: u64) -> (u64, u64) {
    let mut start: u64 = 0;
    let mut stop: u64 = size;

    if let Some(after) = args.after {
        start = after.min(stop);
    }
    if let Some(before) = args.before {
        stop = before.min(stop);
    }
    if let Some(first) = args.first {
        if first < stop - start {
            stop = start + first;
        }
    }
    if let Some(last) = args.last {
        if last < stop - start {
            start = stop - last;
        }
    }

    (start, stop)
}

/// The same algebra for an unknown per-partition size: `start`/`stop` as
/// expressions over the partition count, with conditional collapse when an
/// argument exceeds the partition. Engines keep rows where
/// `start < row_number <= stop`.
pub fn partition_slice(args: &PaginationArgs) -> (Expr, Expr) {
    let mut start = Expr::Value(0);
    let mut stop = Expr::PartitionCount;

    if let Some(after) = args.after {
        start = Expr::case(
            Cond::lt(Expr::PartitionCount, Expr::value(after)),
            stop.clone(),
            Expr::value(after),
        );
    }
    if let Some(before) = args.before {
        stop = Expr::case(
            Cond::lt(Expr::PartitionCount, Expr::value(before)),
            stop.clone(),
            Expr::value(before),
        );
    }
    if let Some(first) = args.first {
        let remaining = Expr::sub(stop.clone(), start.clone());
        stop = Expr::case(
            Cond::lt(remaining, Expr::value(first)),
            stop.clone(),
            Expr::add(start.clone(), Expr::value(first)),
        );
    }
    if let Some(last) = args.last {
        let remaining = Expr::sub(stop.clone(), start.clone());
        start = Expr::case(
            Cond::lt(remaining, Expr::value(last)),
            start.clone(),
            Expr::sub(stop.clone(), Expr::value(last)),
        );
    }

    (start, stop)
}

// ----------------------------------------------------------------------
// Cursors
// ----------------------------------------------------------------------

/// Encode an absolute offset as an opaque cursor.
pub fn encode_cursor(offset: u64) -> String {
    BASE64.encode(format!("cursor:{offset}"))
}

/// Decode a cursor back to its offset.
pub fn decode_cursor(cursor: &str) -> Result<u64, PaginationError> {
    let invalid = || PaginationError::InvalidCursor(cursor.to_string());
    let decoded = BASE64.decode(cursor).map_err(|_| invalid())?;
    let text = String::from_utf8(decoded).map_err(|_| invalid())?;
    let offset = text.strip_prefix("cursor:").ok_or_else(invalid)?;
    offset.parse().map_err(|_| invalid())
}

// ----------------------------------------------------------------------
// Connection types
// ----------------------------------------------------------------------

/// Pagination state of a connection page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageInfo {
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub start_cursor: Option<String>,
    pub end_cursor: Option<String>,
    pub total_count: Option<u64>,
}

/// An edge in a connection.
#[derive(Debug, Clone)]
pub struct Edge<T> {
    pub node: T,
    pub cursor: String,
}

/// A paginated connection result.
#[derive(Debug, Clone)]
pub struct Connection<T> {
    pub edges: Vec<Edge<T>>,
    pub page_info: PageInfo,
}

impl<T> Connection<T> {
    pub fn empty() -> Connection<T> {
        Connection {
            edges: Vec::new(),
            page_info: PageInfo {
                total_count: Some(0),
                ..PageInfo::default()
            },
        }
    }

    /// Build a connection page from the sliced items.
    ///
    /// `start` is the absolute offset of the first item; `total` the size of
    /// the filtered universe.
    pub fn from_items(items: Vec<T>, start: u64, total: u64) -> Connection<T> {
        let has_next_page = start + (items.len() as u64) < total;
        let has_previous_page = start > 0;

        let edges: Vec<Edge<T>> = items
            .into_iter()
            .enumerate()
            .map(|(index, node)| Edge {
                cursor: encode_cursor(start + index as u64),
                node,
            })
            .collect();

        let page_info = PageInfo {
            has_next_page,
            has_previous_page,
            start_cursor: edges.first().map(|e| e.cursor.clone()),
            end_cursor: edges.last().map(|e| e.cursor.clone()),
            total_count: Some(total),
        };

        Connection { edges, page_info }
    }
}

/// Read the per-partition count annotation off a prefetched row set.
///
/// Nested connections cannot issue a count query; the plan annotates every
/// row with its partition's size instead, so any row can report it.
pub(crate) fn partition_count_from_rows(rows: &[Row], count_key: &str) -> u64 {
    rows.first()
        .and_then(|row| row.annotations.get(count_key))
        .and_then(JsonValue::as_u64)
        .unwrap_or(rows.len() as u64)
}
