//! Paginators over a QuerySet.
//!
//! - [`NumberedPaginator`] slices by page number with `LIMIT`/`OFFSET`.
//! - [`CursorPaginator`] walks a keyset: each page starts strictly after
//!   (or before) the ordering values of an opaque [`Cursor`], so pages stay
//!   stable while rows are inserted elsewhere.
//!
//! Both can link every item to its neighbours, across page boundaries,
//! under caller-chosen attribute names (read back with
//! [`Instance::linked`]). Each page fetches one extra row on either side
//! it needs, so linking costs no extra query for numbered pages.

use serde::{Deserialize, Serialize};

use edgy_rs_core::{EdgyError, EdgyResult};

use crate::instance::Instance;
use crate::query::lookups::{and_, or_, LookupOp, Q, LOOKUP_SEP};
use crate::query::{OrderSpec, QuerySet};
use crate::value::Value;

/// Neighbour attribute names.
#[derive(Debug, Clone, Default)]
struct Links {
    next: Option<String>,
    previous: Option<String>,
}

impl Links {
    const fn enabled(&self) -> bool {
        self.next.is_some() || self.previous.is_some()
    }

    /// Links each item to its neighbours; `before` and `after` are the rows
    /// just outside the page.
    fn apply(&self, items: &mut [Instance], before: Option<&Instance>, after: Option<&Instance>) {
        if !self.enabled() {
            return;
        }
        let snapshot: Vec<Instance> = items.to_vec();
        for (i, item) in items.iter_mut().enumerate() {
            if let Some(attr) = &self.previous {
                let prev = if i == 0 { before } else { snapshot.get(i - 1) };
                item.set_linked(attr, prev.cloned());
            }
            if let Some(attr) = &self.next {
                let next = snapshot.get(i + 1).or(after);
                item.set_linked(attr, next.cloned());
            }
        }
    }
}

/// One page of a [`NumberedPaginator`].
#[derive(Debug, Clone)]
pub struct Page {
    /// The rows of this page.
    pub items: Vec<Instance>,
    /// The 1-based page number.
    pub number: usize,
    /// Whether a later page exists.
    pub has_next: bool,
    /// Whether an earlier page exists.
    pub has_previous: bool,
}

/// Page-number pagination.
///
/// Without an ordering the primary key is used so pages are deterministic.
#[derive(Debug, Clone)]
pub struct NumberedPaginator {
    queryset: QuerySet,
    page_size: usize,
    links: Links,
}

impl NumberedPaginator {
    /// Paginates `queryset` into pages of `page_size` rows.
    pub fn new(queryset: &QuerySet, page_size: usize) -> EdgyResult<Self> {
        if page_size == 0 {
            return Err(EdgyError::ConfigurationError(
                "page_size must be at least 1".to_string(),
            ));
        }
        let mut queryset = queryset.clone();
        if queryset.effective_ordering().is_empty() {
            queryset.order_by = queryset.pk_ordering();
        }
        Ok(Self {
            queryset,
            page_size,
            links: Links::default(),
        })
    }

    /// Links each item to the next one under `attr`.
    #[must_use]
    pub fn next_item_attr(mut self, attr: impl Into<String>) -> Self {
        self.links.next = Some(attr.into());
        self
    }

    /// Links each item to the previous one under `attr`.
    #[must_use]
    pub fn previous_item_attr(mut self, attr: impl Into<String>) -> Self {
        self.links.previous = Some(attr.into());
        self
    }

    /// Rows per page.
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Total number of rows.
    pub async fn count(&self) -> EdgyResult<usize> {
        self.queryset.count().await
    }

    /// Number of pages; an empty result still has one (empty) page.
    pub async fn num_pages(&self) -> EdgyResult<usize> {
        Ok(self.count().await?.div_ceil(self.page_size).max(1))
    }

    /// Fetches page `number` (1-based).
    ///
    /// Page 0 is a configuration error; a page past the end (other than an
    /// empty first page) is [`EdgyError::DoesNotExist`].
    pub async fn get_page(&self, number: usize) -> EdgyResult<Page> {
        if number == 0 {
            return Err(EdgyError::ConfigurationError(
                "Page numbers start at 1".to_string(),
            ));
        }
        let Some(start) = (number - 1).checked_mul(self.page_size) else {
            return Err(EdgyError::DoesNotExist(format!("Page {number} is out of range")));
        };
        let lead = usize::from(start > 0 && self.links.previous.is_some());
        let mut rows = self
            .queryset
            .offset(start - lead)
            .limit(self.page_size.saturating_add(1 + lead))
            .all()
            .await?;

        let before = if lead == 1 && !rows.is_empty() {
            Some(rows.remove(0))
        } else {
            None
        };
        let after = if rows.len() > self.page_size {
            rows.pop()
        } else {
            None
        };
        if rows.is_empty() && number > 1 {
            return Err(EdgyError::DoesNotExist(format!("Page {number} is out of range")));
        }
        self.links.apply(&mut rows, before.as_ref(), after.as_ref());
        Ok(Page {
            items: rows,
            number,
            has_next: after.is_some(),
            has_previous: number > 1,
        })
    }
}

/// An opaque position in a keyset: the ordering values of one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor(pub Vec<Value>);

impl Cursor {
    /// Renders the cursor as a string token.
    pub fn encode(&self) -> EdgyResult<String> {
        Ok(serde_json::to_string(&self.0)?)
    }

    /// Parses a token produced by [`encode`](Self::encode).
    pub fn decode(token: &str) -> EdgyResult<Self> {
        Ok(Self(serde_json::from_str(token)?))
    }
}

/// One page of a [`CursorPaginator`].
#[derive(Debug, Clone)]
pub struct CursorPage {
    /// The rows of this page, in query order.
    pub items: Vec<Instance>,
    /// Position after the last item, when a later page exists.
    pub next_cursor: Option<Cursor>,
    /// Position before the first item, when an earlier page exists.
    pub previous_cursor: Option<Cursor>,
    /// Whether a later page exists.
    pub has_next: bool,
    /// Whether an earlier page exists.
    pub has_previous: bool,
}

/// Keyset pagination.
///
/// The ordering (the primary key when none is set) gets the primary key
/// appended as a tie-break, and may only name fields of the queried model.
/// Ordering fields should be non-null; a NULL never compares after or
/// before a cursor.
#[derive(Debug, Clone)]
pub struct CursorPaginator {
    queryset: QuerySet,
    ordering: Vec<OrderSpec>,
    page_size: usize,
    links: Links,
}

impl CursorPaginator {
    /// Paginates `queryset` into pages of `page_size` rows.
    pub fn new(queryset: &QuerySet, page_size: usize) -> EdgyResult<Self> {
        if page_size == 0 {
            return Err(EdgyError::ConfigurationError(
                "page_size must be at least 1".to_string(),
            ));
        }
        let model = queryset.model();
        let mut ordering = queryset.effective_ordering();
        for spec in &ordering {
            if spec.path.contains(LOOKUP_SEP) {
                return Err(EdgyError::ConfigurationError(format!(
                    "Cursor pagination orders by fields of {} only, got '{}'",
                    model.name, spec.path
                )));
            }
            model.field_or_err(&spec.path)?;
        }
        for pk in queryset.pk_ordering() {
            if !ordering.iter().any(|s| s.path == pk.path) {
                ordering.push(pk);
            }
        }
        let mut queryset = queryset.clone();
        queryset.order_by.clone_from(&ordering);
        queryset
            .required_fields
            .extend(ordering.iter().map(|s| s.path.clone()));
        Ok(Self {
            queryset,
            ordering,
            page_size,
            links: Links::default(),
        })
    }

    /// Links each item to the next one under `attr`.
    #[must_use]
    pub fn next_item_attr(mut self, attr: impl Into<String>) -> Self {
        self.links.next = Some(attr.into());
        self
    }

    /// Links each item to the previous one under `attr`.
    #[must_use]
    pub fn previous_item_attr(mut self, attr: impl Into<String>) -> Self {
        self.links.previous = Some(attr.into());
        self
    }

    /// The ordering values of `item`.
    pub fn cursor_for(&self, item: &Instance) -> EdgyResult<Cursor> {
        self.ordering
            .iter()
            .map(|s| item.get_value(&s.path).cloned())
            .collect::<EdgyResult<_>>()
            .map(Cursor)
    }

    /// Rows strictly after (`forward`) or before the cursor values, in
    /// the matching direction. `inclusive` also admits the cursor row.
    fn keyset(&self, values: &[Value], forward: bool, inclusive: bool) -> EdgyResult<Q> {
        if values.len() != self.ordering.len() {
            return Err(EdgyError::ConfigurationError(format!(
                "Cursor has {} values, the ordering has {}",
                values.len(),
                self.ordering.len()
            )));
        }
        let mut branches = Vec::with_capacity(self.ordering.len() + 1);
        for (i, spec) in self.ordering.iter().enumerate() {
            let op = if spec.descending == forward {
                LookupOp::Lt
            } else {
                LookupOp::Gt
            };
            let mut terms: Vec<Q> = self.ordering[..i]
                .iter()
                .zip(values)
                .map(|(s, v)| Q::filter(&s.path, LookupOp::Exact, v.clone()))
                .collect();
            terms.push(Q::filter(&spec.path, op, values[i].clone()));
            branches.push(and_(terms));
        }
        if inclusive {
            branches.push(and_(
                self.ordering
                    .iter()
                    .zip(values)
                    .map(|(s, v)| Q::filter(&s.path, LookupOp::Exact, v.clone())),
            ));
        }
        Ok(or_(branches))
    }

    fn directed(&self, forward: bool) -> QuerySet {
        let mut qs = self.queryset.clone();
        if !forward {
            qs.order_by = self.ordering.iter().map(OrderSpec::reversed).collect();
        }
        qs
    }

    /// The row adjacent to the cursor position on the given side.
    async fn neighbour(&self, values: &[Value], forward: bool, inclusive: bool) -> EdgyResult<Option<Instance>> {
        let qs = self.directed(forward).filter(self.keyset(values, forward, inclusive)?).limit(1);
        Ok(qs.all().await?.into_iter().next())
    }

    /// Fetches the page after `cursor` (the first page when `None`), or the
    /// page before it when `reverse` is set.
    pub async fn get_page(&self, cursor: Option<&Cursor>, reverse: bool) -> EdgyResult<CursorPage> {
        let forward = !reverse;
        let mut qs = self.directed(forward);
        if let Some(cursor) = cursor {
            qs = qs.filter(self.keyset(&cursor.0, forward, false)?);
        }
        let mut rows = qs.limit(self.page_size.saturating_add(1)).all().await?;
        let more = if rows.len() > self.page_size {
            rows.pop()
        } else {
            None
        };
        if reverse {
            rows.reverse();
        }

        // `more` lies beyond the page in the fetch direction; the cursor
        // row lies on the other side.
        let beyond_cursor = match cursor {
            Some(c) if self.links.enabled() => self.neighbour(&c.0, !forward, true).await?,
            _ => None,
        };
        let (has_next, has_previous) = if forward {
            (more.is_some(), cursor.is_some())
        } else {
            (cursor.is_some(), more.is_some())
        };
        let (before, after) = if forward {
            (beyond_cursor, more)
        } else {
            (more, beyond_cursor)
        };
        self.links.apply(&mut rows, before.as_ref(), after.as_ref());

        let next_cursor = match rows.last() {
            Some(last) if has_next => Some(self.cursor_for(last)?),
            _ => None,
        };
        let previous_cursor = match rows.first() {
            Some(first) if has_previous => Some(self.cursor_for(first)?),
            _ => None,
        };
        Ok(CursorPage {
            items: rows,
            next_cursor,
            previous_cursor,
            has_next,
            has_previous,
        })
    }
}
