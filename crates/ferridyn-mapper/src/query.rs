//! Query planner: a chainable query/scan builder and a paging result iterator.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::codec;
use crate::error::{Error, QueryError, Result};
use crate::expression::{CompiledExpression, ExpressionCompiler, Function, TermKind};
use crate::transport::{PageOutput, QueryInput, ScanInput, Transport};
use crate::types::{AttributeMap, AttributeValue};

/// Builder for a query (hash filter set) or a scan (no hash filter).
///
/// Construction errors are stored and returned by [`Query::run`]; once an
/// error is stored every further builder call is a no-op.
pub struct Query<T> {
    transport: Arc<T>,
    table: String,
    index: Option<String>,
    compiler: ExpressionCompiler,
    hash: Option<CompiledExpression>,
    range: Option<CompiledExpression>,
    filter: Option<CompiledExpression>,
    scan_forward: bool,
    consistent: bool,
    limit: Option<usize>,
    err: Option<Error>,
}

impl<T> Query<T> {
    pub(crate) fn new(transport: Arc<T>, table: &str) -> Self {
        Self {
            transport,
            table: table.to_string(),
            index: None,
            compiler: ExpressionCompiler::new(),
            hash: None,
            range: None,
            filter: None,
            scan_forward: true,
            consistent: false,
            limit: None,
            err: table
                .is_empty()
                .then(|| QueryError::EmptyTableName.into()),
        }
    }

    /// Query or scan a secondary index instead of the table.
    pub fn index(mut self, name: &str) -> Self {
        if self.err.is_none() {
            self.index = Some(name.to_string());
        }
        self
    }

    /// Select the partition: `name = value`.
    pub fn hash_filter(mut self, name: &str, value: impl Into<Value>) -> Self {
        if self.err.is_some() {
            return self;
        }
        if name.is_empty() {
            self.err = Some(
                QueryError::InvalidHashFilter("empty attribute name".to_string()).into(),
            );
            return self;
        }
        if self.hash.is_some() {
            self.err = Some(
                QueryError::InvalidHashFilter("hash filter already set".to_string()).into(),
            );
            return self;
        }
        match self.compiler.compile(&format!("{name} = :hv"), &[value.into()]) {
            Ok(c) => self.hash = Some(c),
            Err(e) => self.err = Some(e.into()),
        }
        self
    }

    /// Restrict the range key. Accepts one comparison, `BETWEEN` or
    /// `begins_with` term.
    pub fn range_filter(mut self, expr: &str, values: &[Value]) -> Self {
        if self.err.is_some() {
            return self;
        }
        if self.range.is_some() {
            self.err = Some(
                QueryError::InvalidRangeFilter("range filter already set".to_string()).into(),
            );
            return self;
        }
        let compiled = match self.compiler.compile(expr, values) {
            Ok(c) => c,
            Err(e) => {
                self.err = Some(e.into());
                return self;
            }
        };
        match compiled.single_term() {
            Some(
                TermKind::Comparison
                | TermKind::Between
                | TermKind::Function(Function::BeginsWith),
            ) => self.range = Some(compiled),
            _ => self.err = Some(QueryError::InvalidRangeFilter(expr.to_string()).into()),
        }
        self
    }

    /// Add a post filter. Repeated filters are joined with `AND`.
    pub fn filter(mut self, expr: &str, values: &[Value]) -> Self {
        if self.err.is_some() {
            return self;
        }
        let compiled = self
            .compiler
            .compile(expr, values)
            .and_then(|c| match self.filter.take() {
                Some(existing) => existing.and(c),
                None => Ok(c),
            });
        match compiled {
            Ok(c) => self.filter = Some(c),
            Err(e) => self.err = Some(e.into()),
        }
        self
    }

    /// Return items in descending range-key order.
    pub fn desc(mut self) -> Self {
        self.scan_forward = false;
        self
    }

    /// Request a strongly consistent read.
    pub fn consistent(mut self) -> Self {
        self.consistent = true;
        self
    }

    /// Cap the total number of items returned across all pages.
    pub fn limit(mut self, n: usize) -> Self {
        if self.err.is_none() {
            if n == 0 {
                self.err = Some(QueryError::InvalidLimit.into());
            } else {
                self.limit = Some(n);
            }
        }
        self
    }

    /// The first construction error, if any.
    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    fn into_request(self) -> Result<(Arc<T>, PageRequest, Option<usize>)> {
        if let Some(err) = self.err {
            return Err(err);
        }

        let request = match self.hash {
            Some(hash) => {
                let key = match self.range {
                    Some(range) => hash.and(range)?,
                    None => hash,
                };
                let (names, values) = merged_attributes(Some(&key), self.filter.as_ref());
                PageRequest::Query(QueryInput {
                    table: self.table,
                    index_name: self.index,
                    key_condition_expression: key.expression().to_string(),
                    filter_expression: self.filter.as_ref().map(|f| f.expression().to_string()),
                    expression_attribute_names: names,
                    expression_attribute_values: values,
                    limit: self.limit,
                    scan_index_forward: self.scan_forward,
                    consistent_read: self.consistent,
                    exclusive_start_key: None,
                })
            }
            None => {
                let filter = match (self.filter, self.range) {
                    (Some(f), Some(r)) => Some(f.and(r)?),
                    (f, r) => f.or(r),
                };
                let (names, values) = merged_attributes(filter.as_ref(), None);
                PageRequest::Scan(ScanInput {
                    table: self.table,
                    index_name: self.index,
                    filter_expression: filter.as_ref().map(|f| f.expression().to_string()),
                    expression_attribute_names: names,
                    expression_attribute_values: values,
                    limit: self.limit,
                    consistent_read: self.consistent,
                    exclusive_start_key: None,
                })
            }
        };

        Ok((self.transport, request, self.limit))
    }
}

impl<T: Transport> Query<T> {
    /// Issue the first page and return an iterator over the results.
    pub async fn run(self) -> Result<ResultIterator<T>> {
        let (transport, request, limit) = self.into_request()?;
        let mut iter = ResultIterator {
            transport,
            request,
            items: VecDeque::new(),
            last_key: None,
            limit,
            fetched: 0,
        };
        iter.fetch_page(None).await?;
        Ok(iter)
    }
}

type ExpressionAttributes = (BTreeMap<String, String>, BTreeMap<String, AttributeValue>);

fn merged_attributes(
    first: Option<&CompiledExpression>,
    second: Option<&CompiledExpression>,
) -> ExpressionAttributes {
    let mut names = BTreeMap::new();
    let mut values = BTreeMap::new();
    for c in first.into_iter().chain(second) {
        names.extend(c.names().iter().map(|(k, v)| (k.clone(), v.clone())));
        values.extend(c.values().iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    (names, values)
}

enum PageRequest {
    Query(QueryInput),
    Scan(ScanInput),
}

/// Iterator over the items of a query or scan, fetching pages on demand.
pub struct ResultIterator<T> {
    transport: Arc<T>,
    request: PageRequest,
    items: VecDeque<AttributeMap>,
    last_key: Option<AttributeMap>,
    limit: Option<usize>,
    fetched: usize,
}

impl<T: Transport> ResultIterator<T> {
    fn remaining(&self) -> Option<usize> {
        self.limit.map(|l| l.saturating_sub(self.fetched))
    }

    async fn fetch_page(&mut self, start: Option<AttributeMap>) -> Result<()> {
        let start_given = start.is_some();
        let remaining = self.remaining();
        let page: PageOutput = match &mut self.request {
            PageRequest::Query(input) => {
                input.exclusive_start_key = start;
                input.limit = remaining;
                self.transport
                    .query(input.clone())
                    .await
                    .map_err(Error::transport("query"))?
            }
            PageRequest::Scan(input) => {
                input.exclusive_start_key = start;
                input.limit = remaining;
                self.transport
                    .scan(input.clone())
                    .await
                    .map_err(Error::transport("scan"))?
            }
        };

        let mut items = page.items;
        if let Some(r) = remaining {
            items.truncate(r);
        }
        debug!(
            items = items.len(),
            more = page.last_evaluated_key.is_some(),
            "fetched result page"
        );

        // An empty continuation page ends the iteration even if the store
        // hands back a key. The first page keeps its key: a filter may match
        // nothing there and still match later pages.
        self.last_key = if start_given && items.is_empty() {
            None
        } else {
            page.last_evaluated_key
        };
        self.fetched += items.len();
        self.items.extend(items);
        Ok(())
    }

    /// Whether another item is available, fetching the next page if needed.
    pub async fn has_next(&mut self) -> Result<bool> {
        if !self.items.is_empty() {
            return Ok(true);
        }
        if self.last_key.is_none() || self.remaining() == Some(0) {
            return Ok(false);
        }
        let start = self.last_key.take();
        self.fetch_page(start).await?;
        Ok(!self.items.is_empty())
    }

    /// Take the next item as its raw attribute map.
    pub async fn next_raw(&mut self) -> Result<AttributeMap> {
        if !self.has_next().await? {
            return Err(QueryError::NoMoreItems.into());
        }
        self.items.pop_front().ok_or(QueryError::NoMoreItems.into())
    }

    /// Decode and take the next item.
    pub async fn next<D: DeserializeOwned>(&mut self) -> Result<D> {
        let item = self.next_raw().await?;
        Ok(codec::from_attribute_map(&item)?)
    }

    /// Skip the next item.
    pub async fn advance(&mut self) -> Result<()> {
        self.next_raw().await.map(|_| ())
    }

    /// Decode every remaining item.
    pub async fn collect<D: DeserializeOwned>(mut self) -> Result<Vec<D>> {
        let mut out = Vec::new();
        while self.has_next().await? {
            out.push(self.next().await?);
        }
        Ok(out)
    }
}
