//! In-memory data adapter.
//!
//! [`MemoryAdapter`] keeps the rows of one entity type in insertion order
//! and implements the full adapter contract, including criteria operator
//! prefixes, ordering, limit and offset. Every call is recorded so tests can
//! assert on the exact traffic the entity manager produced.
//!
//! ```ignore
//! let adapter = MemoryAdapter::new("Product", ["id"]);
//! adapter.seed(Row::from([("id", Value::Int(1)), ("name", Value::from("lamp"))]));
//! assert_eq!(adapter.rows().len(), 1);
//! ```

use crate::adapter::{CriteriaOperator, EntityDataAdapter, OrderBy};
use crate::error::{AdapterError, Error, Result};
use crate::row::{Criteria, Identifier, Row};
use crate::value::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One recorded adapter call.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterCall {
    Insert(Row),
    Update(Identifier, Row),
    Delete(Identifier),
    Refresh(Identifier),
    LoadById(Identifier),
    LoadAll {
        criteria: Criteria,
        order_by: Option<OrderBy>,
        limit: Option<usize>,
        offset: Option<usize>,
    },
}

impl AdapterCall {
    /// Operation name, as used by [`MemoryAdapter::fail_on`].
    pub fn operation(&self) -> &'static str {
        match self {
            AdapterCall::Insert(_) => "insert",
            AdapterCall::Update(..) => "update",
            AdapterCall::Delete(_) => "delete",
            AdapterCall::Refresh(_) => "refresh",
            AdapterCall::LoadById(_) => "load_by_id",
            AdapterCall::LoadAll { .. } => "load_all",
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<Row>,
    next_id: i64,
    calls: Vec<AdapterCall>,
    failures: HashMap<&'static str, String>,
}

/// Row store held in memory.
#[derive(Debug)]
pub struct MemoryAdapter {
    entity: String,
    identifier: Vec<String>,
    auto_increment: bool,
    state: Mutex<MemoryState>,
}

impl MemoryAdapter {
    /// Create an empty store whose rows are identified by `identifier`
    /// columns.
    ///
    /// A single-column identifier is auto-incremented when an inserted row
    /// leaves it null or absent.
    pub fn new<I, S>(entity: impl Into<String>, identifier: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let identifier: Vec<String> = identifier.into_iter().map(Into::into).collect();
        Self {
            entity: entity.into(),
            auto_increment: identifier.len() == 1,
            identifier,
            state: Mutex::new(MemoryState {
                next_id: 1,
                ..MemoryState::default()
            }),
        }
    }

    /// Disable identity generation; inserts must carry their identifier.
    #[must_use]
    pub fn without_auto_increment(mut self) -> Self {
        self.auto_increment = false;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a row directly, without recording a call.
    pub fn seed(&self, row: Row) {
        let mut state = self.lock();
        self.bump_identity(&mut state, &row);
        state.rows.push(row);
    }

    /// Snapshot of the stored rows.
    pub fn rows(&self) -> Vec<Row> {
        self.lock().rows.clone()
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<AdapterCall> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls of one operation.
    pub fn call_count(&self, operation: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation() == operation)
            .count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Make every later call of `operation` fail with `message`.
    pub fn fail_on(&self, operation: &'static str, message: impl Into<String>) {
        self.lock().failures.insert(operation, message.into());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    fn record(&self, state: &mut MemoryState, call: AdapterCall) -> Result<()> {
        let operation = call.operation();
        tracing::trace!(entity = %self.entity, operation, "Memory adapter call");
        state.calls.push(call);
        match state.failures.get(operation) {
            Some(message) => Err(self.error(operation, message.clone())),
            None => Ok(()),
        }
    }

    fn error(&self, operation: &'static str, message: impl Into<String>) -> Error {
        AdapterError::new(self.entity.clone(), operation, message).into()
    }

    fn bump_identity(&self, state: &mut MemoryState, row: &Row) {
        if let [column] = self.identifier.as_slice() {
            if let Some(id) = row.get(column).and_then(Value::as_i64) {
                state.next_id = state.next_id.max(id + 1);
            }
        }
    }

    fn identifier_of(&self, row: &Row) -> Identifier {
        self.identifier
            .iter()
            .map(|column| (column.clone(), row.get(column).cloned().unwrap_or(Value::Null)))
            .collect()
    }

    fn position(state: &MemoryState, identifier: &Identifier) -> Option<usize> {
        state.rows.iter().position(|row| {
            identifier
                .iter()
                .all(|(column, value)| row.get(column).is_some_and(|v| values_equal(v, value)))
        })
    }
}

impl EntityDataAdapter for MemoryAdapter {
    fn insert(&self, row: &Row) -> Result<Identifier> {
        let mut state = self.lock();
        self.record(&mut state, AdapterCall::Insert(row.clone()))?;

        let mut stored = row.clone();
        if self.auto_increment {
            if let [column] = self.identifier.as_slice() {
                if stored.get(column).is_none_or(Value::is_null) {
                    let id = state.next_id;
                    stored.insert(column.clone(), id);
                }
            }
        }

        let identifier = self.identifier_of(&stored);
        if identifier.iter().any(|(_, v)| v.is_null()) {
            return Err(self.error("insert", "row carries no identifier"));
        }
        if Self::position(&state, &identifier).is_some() {
            return Err(self.error("insert", format!("duplicate identifier {identifier:?}")));
        }
        self.bump_identity(&mut state, &stored);
        state.rows.push(stored);
        Ok(identifier)
    }

    fn update(&self, identifier: &Identifier, row: &Row) -> Result<()> {
        let mut state = self.lock();
        self.record(&mut state, AdapterCall::Update(identifier.clone(), row.clone()))?;
        let Some(index) = Self::position(&state, identifier) else {
            return Err(self.error("update", format!("no row for {identifier:?}")));
        };
        let stored = &mut state.rows[index];
        for (column, value) in row {
            stored.insert(column, value.clone());
        }
        Ok(())
    }

    fn delete(&self, identifier: &Identifier) -> Result<()> {
        let mut state = self.lock();
        self.record(&mut state, AdapterCall::Delete(identifier.clone()))?;
        match Self::position(&state, identifier) {
            Some(index) => {
                state.rows.remove(index);
                Ok(())
            }
            None => Err(self.error("delete", format!("no row for {identifier:?}"))),
        }
    }

    fn refresh(&self, identifier: &Identifier) -> Result<Option<Row>> {
        let mut state = self.lock();
        self.record(&mut state, AdapterCall::Refresh(identifier.clone()))?;
        Ok(Self::position(&state, identifier).map(|i| state.rows[i].clone()))
    }

    fn load_by_id(&self, identifier: &Identifier) -> Result<Option<Row>> {
        let mut state = self.lock();
        self.record(&mut state, AdapterCall::LoadById(identifier.clone()))?;
        Ok(Self::position(&state, identifier).map(|i| state.rows[i].clone()))
    }

    fn load_all(
        &self,
        criteria: &Criteria,
        order_by: Option<&OrderBy>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Row>> {
        let mut state = self.lock();
        self.record(
            &mut state,
            AdapterCall::LoadAll {
                criteria: criteria.clone(),
                order_by: order_by.cloned(),
                limit,
                offset,
            },
        )?;

        let mut filters = Vec::with_capacity(criteria.len());
        for (key, expected) in criteria {
            let (operator, column) = CriteriaOperator::parse_key(key);
            let operator = operator
                .ok_or_else(|| self.error("load_all", format!("unsupported criteria key \"{key}\"")))?;
            filters.push((operator, column, expected));
        }

        let mut rows: Vec<Row> = state
            .rows
            .iter()
            .filter(|row| {
                filters.iter().all(|(operator, column, expected)| {
                    let actual = row.get(column).unwrap_or(&Value::Null);
                    matches(*operator, actual, expected)
                })
            })
            .cloned()
            .collect();

        if let Some(order_by) = order_by {
            rows.sort_by(|a, b| {
                for (column, order) in order_by.iter() {
                    let left = a.get(column).unwrap_or(&Value::Null);
                    let right = b.get(column).unwrap_or(&Value::Null);
                    let ord = left.compare(right).unwrap_or(Ordering::Equal);
                    let ord = match order {
                        crate::adapter::Order::Asc => ord,
                        crate::adapter::Order::Desc => ord.reverse(),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        Ok(rows
            .into_iter()
            .skip(offset.unwrap_or(0))
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    a == b || (!a.is_null() && !b.is_null() && a.compare(b) == Some(Ordering::Equal))
}

fn matches(operator: CriteriaOperator, actual: &Value, expected: &Value) -> bool {
    match operator {
        CriteriaOperator::Eq => values_equal(actual, expected),
        CriteriaOperator::Ne => !values_equal(actual, expected),
        CriteriaOperator::Gt => ordered(actual, expected, Ordering::is_gt),
        CriteriaOperator::Ge => ordered(actual, expected, Ordering::is_ge),
        CriteriaOperator::Lt => ordered(actual, expected, Ordering::is_lt),
        CriteriaOperator::Le => ordered(actual, expected, Ordering::is_le),
        CriteriaOperator::Like => match (actual.as_str(), expected.as_str()) {
            (Some(haystack), Some(needle)) => haystack.contains(needle.trim_matches('%')),
            _ => false,
        },
        CriteriaOperator::Contains => {
            let array = match actual {
                Value::Json(json) => json.clone(),
                Value::Text(text) => match serde_json::from_str(text) {
                    Ok(json) => json,
                    Err(_) => return false,
                },
                _ => return false,
            };
            let needle = to_json(expected);
            array
                .as_array()
                .is_some_and(|items| items.iter().any(|item| *item == needle))
        }
    }
}

fn ordered(actual: &Value, expected: &Value, accept: fn(Ordering) -> bool) -> bool {
    if actual.is_null() || expected.is_null() {
        return false;
    }
    actual.compare(expected).is_some_and(accept)
}

fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Value::from(*f),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::DateTime(dt) => serde_json::Value::String(dt.to_rfc3339()),
        Value::Json(json) => json.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(id: i64, name: &str, price: f64) -> Row {
        Row::new()
            .with("id", id)
            .with("name", name)
            .with("price", price)
    }

    fn seeded() -> MemoryAdapter {
        let adapter = MemoryAdapter::new("Product", ["id"]);
        adapter.seed(product(1, "lamp", 25.0));
        adapter.seed(product(2, "desk", 120.0));
        adapter.seed(product(3, "desk lamp", 40.0));
        adapter
    }

    #[test]
    fn test_insert_assigns_identity() {
        let adapter = seeded();
        let id = adapter
            .insert(&Row::new().with("name", "chair").with("price", 60.0))
            .unwrap();
        assert_eq!(id, Identifier::from([("id", 4_i64)]));
        assert_eq!(adapter.rows().len(), 4);
        assert_eq!(adapter.call_count("insert"), 1);
    }

    #[test]
    fn test_insert_rejects_duplicate_identifier() {
        let adapter = seeded();
        let err = adapter.insert(&product(2, "again", 1.0)).unwrap_err();
        assert!(matches!(err, Error::Adapter(_)));
    }

    #[test]
    fn test_update_and_delete() {
        let adapter = seeded();
        let id = Identifier::from([("id", 2_i64)]);
        adapter.update(&id, &Row::new().with("price", 99.0)).unwrap();
        let row = adapter.load_by_id(&id).unwrap().unwrap();
        assert_eq!(row.get("price"), Some(&Value::Float(99.0)));
        assert_eq!(row.get("name"), Some(&Value::from("desk")));

        adapter.delete(&id).unwrap();
        assert!(adapter.load_by_id(&id).unwrap().is_none());
        assert!(adapter.delete(&id).is_err());
    }

    #[test]
    fn test_load_all_with_operators() {
        let adapter = seeded();
        let cheap = adapter
            .load_all(&Criteria::from([("<price", 50.0)]), None, None, None)
            .unwrap();
        assert_eq!(cheap.len(), 2);

        let lamps = adapter
            .load_all(&Criteria::from([("%name", "lamp")]), None, None, None)
            .unwrap();
        assert_eq!(lamps.len(), 2);

        let not_desk = adapter
            .load_all(&Criteria::from([("!name", "desk")]), None, None, None)
            .unwrap();
        assert_eq!(not_desk.len(), 2);

        assert!(adapter
            .load_all(&Criteria::from([("<>name", "desk")]), None, None, None)
            .is_err());
    }

    #[test]
    fn test_load_all_contains_json_member() {
        let adapter = MemoryAdapter::new("Post", ["id"]);
        adapter.seed(
            Row::new()
                .with("id", 1)
                .with("tags", serde_json::json!(["rust", "orm"])),
        );
        adapter.seed(Row::new().with("id", 2).with("tags", serde_json::json!(["go"])));
        let rows = adapter
            .load_all(&Criteria::from([("@tags", "rust")]), None, None, None)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_load_all_orders_and_pages() {
        let adapter = seeded();
        let order = OrderBy::new().desc("price");
        let rows = adapter
            .load_all(&Criteria::new(), Some(&order), Some(2), Some(1))
            .unwrap();
        let ids: Vec<_> = rows.iter().filter_map(|r| r.get("id")).cloned().collect();
        assert_eq!(ids, vec![Value::Int(3), Value::Int(1)]);
    }

    #[test]
    fn test_injected_failure_is_recorded() {
        let adapter = seeded();
        adapter.fail_on("update", "disk full");
        let err = adapter
            .update(&Identifier::from([("id", 1_i64)]), &Row::new())
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert_eq!(adapter.call_count("update"), 1);
        adapter.clear_failures();
        adapter
            .update(&Identifier::from([("id", 1_i64)]), &Row::new())
            .unwrap();
    }
}
