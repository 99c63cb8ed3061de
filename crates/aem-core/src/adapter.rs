//! Data adapter contract.
//!
//! An [`EntityDataAdapter`] is the row store behind one entity type. It
//! speaks storage column names only; the persister translates field names
//! before every call and after every result.

use crate::error::Result;
use crate::row::{Criteria, Identifier, Row};
use crate::validate::split_criteria_key;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Order::Asc => f.write_str("ASC"),
            Order::Desc => f.write_str("DESC"),
        }
    }
}

/// Ordered list of sort keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderBy {
    keys: Vec<(String, Order)>,
}

impl OrderBy {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn asc(mut self, name: impl Into<String>) -> Self {
        self.keys.push((name.into(), Order::Asc));
        self
    }

    #[must_use]
    pub fn desc(mut self, name: impl Into<String>) -> Self {
        self.keys.push((name.into(), Order::Desc));
        self
    }

    pub fn push(&mut self, name: impl Into<String>, order: Order) {
        self.keys.push((name.into(), order));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Order)> {
        self.keys.iter().map(|(name, order)| (name.as_str(), *order))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Rename every key through `rename`, keeping the directions.
    #[must_use]
    pub fn map_names(&self, mut rename: impl FnMut(&str) -> String) -> Self {
        Self {
            keys: self
                .keys
                .iter()
                .map(|(name, order)| (rename(name), *order))
                .collect(),
        }
    }
}

impl<K: Into<String>> FromIterator<(K, Order)> for OrderBy {
    fn from_iter<I: IntoIterator<Item = (K, Order)>>(iter: I) -> Self {
        Self {
            keys: iter.into_iter().map(|(k, o)| (k.into(), o)).collect(),
        }
    }
}

/// Comparison carried by a criteria key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriteriaOperator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    /// Substring match.
    Like,
    /// Membership in a JSON array.
    Contains,
}

impl CriteriaOperator {
    /// Operator for a key prefix, `None` for unsupported prefixes.
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Some(match prefix {
            "" | "=" | "==" => CriteriaOperator::Eq,
            "!" | "!=" => CriteriaOperator::Ne,
            ">" => CriteriaOperator::Gt,
            ">=" => CriteriaOperator::Ge,
            "<" => CriteriaOperator::Lt,
            "<=" => CriteriaOperator::Le,
            "%" => CriteriaOperator::Like,
            "@" => CriteriaOperator::Contains,
            _ => return None,
        })
    }

    /// Split a criteria key into its operator and name.
    pub fn parse_key(key: &str) -> (Option<Self>, &str) {
        let (prefix, name) = split_criteria_key(key);
        (Self::from_prefix(prefix), name)
    }
}

/// Row store for one entity type.
pub trait EntityDataAdapter: Send + Sync {
    /// Insert a row and return the identifier the store assigned or kept.
    ///
    /// The returned identifier may be partial; the persister reloads the
    /// full row with [`load_by_id`](Self::load_by_id).
    fn insert(&self, row: &Row) -> Result<Identifier>;

    fn update(&self, identifier: &Identifier, row: &Row) -> Result<()>;

    fn delete(&self, identifier: &Identifier) -> Result<()>;

    /// Current row for `identifier`, or `None` if it no longer exists.
    fn refresh(&self, identifier: &Identifier) -> Result<Option<Row>>;

    fn load_by_id(&self, identifier: &Identifier) -> Result<Option<Row>>;

    /// Rows matching `criteria`, in store order unless `order_by` is given.
    fn load_all(
        &self,
        criteria: &Criteria,
        order_by: Option<&OrderBy>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Row>>;
}

/// Source of adapters by entity name.
pub trait DataAdapterProvider: Send + Sync {
    fn adapter_for(&self, entity: &str) -> Option<Arc<dyn EntityDataAdapter>>;
}

/// Adapters registered up front.
#[derive(Default)]
pub struct StaticAdapterProvider {
    adapters: HashMap<String, Arc<dyn EntityDataAdapter>>,
}

impl StaticAdapterProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entity: impl Into<String>, adapter: Arc<dyn EntityDataAdapter>) {
        self.adapters.insert(entity.into(), adapter);
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl fmt::Debug for StaticAdapterProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.adapters.keys().collect();
        names.sort();
        f.debug_struct("StaticAdapterProvider")
            .field("entities", &names)
            .finish()
    }
}

impl DataAdapterProvider for StaticAdapterProvider {
    fn adapter_for(&self, entity: &str) -> Option<Arc<dyn EntityDataAdapter>> {
        self.adapters.get(entity).cloned()
    }
}
