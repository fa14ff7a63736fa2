//! Multi-key ordering of merged rows.

use std::cmp::Ordering;

use shardfan_core::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// One key of a composite ordering.
///
/// With no property the row value itself is the key (scalar projections).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderBy {
    property: Option<String>,
    direction: SortDirection,
}

impl OrderBy {
    pub fn asc(property: impl Into<String>) -> Self {
        OrderBy {
            property: Some(property.into()),
            direction: SortDirection::Ascending,
        }
    }

    pub fn desc(property: impl Into<String>) -> Self {
        OrderBy {
            property: Some(property.into()),
            direction: SortDirection::Descending,
        }
    }

    /// Orders by the row value itself.
    pub fn by_value(direction: SortDirection) -> Self {
        OrderBy {
            property: None,
            direction,
        }
    }

    pub fn property(&self) -> Option<&str> {
        self.property.as_deref()
    }

    pub fn direction(&self) -> SortDirection {
        self.direction
    }

    fn key<'a>(&self, row: &'a Value) -> Option<&'a Value> {
        match &self.property {
            Some(name) => row.property(name),
            None => Some(row),
        }
    }
}

/// Compares two keys; a missing or null key sorts before a present one.
fn compare_nulls_first(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.natural_cmp(y).unwrap_or(Ordering::Equal),
    }
}

/// Composite comparator. A descending key reverses its own comparison only;
/// ties fall through to the next key.
pub fn compare_rows(order: &[OrderBy], a: &Value, b: &Value) -> Ordering {
    for key in order {
        let cmp = compare_nulls_first(key.key(a), key.key(b));
        let cmp = match key.direction {
            SortDirection::Ascending => cmp,
            SortDirection::Descending => cmp.reverse(),
        };
        if cmp != Ordering::Equal {
            return cmp;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardfan_core::Entity;

    fn person(name: &str, age: Option<i32>) -> Value {
        Value::Entity(Entity::new("Person").with("name", name).with("age", age))
    }

    #[test]
    fn test_nulls_sort_first_ascending() {
        let order = [OrderBy::asc("age")];
        let a = person("a", None);
        let b = person("b", Some(3));
        assert_eq!(compare_rows(&order, &a, &b), Ordering::Less);
    }

    #[test]
    fn test_descending_negates_per_key_comparison() {
        // null-first then negated: null ends up last under a descending key
        let order = [OrderBy::desc("age")];
        let a = person("a", None);
        let b = person("b", Some(3));
        assert_eq!(compare_rows(&order, &a, &b), Ordering::Greater);
    }

    #[test]
    fn test_ties_fall_through_to_next_key() {
        let order = [OrderBy::desc("age"), OrderBy::asc("name")];
        let a = person("ann", Some(30));
        let b = person("bob", Some(30));
        let c = person("cat", Some(40));
        assert_eq!(compare_rows(&order, &a, &b), Ordering::Less);
        assert_eq!(compare_rows(&order, &c, &a), Ordering::Less);
    }

    #[test]
    fn test_scalar_ordering_by_value() {
        let order = [OrderBy::by_value(SortDirection::Descending)];
        assert_eq!(
            compare_rows(&order, &Value::I64(1), &Value::I64(2)),
            Ordering::Greater
        );
    }
}
