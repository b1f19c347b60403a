//! Caller-supplied filter trees, sort lists and list requests.

use crate::error::AppError;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    StartsWith,
    EndsWith,
    Contains,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    Between,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Like => "like",
            Operator::StartsWith => "starts_with",
            Operator::EndsWith => "ends_with",
            Operator::Contains => "contains",
            Operator::In => "in",
            Operator::NotIn => "not_in",
            Operator::IsNull => "is_null",
            Operator::IsNotNull => "is_not_null",
            Operator::Between => "between",
        }
    }

    pub fn is_ordering(&self) -> bool {
        matches!(self, Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte | Operator::Between)
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self, Operator::Like | Operator::StartsWith | Operator::EndsWith | Operator::Contains)
    }
}

impl FromStr for Operator {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "eq" => Operator::Eq,
            "ne" => Operator::Ne,
            "gt" => Operator::Gt,
            "gte" => Operator::Gte,
            "lt" => Operator::Lt,
            "lte" => Operator::Lte,
            "like" => Operator::Like,
            "starts_with" => Operator::StartsWith,
            "ends_with" => Operator::EndsWith,
            "contains" => Operator::Contains,
            "in" => Operator::In,
            "not_in" => Operator::NotIn,
            "is_null" => Operator::IsNull,
            "is_not_null" => Operator::IsNotNull,
            "between" => Operator::Between,
            other => return Err(AppError::field("filter.op", format!("unknown operator '{}'", other))),
        })
    }
}

/// Boolean tree of conditions: `{"and": [..]}`, `{"or": [..]}` or `{"field", "op", "value"}`.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterNode {
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Condition {
        field: String,
        op: Operator,
        value: Value,
    },
}

impl FilterNode {
    pub fn parse(v: &Value) -> Result<Self, AppError> {
        Self::parse_at(v, "filter")
    }

    fn parse_at(v: &Value, path: &str) -> Result<Self, AppError> {
        let obj = v
            .as_object()
            .ok_or_else(|| AppError::field(path, "filter node must be an object"))?;
        if let Some(children) = group(obj, "and", path)? {
            return Ok(FilterNode::And(children));
        }
        if let Some(children) = group(obj, "or", path)? {
            return Ok(FilterNode::Or(children));
        }
        let field = obj
            .get("field")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::field(path, "condition needs a 'field' string"))?;
        let op = obj
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::field(path, "condition needs an 'op' string"))?
            .parse::<Operator>()?;
        if let Some(extra) = obj.keys().find(|k| !matches!(k.as_str(), "field" | "op" | "value")) {
            return Err(AppError::field(path, format!("unexpected key '{}'", extra)));
        }
        Ok(FilterNode::Condition {
            field: field.to_string(),
            op,
            value: obj.get("value").cloned().unwrap_or(Value::Null),
        })
    }

    /// Conjunction of `field = value` pairs, as given by plain query-string parameters.
    pub fn equalities(pairs: Vec<(String, Value)>) -> Option<Self> {
        if pairs.is_empty() {
            return None;
        }
        Some(FilterNode::And(
            pairs
                .into_iter()
                .map(|(field, value)| FilterNode::Condition {
                    field,
                    op: Operator::Eq,
                    value,
                })
                .collect(),
        ))
    }
}

fn group(obj: &Map<String, Value>, key: &str, path: &str) -> Result<Option<Vec<FilterNode>>, AppError> {
    let Some(v) = obj.get(key) else { return Ok(None) };
    if obj.len() != 1 {
        return Err(AppError::field(path, format!("'{}' group must be the only key", key)));
    }
    let items = v
        .as_array()
        .ok_or_else(|| AppError::field(path, format!("'{}' must be an array", key)))?;
    items
        .iter()
        .enumerate()
        .map(|(i, c)| FilterNode::parse_at(c, &format!("{}.{}[{}]", path, key, i)))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

impl<'de> Deserialize<'de> for FilterNode {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(d)?;
        FilterNode::parse(&v).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub direction: Direction,
}

/// Parse `a,-b` into ascending `a`, descending `b`.
pub fn parse_sort(s: &str) -> Vec<SortSpec> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.strip_prefix('-') {
            Some(field) => SortSpec {
                field: field.to_string(),
                direction: Direction::Desc,
            },
            None => SortSpec {
                field: p.strip_prefix('+').unwrap_or(p).to_string(),
                direction: Direction::Asc,
            },
        })
        .collect()
}

/// Full list request: JSON body of `POST …/records/query`, or built from GET query parameters.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    pub filter: Option<FilterNode>,
    #[serde(default)]
    pub sort: Vec<SortSpec>,
    #[serde(default, alias = "q")]
    pub search: Option<String>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_nested_groups() {
        let f = FilterNode::parse(&json!({
            "or": [
                {"field": "name", "op": "starts_with", "value": "A"},
                {"and": [{"field": "age", "op": "gte", "value": 18}, {"field": "email", "op": "is_not_null"}]}
            ]
        }))
        .unwrap();
        let FilterNode::Or(children) = f else { panic!("expected or") };
        assert_eq!(children.len(), 2);
        assert!(matches!(&children[1], FilterNode::And(c) if c.len() == 2));
    }

    #[test]
    fn unknown_operator_is_validation_error() {
        let err = FilterNode::parse(&json!({"field": "name", "op": "regex", "value": "x"})).unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }

    #[test]
    fn malformed_nodes_name_their_path() {
        let err = FilterNode::parse(&json!({"and": [{"field": "a", "op": "eq"}, 3]})).unwrap_err();
        match err {
            AppError::Validation { field, .. } => assert_eq!(field.as_deref(), Some("filter.and[1]")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn sort_string() {
        let s = parse_sort("name,-created_at, ");
        assert_eq!(s.len(), 2);
        assert_eq!(s[1].field, "created_at");
        assert_eq!(s[1].direction, Direction::Desc);
    }

    #[test]
    fn list_request_accepts_q_alias() {
        let r: ListRequest = serde_json::from_value(json!({"q": "ada", "sort": [{"field": "name", "direction": "desc"}]})).unwrap();
        assert_eq!(r.search.as_deref(), Some("ada"));
        assert_eq!(r.sort[0].direction, Direction::Desc);
    }
}
