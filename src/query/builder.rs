//! Validates list requests against a descriptor and lowers them to [`SelectQuery`].

use crate::error::AppError;
use crate::migration::storage::StorageType;
use crate::model::descriptor::{normalize, system_field_type};
use crate::model::ModelDescriptor;
use crate::query::filter::{Direction, FilterNode, ListRequest, Operator, SortSpec};
use crate::query::ir::*;
use crate::schema::FieldType;
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Fields callers may filter and sort on besides declared ones.
const QUERYABLE_SYSTEM_FIELDS: [&str; 5] = ["id", "created_at", "created_by", "updated_at", "updated_by"];

pub struct QueryBuilder<'a> {
    model: &'a ModelDescriptor,
    tenant_id: &'a str,
    hidden: BTreeSet<String>,
    default_page_size: u32,
    max_page_size: u32,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(model: &'a ModelDescriptor, tenant_id: &'a str) -> Self {
        QueryBuilder {
            model,
            tenant_id,
            hidden: BTreeSet::new(),
            default_page_size: 100,
            max_page_size: 1000,
        }
    }

    /// Fields the caller cannot see; filtering or sorting on them is a permission error.
    pub fn hidden(mut self, hidden: BTreeSet<String>) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn page_sizes(mut self, default: u32, max: u32) -> Self {
        self.default_page_size = default;
        self.max_page_size = max;
        self
    }

    pub fn list(&self, req: &ListRequest) -> Result<SelectQuery, AppError> {
        let mut parts = self.scope();
        if let Some(filter) = &req.filter {
            parts.push(self.filter(filter)?);
        }
        if let Some(q) = req.search.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            parts.push(self.search(q)?);
        }
        let limit = req.limit.unwrap_or(self.default_page_size).min(self.max_page_size);
        Ok(SelectQuery {
            tenant_id: self.tenant_id.to_string(),
            schema: self.model.schema.clone(),
            table: self.model.table.clone(),
            columns: self.columns(),
            predicate: Predicate::And(parts),
            order_by: self.order_by(&req.sort)?,
            limit: Some(limit),
            offset: req.offset.unwrap_or(0),
            lookups: self.lookups(&req.include)?,
        })
    }

    pub fn by_id(&self, id: Uuid, include: &[String]) -> Result<SelectQuery, AppError> {
        let mut parts = self.scope();
        parts.push(Predicate::Compare {
            column: Column::new("id", StorageType::Uuid),
            op: CompareOp::Eq,
            value: Value::String(id.to_string()),
        });
        Ok(SelectQuery {
            tenant_id: self.tenant_id.to_string(),
            schema: self.model.schema.clone(),
            table: self.model.table.clone(),
            columns: self.columns(),
            predicate: Predicate::And(parts),
            order_by: Vec::new(),
            limit: Some(1),
            offset: 0,
            lookups: self.lookups(include)?,
        })
    }

    /// Tenant predicate, plus the live-row predicate for soft-delete entities.
    fn scope(&self) -> Vec<Predicate> {
        let mut parts = vec![Predicate::Compare {
            column: Column::new("tenant_id", StorageType::Varchar { length: crate::migration::shape::TENANT_ID_LENGTH }),
            op: CompareOp::Eq,
            value: Value::String(self.tenant_id.to_string()),
        }];
        if self.model.soft_delete {
            parts.push(Predicate::IsNull {
                column: Column::new("deleted_at", StorageType::Timestamptz),
                negated: false,
            });
        }
        parts
    }

    fn columns(&self) -> Vec<Column> {
        self.model
            .columns()
            .into_iter()
            .map(|(name, storage)| Column::new(name, storage))
            .collect()
    }

    pub fn filter(&self, node: &FilterNode) -> Result<Predicate, AppError> {
        match node {
            FilterNode::And(children) => Ok(Predicate::And(
                children.iter().map(|c| self.filter(c)).collect::<Result<_, _>>()?,
            )),
            FilterNode::Or(children) => Ok(Predicate::Or(
                children.iter().map(|c| self.filter(c)).collect::<Result<_, _>>()?,
            )),
            FilterNode::Condition { field, op, value } => self.condition(field, *op, value),
        }
    }

    fn resolve(&self, name: &str, path: &str) -> Result<(Column, FieldType), AppError> {
        if self.hidden.contains(name) {
            return Err(AppError::Permission(format!("field '{}' is not visible", name)));
        }
        if QUERYABLE_SYSTEM_FIELDS.contains(&name) {
            if let (Some(t), Some(s)) = (system_field_type(name), self.model.column_storage(name)) {
                return Ok((Column::new(name, s), t));
            }
        }
        let field = self
            .model
            .field(name)
            .ok_or_else(|| AppError::field(path, format!("unknown field '{}'", name)))?;
        let storage = field
            .storage
            .ok_or_else(|| AppError::field(path, format!("calculated field '{}' cannot be queried", name)))?;
        Ok((Column::new(name, storage), field.field_type.clone()))
    }

    fn condition(&self, name: &str, op: Operator, value: &Value) -> Result<Predicate, AppError> {
        let path = format!("filter.{}", name);
        let (column, ft) = self.resolve(name, &path)?;
        let applicable = match op {
            Operator::IsNull | Operator::IsNotNull => true,
            _ if matches!(ft, FieldType::Json) => false,
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte | Operator::Between => {
                ft.is_numeric() || ft.is_textual() || matches!(ft, FieldType::Date | FieldType::DateTime)
            }
            Operator::Like | Operator::StartsWith | Operator::EndsWith | Operator::Contains => ft.is_textual(),
            Operator::Eq | Operator::Ne | Operator::In | Operator::NotIn => true,
        };
        if !applicable {
            return Err(AppError::field(
                &path,
                format!("operator '{}' does not apply to {} fields", op.as_str(), ft.name()),
            ));
        }
        let scalar = |v: &Value| coerce(&ft, v).map_err(|m| AppError::field(&path, m));
        let compare = |op: CompareOp| -> Result<Predicate, AppError> {
            if value.is_null() {
                return Err(AppError::field(&path, "value is required; use is_null for null checks"));
            }
            Ok(Predicate::Compare {
                column: column.clone(),
                op,
                value: scalar(value)?,
            })
        };
        let pattern_text = || -> Result<&str, AppError> {
            value
                .as_str()
                .ok_or_else(|| AppError::field(&path, format!("'{}' needs a string value", op.as_str())))
        };
        Ok(match op {
            Operator::Eq => compare(CompareOp::Eq)?,
            Operator::Ne => compare(CompareOp::Ne)?,
            Operator::Gt => compare(CompareOp::Gt)?,
            Operator::Gte => compare(CompareOp::Gte)?,
            Operator::Lt => compare(CompareOp::Lt)?,
            Operator::Lte => compare(CompareOp::Lte)?,
            Operator::In | Operator::NotIn => {
                let items = value
                    .as_array()
                    .ok_or_else(|| AppError::field(&path, format!("'{}' needs an array value", op.as_str())))?;
                let values = items
                    .iter()
                    .map(|v| {
                        if v.is_null() {
                            Err(AppError::field(&path, "list values must not be null"))
                        } else {
                            scalar(v)
                        }
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Predicate::InList {
                    column,
                    values,
                    negated: op == Operator::NotIn,
                }
            }
            Operator::IsNull | Operator::IsNotNull => Predicate::IsNull {
                column,
                negated: op == Operator::IsNotNull,
            },
            Operator::Between => {
                let bounds = value
                    .as_array()
                    .filter(|a| a.len() == 2 && a.iter().all(|v| !v.is_null()))
                    .ok_or_else(|| AppError::field(&path, "'between' needs a [low, high] array"))?;
                Predicate::Between {
                    column,
                    low: scalar(&bounds[0])?,
                    high: scalar(&bounds[1])?,
                }
            }
            Operator::Like => Predicate::Like {
                column,
                pattern: pattern_text()?.to_string(),
                case_insensitive: false,
            },
            Operator::StartsWith => Predicate::Like {
                column,
                pattern: format!("{}%", escape_like(pattern_text()?)),
                case_insensitive: true,
            },
            Operator::EndsWith => Predicate::Like {
                column,
                pattern: format!("%{}", escape_like(pattern_text()?)),
                case_insensitive: true,
            },
            Operator::Contains => Predicate::Like {
                column,
                pattern: format!("%{}%", escape_like(pattern_text()?)),
                case_insensitive: true,
            },
        })
    }

    fn search(&self, q: &str) -> Result<Predicate, AppError> {
        let fields: Vec<&str> = self
            .model
            .searchable()
            .into_iter()
            .filter(|f| !self.hidden.contains(*f))
            .collect();
        if fields.is_empty() {
            return Err(AppError::field("q", format!("entity '{}' has no searchable fields", self.model.name)));
        }
        let pattern = format!("%{}%", escape_like(q));
        Ok(Predicate::Or(
            fields
                .into_iter()
                .filter_map(|f| self.model.column_storage(f).map(|s| (f, s)))
                .map(|(f, s)| Predicate::Like {
                    column: Column::new(f, s),
                    pattern: pattern.clone(),
                    case_insensitive: true,
                })
                .collect(),
        ))
    }

    fn order_by(&self, sort: &[SortSpec]) -> Result<Vec<OrderBy>, AppError> {
        let mut out = Vec::with_capacity(sort.len() + 1);
        for s in sort {
            let path = format!("sort.{}", s.field);
            let (column, ft) = self.resolve(&s.field, &path)?;
            if matches!(ft, FieldType::Json) {
                return Err(AppError::field(&path, "json fields cannot be sorted"));
            }
            if out.iter().any(|o: &OrderBy| o.column.name == column.name) {
                continue;
            }
            out.push(OrderBy {
                column,
                descending: s.direction == Direction::Desc,
            });
        }
        if !out.iter().any(|o| o.column.name == "id") {
            out.push(OrderBy {
                column: Column::new("id", StorageType::Uuid),
                descending: false,
            });
        }
        Ok(out)
    }

    fn lookups(&self, include: &[String]) -> Result<Vec<Lookup>, AppError> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for name in include {
            if !seen.insert(name.as_str()) {
                continue;
            }
            if self.hidden.contains(name) {
                return Err(AppError::Permission(format!("relation '{}' is not visible", name)));
            }
            let r = self
                .model
                .relations
                .get(name)
                .ok_or_else(|| AppError::field("include", format!("unknown relation '{}'", name)))?;
            out.push(Lookup {
                name: name.clone(),
                target_table: r.target_table.clone(),
                display_column: r.target_display.clone(),
                cardinality: r.cardinality,
                join: r.join.clone(),
                limit: LOOKUP_LIMIT,
                target_soft_delete: r.target_soft_delete,
            });
        }
        Ok(out)
    }
}

/// Normalize a filter operand; textual fields also accept numbers and booleans as their text.
fn coerce(ft: &FieldType, v: &Value) -> Result<Value, String> {
    if ft.is_textual() {
        return match v {
            Value::String(_) => Ok(v.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err("must be a string".into()),
        };
    }
    normalize(ft, v)
}
