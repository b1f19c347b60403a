//! Backend-agnostic query representation. Values are already normalized to the column's type.

use crate::migration::storage::StorageType;
use crate::model::{Cardinality, JoinPath};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    pub fn sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Compare {
        column: Column,
        op: CompareOp,
        value: Value,
    },
    InList {
        column: Column,
        values: Vec<Value>,
        negated: bool,
    },
    IsNull {
        column: Column,
        negated: bool,
    },
    Between {
        column: Column,
        low: Value,
        high: Value,
    },
    /// SQL LIKE pattern with `%`/`_` wildcards and `\` escapes.
    Like {
        column: Column,
        pattern: String,
        case_insensitive: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub storage: StorageType,
}

impl Column {
    pub fn new(name: impl Into<String>, storage: StorageType) -> Self {
        Column {
            name: name.into(),
            storage,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    pub column: Column,
    pub descending: bool,
}

/// Single-hop lookup of `{id, display}` for a related entity.
#[derive(Clone, Debug, PartialEq)]
pub struct Lookup {
    pub name: String,
    pub target_table: String,
    pub display_column: String,
    pub cardinality: Cardinality,
    pub join: JoinPath,
    /// Maximum rows returned for to-many lookups.
    pub limit: u32,
    pub target_soft_delete: bool,
}

pub const LOOKUP_LIMIT: u32 = 50;

#[derive(Clone, Debug, PartialEq)]
pub struct SelectQuery {
    pub tenant_id: String,
    pub schema: String,
    pub table: String,
    pub columns: Vec<Column>,
    /// Always contains the tenant predicate.
    pub predicate: Predicate,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u32>,
    pub offset: u64,
    pub lookups: Vec<Lookup>,
}

impl SelectQuery {
    /// The same query without paging or lookups, for counting.
    pub fn for_count(&self) -> SelectQuery {
        SelectQuery {
            order_by: Vec::new(),
            limit: None,
            offset: 0,
            lookups: Vec::new(),
            ..self.clone()
        }
    }
}

/// Escape `%`, `_` and `\` so user text matches literally inside a LIKE pattern.
pub fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Evaluate a LIKE pattern (`%`, `_`, `\` escapes) against text.
pub fn like_matches(pattern: &str, text: &str, case_insensitive: bool) -> bool {
    #[derive(Clone, Copy)]
    enum Tok {
        Any,
        One,
        Lit(char),
    }
    let mut toks = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        toks.push(match c {
            '%' => Tok::Any,
            '_' => Tok::One,
            '\\' => Tok::Lit(chars.next().unwrap_or('\\')),
            c => Tok::Lit(c),
        });
    }
    let fold = |c: char| if case_insensitive { c.to_lowercase().next().unwrap_or(c) } else { c };
    let text: Vec<char> = text.chars().map(fold).collect();

    // dp[j]: pattern prefix matches text prefix of length j
    let mut dp = vec![false; text.len() + 1];
    dp[0] = true;
    for tok in toks {
        let mut next = vec![false; text.len() + 1];
        match tok {
            Tok::Any => {
                let mut seen = false;
                for j in 0..=text.len() {
                    seen |= dp[j];
                    next[j] = seen;
                }
            }
            Tok::One => {
                for j in 1..=text.len() {
                    next[j] = dp[j - 1];
                }
            }
            Tok::Lit(c) => {
                let c = fold(c);
                for j in 1..=text.len() {
                    next[j] = dp[j - 1] && text[j - 1] == c;
                }
            }
        }
        dp = next;
    }
    dp[text.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_wildcards_and_escapes() {
        assert!(like_matches("Ad%", "Ada", false));
        assert!(!like_matches("ad%", "Ada", false));
        assert!(like_matches("ad%", "Ada", true));
        assert!(like_matches("_da", "Ada", false));
        assert!(like_matches("%\\%%", "50% off", false));
        assert!(!like_matches("%\\%%", "50 off", false));
        assert_eq!(escape_like("a_b%"), "a\\_b\\%");
    }
}
