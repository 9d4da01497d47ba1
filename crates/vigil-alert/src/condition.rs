use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::str::FromStr;
use vigil_common::path::lookup;

/// Nesting limit enforced at load time so evaluation recursion stays bounded.
pub const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOp {
    #[serde(alias = "AND")]
    And,
    #[serde(alias = "OR")]
    Or,
    #[serde(alias = "NOT")]
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    #[serde(alias = "==")]
    Eq,
    #[serde(alias = "!=")]
    Ne,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = ">=")]
    Gte,
    #[serde(alias = "<=")]
    Lte,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    Exists,
    Matches,
}

impl FromStr for CompareOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" | "==" => Ok(Self::Eq),
            "ne" | "!=" => Ok(Self::Ne),
            "gt" | ">" => Ok(Self::Gt),
            "lt" | "<" => Ok(Self::Lt),
            "gte" | ">=" => Ok(Self::Gte),
            "lte" | "<=" => Ok(Self::Lte),
            "contains" => Ok(Self::Contains),
            "not_contains" => Ok(Self::NotContains),
            "starts_with" => Ok(Self::StartsWith),
            "ends_with" => Ok(Self::EndsWith),
            "in" => Ok(Self::In),
            "not_in" => Ok(Self::NotIn),
            "exists" => Ok(Self::Exists),
            "matches" => Ok(Self::Matches),
            _ => Err(format!("unknown compare operator: {s}")),
        }
    }
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Lt => "lt",
            Self::Gte => "gte",
            Self::Lte => "lte",
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::Exists => "exists",
            Self::Matches => "matches",
        };
        f.write_str(s)
    }
}

impl CompareOp {
    /// Applies the operator to a field value found in the event.
    ///
    /// Type mismatches are a non-match rather than an error.
    pub fn check(&self, actual: &Value, expected: &Value) -> bool {
        match self {
            Self::Eq => values_equal(actual, expected),
            Self::Ne => !values_equal(actual, expected),
            Self::Gt => order(actual, expected) == Some(Ordering::Greater),
            Self::Lt => order(actual, expected) == Some(Ordering::Less),
            Self::Gte => matches!(
                order(actual, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Self::Lte => matches!(
                order(actual, expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Self::Contains => contains(actual, expected) == Some(true),
            Self::NotContains => contains(actual, expected) == Some(false),
            Self::StartsWith => match (actual, expected) {
                (Value::String(a), Value::String(e)) => a.starts_with(e.as_str()),
                _ => false,
            },
            Self::EndsWith => match (actual, expected) {
                (Value::String(a), Value::String(e)) => a.ends_with(e.as_str()),
                _ => false,
            },
            Self::In => match expected {
                Value::Array(items) => items.iter().any(|i| values_equal(actual, i)),
                _ => false,
            },
            Self::NotIn => match expected {
                Value::Array(items) => !items.iter().any(|i| values_equal(actual, i)),
                _ => false,
            },
            Self::Exists => !actual.is_null(),
            Self::Matches => match (actual, expected) {
                (Value::String(a), Value::String(pattern)) => glob_match::glob_match(pattern, a),
                _ => false,
            },
        }
    }

    /// Checks that a literal has a type this operator can ever match.
    fn validate_literal(&self, value: &Value) -> Result<(), String> {
        let ok = match self {
            Self::Eq | Self::Ne | Self::Exists => true,
            Self::Gt | Self::Lt | Self::Gte | Self::Lte => value.is_number() || value.is_string(),
            Self::Contains | Self::NotContains => !value.is_null(),
            Self::StartsWith | Self::EndsWith | Self::Matches => value.is_string(),
            Self::In | Self::NotIn => value.is_array(),
        };
        if ok {
            Ok(())
        } else {
            Err(format!("operator '{self}' cannot compare against literal {value}"))
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// `None` when the operands cannot be compared for containment.
fn contains(actual: &Value, expected: &Value) -> Option<bool> {
    match (actual, expected) {
        (Value::String(a), Value::String(e)) => Some(a.contains(e.as_str())),
        (Value::Array(items), _) => Some(items.iter().any(|i| values_equal(i, expected))),
        _ => None,
    }
}

/// A node of a rule's boolean expression tree.
///
/// Serialized with an internal `type` tag:
///
/// ```
/// use serde_json::json;
/// use vigil_alert::condition::RuleCondition;
///
/// let cond: RuleCondition = serde_json::from_value(json!({
///     "type": "logical",
///     "operator": "and",
///     "children": [
///         {"type": "comparison", "field": "survey.accuracy", "operator": "lt", "value": 0.1},
///         {"type": "comparison", "field": "survey.status", "operator": "eq", "value": "final"}
///     ]
/// })).unwrap();
///
/// assert!(cond.evaluate(&json!({"survey": {"accuracy": 0.05, "status": "final"}})));
/// assert!(!cond.evaluate(&json!({"survey": {"accuracy": 0.05}})));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCondition {
    Logical {
        operator: LogicalOp,
        children: Vec<RuleCondition>,
    },
    Comparison {
        field: String,
        operator: CompareOp,
        #[serde(default)]
        value: Value,
    },
}

impl RuleCondition {
    pub fn all(children: Vec<RuleCondition>) -> Self {
        Self::Logical {
            operator: LogicalOp::And,
            children,
        }
    }

    pub fn any(children: Vec<RuleCondition>) -> Self {
        Self::Logical {
            operator: LogicalOp::Or,
            children,
        }
    }

    pub fn not(child: RuleCondition) -> Self {
        Self::Logical {
            operator: LogicalOp::Not,
            children: vec![child],
        }
    }

    pub fn compare(field: impl Into<String>, operator: CompareOp, value: Value) -> Self {
        Self::Comparison {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Evaluates the tree against an event context.
    ///
    /// AND stops at the first false child, OR at the first true one. Shapes that
    /// validation would reject (empty AND/OR, NOT without exactly one child)
    /// evaluate to false.
    pub fn evaluate(&self, context: &Value) -> bool {
        match self {
            Self::Logical { operator, children } => {
                if children.is_empty() {
                    return false;
                }
                match operator {
                    LogicalOp::And => children.iter().all(|c| c.evaluate(context)),
                    LogicalOp::Or => children.iter().any(|c| c.evaluate(context)),
                    LogicalOp::Not => match children.as_slice() {
                        [only] => !only.evaluate(context),
                        _ => false,
                    },
                }
            }
            Self::Comparison {
                field,
                operator,
                value,
            } => match lookup(context, field) {
                Some(actual) => operator.check(actual, value),
                None => false,
            },
        }
    }

    /// Number of comparison leaves in the tree.
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Logical { children, .. } => children.iter().map(Self::leaf_count).sum(),
            Self::Comparison { .. } => 1,
        }
    }

    /// Structural validation; returns the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        self.validate_at(0)
    }

    fn validate_at(&self, depth: usize) -> Result<(), String> {
        if depth >= MAX_DEPTH {
            return Err(format!("condition tree deeper than {MAX_DEPTH} levels"));
        }
        match self {
            Self::Logical { operator, children } => {
                match operator {
                    LogicalOp::Not if children.len() != 1 => {
                        return Err(format!(
                            "NOT requires exactly one child, found {}",
                            children.len()
                        ));
                    }
                    LogicalOp::And | LogicalOp::Or if children.is_empty() => {
                        return Err(format!("{operator:?} requires at least one child"));
                    }
                    _ => {}
                }
                children.iter().try_for_each(|c| c.validate_at(depth + 1))
            }
            Self::Comparison {
                field,
                operator,
                value,
            } => {
                if field.trim().is_empty() || field.split('.').any(str::is_empty) {
                    return Err(format!("invalid field path '{field}'"));
                }
                operator.validate_literal(value)
            }
        }
    }
}
