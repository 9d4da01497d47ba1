/// Errors raised while loading or updating rules.
///
/// Evaluation itself never fails: a rule that cannot be evaluated is a non-match.
/// Every variant here is a configuration problem surfaced at load time.
///
/// # Examples
///
/// ```rust
/// use vigil_alert::error::RuleError;
///
/// let err = RuleError::NoLeaf("accuracy-drop".to_string());
/// assert!(err.to_string().contains("accuracy-drop"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// The condition tree is structurally invalid (wrong arity, bad literal type, too deep).
    #[error("Rule: malformed condition in rule '{rule_id}': {reason}")]
    MalformedCondition { rule_id: String, reason: String },

    /// An enabled rule must contain at least one comparison leaf.
    #[error("Rule: rule '{0}' has no comparison leaf and cannot be enabled")]
    NoLeaf(String),

    /// A rule with the same id is already loaded.
    #[error("Rule: duplicate rule id '{0}'")]
    DuplicateId(String),

    /// No rule with the given id is loaded.
    #[error("Rule: rule '{0}' not found")]
    NotFound(String),

    /// A non-condition field of the rule is invalid (empty id, empty action target, ...).
    #[error("Rule: invalid definition of rule '{rule_id}': {reason}")]
    InvalidDefinition { rule_id: String, reason: String },

    /// The rule document could not be parsed (includes unknown operators).
    #[error("Rule: JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience `Result` alias for rule operations.
pub type Result<T> = std::result::Result<T, RuleError>;
