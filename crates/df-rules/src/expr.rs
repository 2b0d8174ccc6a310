//! Expression tree for composing [`Condition`] nodes.
//!
//! An [`Expr`] is a recursive enum that supports AND, OR, and NOT over leaf
//! conditions.
//!
//! `Serialize` and `Deserialize` go through [`serde_json::Value`] by hand
//! rather than being derived, so the recursive type does not blow up serde's
//! generic monomorphization. Going through `Value` still works with any
//! self-describing format (TOML flow plans included).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::condition::{Condition, Subject};

/// A boolean expression tree over item conditions.
///
/// JSON format:
///
/// ```json
/// { "type": "condition", "condition": {...} }
/// { "type": "and", "exprs": [...] }
/// { "type": "or",  "exprs": [...] }
/// { "type": "not", "expr": {...} }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A leaf condition.
    Condition(Condition),
    /// All sub-expressions must match.
    And(Vec<Expr>),
    /// At least one sub-expression must match.
    Or(Vec<Expr>),
    /// Negates the inner expression.
    Not(Box<Expr>),
}

impl Expr {
    /// Every pattern in the tree compiles.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Expr::Condition(cond) => cond.validate(),
            Expr::And(exprs) | Expr::Or(exprs) => exprs.iter().try_for_each(Expr::validate),
            Expr::Not(inner) => inner.validate(),
        }
    }
}

impl From<Condition> for Expr {
    fn from(cond: Condition) -> Self {
        Expr::Condition(cond)
    }
}

// ---------------------------------------------------------------------------
// Manual Serialize / Deserialize via serde_json::Value
// ---------------------------------------------------------------------------

fn expr_to_value(expr: &Expr) -> Value {
    match expr {
        Expr::Condition(cond) => serde_json::json!({
            "type": "condition",
            "condition": serde_json::to_value(cond).unwrap_or(Value::Null),
        }),
        Expr::And(exprs) => serde_json::json!({
            "type": "and",
            "exprs": exprs.iter().map(expr_to_value).collect::<Vec<_>>(),
        }),
        Expr::Or(exprs) => serde_json::json!({
            "type": "or",
            "exprs": exprs.iter().map(expr_to_value).collect::<Vec<_>>(),
        }),
        Expr::Not(inner) => serde_json::json!({
            "type": "not",
            "expr": expr_to_value(inner),
        }),
    }
}

fn exprs_from(obj: &serde_json::Map<String, Value>, tag: &str) -> Result<Vec<Expr>, String> {
    obj.get("exprs")
        .and_then(Value::as_array)
        .ok_or_else(|| format!("{tag} expr must have an \"exprs\" array"))?
        .iter()
        .map(expr_from_value)
        .collect()
}

fn expr_from_value(val: &Value) -> Result<Expr, String> {
    let obj = val.as_object().ok_or("Expr must be a JSON object")?;
    let type_tag = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or("Expr must have a \"type\" field")?;

    match type_tag {
        "condition" => {
            let cond_val = obj
                .get("condition")
                .ok_or("condition expr must have a \"condition\" field")?;
            let cond: Condition = serde_json::from_value(cond_val.clone())
                .map_err(|e| format!("invalid condition: {e}"))?;
            Ok(Expr::Condition(cond))
        }
        "and" => Ok(Expr::And(exprs_from(obj, "and")?)),
        "or" => Ok(Expr::Or(exprs_from(obj, "or")?)),
        "not" => {
            let inner_val = obj
                .get("expr")
                .ok_or("not expr must have an \"expr\" field")?;
            Ok(Expr::Not(Box::new(expr_from_value(inner_val)?)))
        }
        other => Err(format!("unknown expr type: {other}")),
    }
}

impl Serialize for Expr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        expr_to_value(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Expr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        expr_from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// Evaluate an expression tree against the given subject.
pub fn evaluate(expr: &Expr, subject: &Subject<'_>) -> bool {
    match expr {
        Expr::Condition(cond) => cond.evaluate(subject),
        Expr::And(exprs) => exprs.iter().all(|e| evaluate(e, subject)),
        Expr::Or(exprs) => exprs.iter().any(|e| evaluate(e, subject)),
        Expr::Not(inner) => !evaluate(inner, subject),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use df_model::Metadata;

    fn make_test_metadata() -> Metadata {
        [
            ("customer".to_string(), "acme".to_string()),
            ("region".to_string(), "eu".to_string()),
        ]
        .into()
    }

    fn eq(key: &str, value: &str) -> Expr {
        Expr::Condition(Condition::MetadataEquals {
            key: key.into(),
            value: value.into(),
        })
    }

    #[test]
    fn evaluate_and_or_not() {
        let subject = Subject::new(make_test_metadata(), &[]);
        assert!(evaluate(&Expr::And(vec![eq("customer", "acme"), eq("region", "eu")]), &subject));
        assert!(!evaluate(&Expr::And(vec![eq("customer", "acme"), eq("region", "us")]), &subject));
        assert!(evaluate(&Expr::Or(vec![eq("region", "us"), eq("region", "eu")]), &subject));
        assert!(evaluate(&Expr::Not(Box::new(eq("region", "us"))), &subject));
    }

    #[test]
    fn empty_and_is_true_empty_or_is_false() {
        let subject = Subject::new(Metadata::new(), &[]);
        assert!(evaluate(&Expr::And(vec![]), &subject));
        assert!(!evaluate(&Expr::Or(vec![]), &subject));
    }

    #[test]
    fn serde_roundtrip_nested() {
        let expr = Expr::And(vec![
            eq("customer", "acme"),
            Expr::Or(vec![
                Expr::Condition(Condition::MetadataExists("region".into())),
                Expr::Not(Box::new(Expr::Condition(Condition::MinSize(10)))),
            ]),
        ]);
        let json = serde_json::to_string_pretty(&expr).unwrap();
        let back: Expr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, expr);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = serde_json::from_str::<Expr>(r#"{"type": "xor", "exprs": []}"#).unwrap_err();
        assert!(err.to_string().contains("unknown expr type"));
    }

    #[test]
    fn validate_finds_nested_bad_pattern() {
        let expr = Expr::Or(vec![
            eq("a", "b"),
            Expr::Not(Box::new(Expr::Condition(Condition::ContentName("[".into())))),
        ]);
        assert!(expr.validate().is_err());
        assert!(eq("a", "b").validate().is_ok());
    }
}
