//! Condition evaluation against an instance's variable bindings.

use std::collections::HashMap;

use tracing::warn;

use crate::node::Operator;

/// Evaluate a condition. Total: a malformed condition evaluates to `false`
/// rather than failing, because one bad node must not take down an instance.
///
/// `Exists` checks presence regardless of value. The numeric operators parse
/// both sides as `f64`; a parse failure logs a warning and yields `false`.
/// String operators are case-sensitive.
pub fn evaluate(
  bindings: &HashMap<String, String>,
  variable: &str,
  operator: Operator,
  operand: &str,
) -> bool {
  if operator == Operator::Exists {
    return bindings.contains_key(variable);
  }

  let Some(value) = bindings.get(variable) else {
    return false;
  };

  match operator {
    Operator::Equals => value == operand,
    Operator::Contains => value.contains(operand),
    Operator::StartsWith => value.starts_with(operand),
    Operator::EndsWith => value.ends_with(operand),
    Operator::GreaterThan | Operator::LessThan => {
      match (value.parse::<f64>(), operand.parse::<f64>()) {
        (Ok(lhs), Ok(rhs)) => {
          if operator == Operator::GreaterThan {
            lhs > rhs
          } else {
            lhs < rhs
          }
        }
        _ => {
          warn!(
            variable = %variable,
            value = %value,
            operand = %operand,
            "condition_type_mismatch"
          );
          false
        }
      }
    }
    Operator::Exists => unreachable!("handled above"),
  }
}
