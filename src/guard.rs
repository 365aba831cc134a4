//! Guard and matching-rule evaluation (§3, §6).
//!
//! Comparisons against an unset path always fail — there is no implicit
//! coercion of "missing" to a default value anywhere in this module.

use crate::model::{CompareOp, ExprSource, Guard, GuardOperand, MatchingRule, PureExpr};
use crate::value::ContextValue;

/// Evaluate one comparison operator. `None` (unset) on either side is always
/// a failed comparison, including for `!==` — an absent value is never
/// "not equal" to something meaningful by this engine's contract.
fn compare(op: CompareOp, lhs: Option<&ContextValue>, rhs: Option<&ContextValue>) -> bool {
    let (lhs, rhs) = match (lhs, rhs) {
        (Some(l), Some(r)) => (l, r),
        _ => return false,
    };
    match op {
        CompareOp::Eq => lhs == rhs,
        CompareOp::Ne => lhs != rhs,
        CompareOp::Gt => numeric_cmp(lhs, rhs).map(|o| o.is_gt()).unwrap_or(false),
        CompareOp::Lt => numeric_cmp(lhs, rhs).map(|o| o.is_lt()).unwrap_or(false),
        CompareOp::Ge => numeric_cmp(lhs, rhs).map(|o| o.is_ge()).unwrap_or(false),
        CompareOp::Le => numeric_cmp(lhs, rhs).map(|o| o.is_le()).unwrap_or(false),
        CompareOp::Contains => match (lhs, rhs) {
            (ContextValue::String(l), ContextValue::String(r)) => l.contains(r.as_str()),
            (ContextValue::List(items), needle) => items.contains(needle),
            _ => false,
        },
        CompareOp::In => match rhs {
            ContextValue::List(items) => items.contains(lhs),
            _ => false,
        },
    }
}

fn numeric_cmp(a: &ContextValue, b: &ContextValue) -> Option<std::cmp::Ordering> {
    a.as_f64()?.partial_cmp(&b.as_f64()?)
}

/// Resolve a guard operand against an event payload and instance context.
/// `{{path}}` references resolve against `context`, per §3.
fn resolve_operand<'a>(
    operand: &'a GuardOperand,
    context: &'a ContextValue,
) -> Option<std::borrow::Cow<'a, ContextValue>> {
    match operand {
        GuardOperand::Literal(v) => Some(std::borrow::Cow::Borrowed(v)),
        GuardOperand::ContextPath(path) => context.get_path(path).map(std::borrow::Cow::Borrowed),
    }
}

/// Evaluate a single guard against `(event payload, instance context)`.
pub fn evaluate_guard(guard: &Guard, event_payload: &ContextValue, context: &ContextValue) -> bool {
    match guard {
        Guard::RequiredKeysPresent(keys) => keys
            .iter()
            .all(|k| event_payload.get_path(k).is_some()),
        Guard::Compare { event_path, op, rhs } => {
            let lhs = event_payload.get_path(event_path);
            let rhs = resolve_operand(rhs, context);
            compare(*op, lhs, rhs.as_deref())
        }
        Guard::Expr(expr) => evaluate_expr(expr, context, event_payload, None),
    }
}

/// Evaluate all guards of a transition; all must pass (AND).
pub fn evaluate_guards(guards: &[Guard], event_payload: &ContextValue, context: &ContextValue) -> bool {
    guards.iter().all(|g| evaluate_guard(g, event_payload, context))
}

/// Evaluate the closed pure-expression mini-language (§9) against the three
/// value trees a transition may reference.
pub fn evaluate_expr(
    expr: &PureExpr,
    context: &ContextValue,
    event: &ContextValue,
    public_member: Option<&ContextValue>,
) -> bool {
    match expr {
        PureExpr::True => true,
        PureExpr::Not(inner) => !evaluate_expr(inner, context, event, public_member),
        PureExpr::And(a, b) => {
            evaluate_expr(a, context, event, public_member)
                && evaluate_expr(b, context, event, public_member)
        }
        PureExpr::Or(a, b) => {
            evaluate_expr(a, context, event, public_member)
                || evaluate_expr(b, context, event, public_member)
        }
        PureExpr::CompareContextPaths {
            left_path,
            op,
            right_path,
            right_source,
        } => {
            let lhs = context.get_path(left_path);
            let source = match right_source {
                ExprSource::Context => Some(context),
                ExprSource::Event => Some(event),
                ExprSource::PublicMember => public_member,
            };
            let rhs = source.and_then(|s| s.get_path(right_path));
            compare(*op, lhs, rhs)
        }
    }
}

/// Evaluate one matching rule against `(event payload, instance context)`.
pub fn evaluate_matching_rule(
    rule: &MatchingRule,
    event_payload: &ContextValue,
    instance_context: &ContextValue,
) -> bool {
    let lhs = event_payload.get_path(&rule.event_path);
    let rhs = instance_context.get_path(&rule.instance_path);
    compare(rule.op, lhs, rhs)
}

/// Evaluate every matching rule (AND semantics, §3).
pub fn evaluate_matching_rules(
    rules: &[MatchingRule],
    event_payload: &ContextValue,
    instance_context: &ContextValue,
) -> bool {
    rules
        .iter()
        .all(|r| evaluate_matching_rule(r, event_payload, instance_context))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ContextValue;

    fn map(pairs: &[(&str, ContextValue)]) -> ContextValue {
        ContextValue::Map(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    #[test]
    fn required_keys_present() {
        let guard = Guard::RequiredKeysPresent(vec!["orderId".into()]);
        let payload = map(&[("orderId", "O1".into())]);
        assert!(evaluate_guard(&guard, &payload, &ContextValue::empty_map()));
        let empty = ContextValue::empty_map();
        assert!(!evaluate_guard(&guard, &empty, &ContextValue::empty_map()));
    }

    #[test]
    fn compare_ge_against_context_path() {
        let guard = Guard::Compare {
            event_path: "qty".into(),
            op: CompareOp::Ge,
            rhs: GuardOperand::ContextPath("totalQty".into()),
        };
        let context = map(&[("totalQty", ContextValue::Int(1000))]);
        let payload_pass = map(&[("qty", ContextValue::Int(1000))]);
        let payload_fail = map(&[("qty", ContextValue::Int(999))]);
        assert!(evaluate_guard(&guard, &payload_pass, &context));
        assert!(!evaluate_guard(&guard, &payload_fail, &context));
    }

    #[test]
    fn missing_context_path_fails_comparison() {
        let guard = Guard::Compare {
            event_path: "qty".into(),
            op: CompareOp::Eq,
            rhs: GuardOperand::ContextPath("missingPath".into()),
        };
        let payload = map(&[("qty", ContextValue::Int(1))]);
        assert!(!evaluate_guard(&guard, &payload, &ContextValue::empty_map()));
    }

    #[test]
    fn matching_rule_routes_by_equality() {
        let rule = MatchingRule::equals("orderId", "orderId");
        let event_payload = map(&[("orderId", "O3".into())]);
        let matches_ctx = map(&[("orderId", "O3".into())]);
        let other_ctx = map(&[("orderId", "O7".into())]);
        assert!(evaluate_matching_rule(&rule, &event_payload, &matches_ctx));
        assert!(!evaluate_matching_rule(&rule, &event_payload, &other_ctx));
    }

    #[test]
    fn in_operator_checks_membership() {
        let guard = Guard::Compare {
            event_path: "status".into(),
            op: CompareOp::In,
            rhs: GuardOperand::Literal(ContextValue::List(vec!["a".into(), "b".into()])),
        };
        let payload_pass = map(&[("status", "a".into())]);
        let payload_fail = map(&[("status", "z".into())]);
        assert!(evaluate_guard(&guard, &payload_pass, &ContextValue::empty_map()));
        assert!(!evaluate_guard(&guard, &payload_fail, &ContextValue::empty_map()));
    }

    #[test]
    fn contains_operator_substring() {
        let guard = Guard::Compare {
            event_path: "name".into(),
            op: CompareOp::Contains,
            rhs: GuardOperand::Literal("orl".into()),
        };
        let payload = map(&[("name", "world".into())]);
        assert!(evaluate_guard(&guard, &payload, &ContextValue::empty_map()));
    }
}
