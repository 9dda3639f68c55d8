//! Tree-walking interpreter over the restricted AST.

use serde_json::{Map, Value};

use super::ast::{BinaryOp, Expr, UnaryOp};
use super::context::ExpressionContext;
use super::functions::{self, iso_value, today_start};
use super::parser::check_member;
use super::value::{compare, expect_number, loose_eq, number, strict_eq, to_display, truthy, type_name};
use super::ExpressionError;

static NULL: Value = Value::Null;

/// Intermediate result. Borrowed values avoid cloning context data when
/// an expression only reads a leaf such as `$json.customer.email`.
enum Operand<'a> {
    Ref(&'a Value),
    Owned(Value),
    /// An item batch (`$input`, `$node["X"]`)
    Batch(&'a [Value]),
    /// The `$node` binding itself, before a node name is chosen
    Nodes,
}

impl<'a> Operand<'a> {
    fn value(&self) -> &Value {
        match self {
            Operand::Ref(v) => *v,
            Operand::Owned(v) => v,
            Operand::Batch(_) | Operand::Nodes => &NULL,
        }
    }

    fn into_value(self, ctx: &ExpressionContext<'_>) -> Value {
        match self {
            Operand::Ref(v) => v.clone(),
            Operand::Owned(v) => v,
            Operand::Batch(items) => Value::Array(items.to_vec()),
            Operand::Nodes => Value::Object(
                ctx.scope
                    .node_outputs
                    .iter()
                    .map(|(name, items)| (name.clone(), Value::Array(items.clone())))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }
}

/// Evaluate a parsed expression against a context.
pub fn evaluate(expr: &Expr, ctx: &ExpressionContext<'_>) -> Result<Value, ExpressionError> {
    let interpreter = Interpreter { ctx: *ctx };
    let operand = interpreter.eval(expr)?;
    Ok(operand.into_value(ctx))
}

struct Interpreter<'a> {
    ctx: ExpressionContext<'a>,
}

impl<'a> Interpreter<'a> {
    fn eval(&self, expr: &Expr) -> Result<Operand<'a>, ExpressionError> {
        match expr {
            Expr::Literal(value) => Ok(Operand::Owned(value.clone())),
            Expr::Array(elements) => {
                let values = elements
                    .iter()
                    .map(|e| self.value_of(e))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Operand::Owned(Value::Array(values)))
            }
            Expr::Object(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), self.value_of(value)?);
                }
                Ok(Operand::Owned(Value::Object(map)))
            }
            Expr::Binding(name) => self.binding(name),
            Expr::Member {
                object, property, ..
            } => {
                let target = self.eval(object)?;
                self.member(target, property)
            }
            Expr::Index { object, index, .. } => {
                let target = self.eval(object)?;
                let key = self.value_of(index)?;
                self.index(target, &key)
            }
            Expr::Call { function, args } => {
                let f = functions::lookup(function)
                    .ok_or_else(|| ExpressionError::UnknownFunction(function.clone()))?;
                let values = self.values_of(args)?;
                f(&values).map(Operand::Owned)
            }
            Expr::MethodCall {
                receiver,
                method,
                args,
                optional,
            } => {
                let target = self.eval(receiver)?;
                if *optional && target.value().is_null() && !matches!(target, Operand::Batch(_)) {
                    return Ok(Operand::Owned(Value::Null));
                }
                self.method(target, method, args)
            }
            Expr::Unary { op, operand } => {
                let value = self.value_of(operand)?;
                let result = match op {
                    UnaryOp::Not => Value::Bool(!truthy(&value)),
                    UnaryOp::Neg => number(-expect_number(&value, "unary '-'")?)?,
                    UnaryOp::Plus => number(expect_number(&value, "unary '+'")?)?,
                };
                Ok(Operand::Owned(result))
            }
            Expr::Binary { op, left, right } => self.binary(*op, left, right),
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => {
                if truthy(self.eval(test)?.value()) {
                    self.eval(consequent)
                } else {
                    self.eval(alternate)
                }
            }
        }
    }

    fn value_of(&self, expr: &Expr) -> Result<Value, ExpressionError> {
        Ok(self.eval(expr)?.into_value(&self.ctx))
    }

    fn values_of(&self, exprs: &[Expr]) -> Result<Vec<Value>, ExpressionError> {
        exprs.iter().map(|e| self.value_of(e)).collect()
    }

    fn binding(&self, name: &str) -> Result<Operand<'a>, ExpressionError> {
        let scope = self.ctx.scope;
        let operand = match name {
            "$json" => Operand::Ref(self.ctx.item),
            "$input" => Operand::Batch(self.ctx.input),
            "$itemIndex" => Operand::Owned(Value::from(self.ctx.item_index)),
            "$node" => Operand::Nodes,
            "$workflow" => Operand::Ref(&scope.workflow),
            "$execution" => Operand::Ref(&scope.execution),
            "$vars" => Operand::Ref(&scope.variables),
            "$env" => Operand::Ref(&scope.env),
            "$now" => Operand::Owned(iso_value(self.ctx.now)),
            "$today" => Operand::Owned(iso_value(today_start(self.ctx.now))),
            other => return Err(ExpressionError::UnknownIdentifier(other.to_string())),
        };
        Ok(operand)
    }

    fn node_batch(&self, name: &str) -> Result<Operand<'a>, ExpressionError> {
        self.ctx
            .scope
            .node_output(name)
            .map(Operand::Batch)
            .ok_or_else(|| {
                ExpressionError::Evaluation(format!("node '{}' has not produced output", name))
            })
    }

    fn member(&self, target: Operand<'a>, property: &str) -> Result<Operand<'a>, ExpressionError> {
        check_member(property)?;
        match target {
            Operand::Nodes => self.node_batch(property),
            Operand::Batch(items) => match property {
                "json" => Ok(items.first().map(Operand::Ref).unwrap_or(Operand::Ref(&NULL))),
                "item" => Ok(items
                    .get(self.ctx.item_index)
                    .map(Operand::Ref)
                    .unwrap_or(Operand::Ref(&NULL))),
                "length" => Ok(Operand::Owned(Value::from(items.len()))),
                other => Err(ExpressionError::Type(format!(
                    "item batches have no property '{}'",
                    other
                ))),
            },
            Operand::Ref(value) => Ok(match value_member(value, property) {
                Member::Borrowed(v) => Operand::Ref(v),
                Member::Computed(v) => Operand::Owned(v),
            }),
            Operand::Owned(value) => Ok(Operand::Owned(match value_member(&value, property) {
                Member::Borrowed(v) => v.clone(),
                Member::Computed(v) => v,
            })),
        }
    }

    fn index(&self, target: Operand<'a>, key: &Value) -> Result<Operand<'a>, ExpressionError> {
        let position = match key {
            Value::String(name) => return self.member(target, name),
            Value::Number(n) => n.as_u64().map(|i| i as usize),
            other => {
                return Err(ExpressionError::Type(format!(
                    "cannot index with {}",
                    type_name(other)
                )))
            }
        };
        match target {
            Operand::Nodes => Err(ExpressionError::Type(
                "$node expects a node name, got number".to_string(),
            )),
            Operand::Batch(items) => Ok(Operand::Ref(
                position.and_then(|i| items.get(i)).unwrap_or(&NULL),
            )),
            Operand::Ref(value) => Ok(match position.and_then(|i| value_index(value, i)) {
                Some(Member::Borrowed(v)) => Operand::Ref(v),
                Some(Member::Computed(v)) => Operand::Owned(v),
                None => Operand::Ref(&NULL),
            }),
            Operand::Owned(value) => Ok(Operand::Owned(
                match position.and_then(|i| value_index(&value, i)) {
                    Some(Member::Borrowed(v)) => v.clone(),
                    Some(Member::Computed(v)) => v,
                    None => Value::Null,
                },
            )),
        }
    }

    fn method(
        &self,
        target: Operand<'a>,
        method: &str,
        args: &[Expr],
    ) -> Result<Operand<'a>, ExpressionError> {
        if let Operand::Batch(items) = target {
            return match method {
                "all" => Ok(Operand::Owned(Value::Array(items.to_vec()))),
                "first" => Ok(Operand::Ref(items.first().unwrap_or(&NULL))),
                "last" => Ok(Operand::Ref(items.last().unwrap_or(&NULL))),
                "item" => {
                    let index = match args.first() {
                        Some(expr) => expect_number(&self.value_of(expr)?, "item()")? as usize,
                        None => self.ctx.item_index,
                    };
                    Ok(Operand::Ref(items.get(index).unwrap_or(&NULL)))
                }
                _ => self.call_method(Value::Array(items.to_vec()), method, args),
            };
        }
        if let Operand::Nodes = target {
            return Err(ExpressionError::Type(
                "$node must be indexed by node name before calling methods".to_string(),
            ));
        }
        let receiver = target.into_value(&self.ctx);
        match (method, &receiver) {
            ("all", Value::Array(_)) => Ok(Operand::Owned(receiver)),
            ("item", Value::Array(items)) => {
                let index = match args.first() {
                    Some(expr) => expect_number(&self.value_of(expr)?, "item()")? as usize,
                    None => 0,
                };
                Ok(Operand::Owned(items.get(index).cloned().unwrap_or(Value::Null)))
            }
            _ => self.call_method(receiver, method, args),
        }
    }

    fn call_method(
        &self,
        receiver: Value,
        method: &str,
        args: &[Expr],
    ) -> Result<Operand<'a>, ExpressionError> {
        let target = functions::method_target(method)
            .ok_or_else(|| ExpressionError::UnknownFunction(method.to_string()))?;
        let f = functions::lookup(target)
            .ok_or_else(|| ExpressionError::UnknownFunction(method.to_string()))?;
        let mut values = Vec::with_capacity(args.len() + 1);
        values.push(receiver);
        values.extend(self.values_of(args)?);
        f(&values).map(Operand::Owned)
    }

    fn binary(&self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<Operand<'a>, ExpressionError> {
        match op {
            BinaryOp::And => {
                let l = self.eval(left)?;
                return if truthy(l.value()) { self.eval(right) } else { Ok(l) };
            }
            BinaryOp::Or => {
                let l = self.eval(left)?;
                return if truthy(l.value()) { Ok(l) } else { self.eval(right) };
            }
            BinaryOp::Coalesce => {
                let l = self.eval(left)?;
                return if l.value().is_null() && !matches!(l, Operand::Batch(_) | Operand::Nodes) {
                    self.eval(right)
                } else {
                    Ok(l)
                };
            }
            _ => {}
        }

        let l = self.value_of(left)?;
        let r = self.value_of(right)?;
        let result = match op {
            BinaryOp::Add => add(&l, &r)?,
            BinaryOp::Sub => number(expect_number(&l, "'-'")? - expect_number(&r, "'-'")?)?,
            BinaryOp::Mul => number(expect_number(&l, "'*'")? * expect_number(&r, "'*'")?)?,
            BinaryOp::Div => {
                let divisor = expect_number(&r, "'/'")?;
                if divisor == 0.0 {
                    return Err(ExpressionError::Evaluation("division by zero".to_string()));
                }
                number(expect_number(&l, "'/'")? / divisor)?
            }
            BinaryOp::Rem => {
                let divisor = expect_number(&r, "'%'")?;
                if divisor == 0.0 {
                    return Err(ExpressionError::Evaluation("division by zero".to_string()));
                }
                number(expect_number(&l, "'%'")? % divisor)?
            }
            BinaryOp::Eq => Value::Bool(loose_eq(&l, &r)),
            BinaryOp::NotEq => Value::Bool(!loose_eq(&l, &r)),
            BinaryOp::StrictEq => Value::Bool(strict_eq(&l, &r)),
            BinaryOp::StrictNotEq => Value::Bool(!strict_eq(&l, &r)),
            BinaryOp::Lt => Value::Bool(compare(&l, &r).is_some_and(|o| o.is_lt())),
            BinaryOp::Le => Value::Bool(compare(&l, &r).is_some_and(|o| o.is_le())),
            BinaryOp::Gt => Value::Bool(compare(&l, &r).is_some_and(|o| o.is_gt())),
            BinaryOp::Ge => Value::Bool(compare(&l, &r).is_some_and(|o| o.is_ge())),
            BinaryOp::And | BinaryOp::Or | BinaryOp::Coalesce => unreachable!("handled above"),
        };
        Ok(Operand::Owned(result))
    }
}

enum Member<'v> {
    Borrowed(&'v Value),
    Computed(Value),
}

fn value_member<'v>(value: &'v Value, property: &str) -> Member<'v> {
    match (value, property) {
        (Value::Object(map), _) if map.contains_key(property) => {
            Member::Borrowed(&map[property])
        }
        (Value::String(s), "length") => Member::Computed(Value::from(s.chars().count())),
        (Value::Array(items), "length") => Member::Computed(Value::from(items.len())),
        _ => Member::Borrowed(&NULL),
    }
}

fn value_index(value: &Value, index: usize) -> Option<Member<'_>> {
    match value {
        Value::Array(items) => items.get(index).map(Member::Borrowed),
        Value::String(s) => s
            .chars()
            .nth(index)
            .map(|c| Member::Computed(Value::String(c.to_string()))),
        _ => None,
    }
}

/// `+` concatenates when either side is a string, otherwise adds numbers.
fn add(left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    if left.is_string() || right.is_string() {
        return Ok(Value::String(format!("{}{}", to_display(left), to_display(right))));
    }
    if let (Value::Array(a), Value::Array(b)) = (left, right) {
        return Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()));
    }
    number(expect_number(left, "'+'")? + expect_number(right, "'+'")?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{parse_expression, ExpressionScope};
    use serde_json::json;

    fn eval_with(source: &str, scope: &ExpressionScope, item: &Value) -> Result<Value, ExpressionError> {
        let expr = parse_expression(source)?;
        evaluate(&expr, &ExpressionContext::for_item(scope, item))
    }

    fn eval(source: &str, item: Value) -> Value {
        eval_with(source, &ExpressionScope::new(), &item).unwrap()
    }

    #[test]
    fn test_arithmetic_and_concatenation() {
        assert_eq!(eval("$json.a + $json.b", json!({"a": 2, "b": 3})), json!(5));
        assert_eq!(eval("$json.a + 'x'", json!({"a": 2})), json!("2x"));
        assert_eq!(eval("7 % 4 * 2", json!({})), json!(6));
        assert_eq!(eval("1 / 4", json!({})), json!(0.25));
        assert_eq!(eval("-$json.a", json!({"a": 2})), json!(-2));
    }

    #[test]
    fn test_division_by_zero_is_an_error() {
        assert!(eval_with("1 / 0", &ExpressionScope::new(), &json!({})).is_err());
    }

    #[test]
    fn test_logical_operators_return_operands() {
        assert_eq!(eval("$json.name || 'anon'", json!({})), json!("anon"));
        assert_eq!(eval("$json.name && $json.name.upper()", json!({"name": "bo"})), json!("BO"));
        assert_eq!(eval("$json.count ?? 10", json!({"count": 0})), json!(0));
        assert_eq!(eval("$json.missing ?? 10", json!({})), json!(10));
    }

    #[test]
    fn test_comparison_and_ternary() {
        assert_eq!(eval("$json.amount > 100 ? 'big' : 'small'", json!({"amount": 150})), json!("big"));
        assert_eq!(eval("$json.code == '200'", json!({"code": 200})), json!(true));
        assert_eq!(eval("$json.code === '200'", json!({"code": 200})), json!(false));
    }

    #[test]
    fn test_member_access_is_lenient_on_missing_data() {
        assert_eq!(eval("$json.customer.address.city", json!({})), Value::Null);
        assert_eq!(eval("$json.items[1].sku", json!({"items": [{}, {"sku": "B"}]})), json!("B"));
        assert_eq!(eval("$json.tags.length", json!({"tags": ["a", "b"]})), json!(2));
    }

    #[test]
    fn test_dynamic_forbidden_key_rejected() {
        let err = eval_with(
            "$json[$json.key]",
            &ExpressionScope::new(),
            &json!({"key": "constructor"}),
        )
        .unwrap_err();
        assert!(matches!(err, ExpressionError::Forbidden(_)));
    }

    #[test]
    fn test_input_batch_accessors() {
        let scope = ExpressionScope::new();
        let items = vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})];
        let ctx = ExpressionContext::new(&scope, &items, 1);
        let run = |src: &str| evaluate(&parse_expression(src).unwrap(), &ctx).unwrap();
        assert_eq!(run("$input.first().n"), json!(1));
        assert_eq!(run("$input.last().n"), json!(3));
        assert_eq!(run("$input.item(2).n"), json!(3));
        assert_eq!(run("$input.item.n"), json!(2));
        assert_eq!(run("$input.all().length"), json!(3));
        assert_eq!(run("$itemIndex"), json!(1));
        assert_eq!(run("$input.all().pluck('n').sum()"), json!(6));
    }

    #[test]
    fn test_node_outputs() {
        let mut scope = ExpressionScope::new();
        scope.record_output("Fetch User", vec![json!({"name": "ada"}), json!({"name": "bob"})]);
        let item = json!({});
        assert_eq!(eval_with(r#"$node["Fetch User"].json.name"#, &scope, &item).unwrap(), json!("ada"));
        assert_eq!(eval_with(r#"$node["Fetch User"].last().name"#, &scope, &item).unwrap(), json!("bob"));
        assert_eq!(eval_with(r#"$node["Fetch User"].all().length"#, &scope, &item).unwrap(), json!(2));
        assert!(eval_with(r#"$node["Nope"].json"#, &scope, &item).is_err());
    }

    #[test]
    fn test_scope_bindings() {
        let scope = ExpressionScope::new()
            .with_workflow(json!({"id": "wf-1", "name": "Orders"}))
            .with_execution(json!({"id": "exec-9", "mode": "manual"}))
            .with_variables(json!({"region": "eu"}));
        let item = json!({});
        assert_eq!(eval_with("$workflow.name", &scope, &item).unwrap(), json!("Orders"));
        assert_eq!(eval_with("$execution.mode", &scope, &item).unwrap(), json!("manual"));
        assert_eq!(eval_with("$vars.region.upper()", &scope, &item).unwrap(), json!("EU"));
        assert_eq!(eval_with("$env.HOME", &scope, &item).unwrap(), Value::Null);
    }

    #[test]
    fn test_now_and_today() {
        let scope = ExpressionScope::new();
        let item = json!({});
        let now = chrono::DateTime::parse_from_rfc3339("2024-05-01T13:45:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let ctx = ExpressionContext::for_item(&scope, &item).with_now(now);
        let run = |src: &str| evaluate(&parse_expression(src).unwrap(), &ctx).unwrap();
        assert_eq!(run("$now"), json!("2024-05-01T13:45:00.000Z"));
        assert_eq!(run("$today"), json!("2024-05-01T00:00:00.000Z"));
        assert_eq!(run("formatDate($now, '%H:%M')"), json!("13:45"));
    }

    #[test]
    fn test_literals() {
        assert_eq!(eval("{a: [1, 'two', null], \"b\": true}", json!({})), json!({"a": [1, "two", null], "b": true}));
    }
}
