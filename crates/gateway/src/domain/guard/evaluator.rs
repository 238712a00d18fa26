//! Declarative billing constraints.
//!
//! Constraints are small fixed-form expressions like
//! `bigint_gte(limit, spent)` compiled once at boot. Evaluation pulls named
//! integer fields from a per-check context; anything missing or mistyped is
//! an evaluation error, which the guard treats as a failure.

use std::collections::BTreeMap;

/// A constraint as configured: an id plus its expression source.
#[derive(Clone, Debug, serde::Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Constraint {
    pub id: String,
    pub expr: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Function {
    /// `bigint_gte(a, b)` — a ≥ b.
    BigintGte,
    /// `bigint_lte(a, b)` — a ≤ b.
    BigintLte,
    /// `bigint_eq(a, b)` — a = b.
    BigintEq,
    /// `sum_is_zero(xs)` — Σxs = 0, the ledger conservation form.
    SumIsZero,
}

impl Function {
    fn parse(name: &str) -> Option<(Self, usize)> {
        match name {
            "bigint_gte" => Some((Self::BigintGte, 2)),
            "bigint_lte" => Some((Self::BigintLte, 2)),
            "bigint_eq" => Some((Self::BigintEq, 2)),
            "sum_is_zero" => Some((Self::SumIsZero, 1)),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Operand {
    Field(String),
    Zero,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompiledConstraint {
    pub id: String,
    function: Function,
    args: Vec<Operand>,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("constraint {id}: malformed expression {expr:?}")]
    Syntax { id: String, expr: String },
    #[error("constraint {id}: unknown function {name:?}")]
    UnknownFunction { id: String, name: String },
    #[error("constraint {id}: {name} takes {expected} arguments, got {got}")]
    Arity {
        id: String,
        name: String,
        expected: usize,
        got: usize,
    },
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("field {0:?} missing from check context")]
    MissingField(String),
    #[error("field {0:?} has the wrong type")]
    TypeMismatch(String),
}

/// Named values supplied per check.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ContextValue {
    Int(i128),
    IntList(Vec<i128>),
}

pub type CheckContext = BTreeMap<String, ContextValue>;

impl CompiledConstraint {
    /// Parses `function(arg, ...)`. Identifiers are field references except
    /// the literal `zero`.
    pub fn compile(constraint: &Constraint) -> Result<Self, CompileError> {
        let expr = constraint.expr.trim();
        let syntax = || CompileError::Syntax {
            id: constraint.id.clone(),
            expr: constraint.expr.clone(),
        };
        let open = expr.find('(').ok_or_else(syntax)?;
        let close = expr.rfind(')').ok_or_else(syntax)?;
        if close != expr.len() - 1 || open == 0 {
            return Err(syntax());
        }
        let name = expr[..open].trim();
        let (function, expected) =
            Function::parse(name).ok_or_else(|| CompileError::UnknownFunction {
                id: constraint.id.clone(),
                name: name.to_string(),
            })?;
        let args: Vec<Operand> = expr[open + 1..close]
            .split(',')
            .map(str::trim)
            .filter(|arg| !arg.is_empty())
            .map(|arg| {
                if !arg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(syntax());
                }
                Ok(match arg {
                    "zero" => Operand::Zero,
                    field => Operand::Field(field.to_string()),
                })
            })
            .collect::<Result<_, _>>()?;
        if args.len() != expected {
            return Err(CompileError::Arity {
                id: constraint.id.clone(),
                name: name.to_string(),
                expected,
                got: args.len(),
            });
        }
        Ok(Self {
            id: constraint.id.clone(),
            function,
            args,
        })
    }

    pub fn evaluate(&self, context: &CheckContext) -> Result<bool, EvalError> {
        match self.function {
            Function::BigintGte => Ok(self.int(0, context)? >= self.int(1, context)?),
            Function::BigintLte => Ok(self.int(0, context)? <= self.int(1, context)?),
            Function::BigintEq => Ok(self.int(0, context)? == self.int(1, context)?),
            Function::SumIsZero => {
                let values = self.list(0, context)?;
                Ok(values.iter().sum::<i128>() == 0)
            }
        }
    }

    fn int(&self, index: usize, context: &CheckContext) -> Result<i128, EvalError> {
        match &self.args[index] {
            Operand::Zero => Ok(0),
            Operand::Field(name) => match context.get(name) {
                Some(ContextValue::Int(value)) => Ok(*value),
                Some(_) => Err(EvalError::TypeMismatch(name.clone())),
                None => Err(EvalError::MissingField(name.clone())),
            },
        }
    }

    fn list<'a>(&self, index: usize, context: &'a CheckContext) -> Result<&'a [i128], EvalError> {
        match &self.args[index] {
            Operand::Zero => Ok(&[]),
            Operand::Field(name) => match context.get(name) {
                Some(ContextValue::IntList(values)) => Ok(values),
                Some(_) => Err(EvalError::TypeMismatch(name.clone())),
                None => Err(EvalError::MissingField(name.clone())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constraint(id: &str, expr: &str) -> Constraint {
        Constraint {
            id: id.to_string(),
            expr: expr.to_string(),
        }
    }

    fn ints(pairs: &[(&str, i128)]) -> CheckContext {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), ContextValue::Int(*v)))
            .collect()
    }

    #[test]
    fn gte_over_context_fields() {
        let compiled =
            CompiledConstraint::compile(&constraint("spend", "bigint_gte(limit, spent)")).unwrap();
        assert!(compiled.evaluate(&ints(&[("limit", 100), ("spent", 99)])).unwrap());
        assert!(compiled.evaluate(&ints(&[("limit", 100), ("spent", 100)])).unwrap());
        assert!(!compiled.evaluate(&ints(&[("limit", 100), ("spent", 101)])).unwrap());
    }

    #[test]
    fn zero_literal() {
        let compiled =
            CompiledConstraint::compile(&constraint("cost", "bigint_gte(cost, zero)")).unwrap();
        assert!(compiled.evaluate(&ints(&[("cost", 0)])).unwrap());
        assert!(!compiled.evaluate(&ints(&[("cost", -1)])).unwrap());
    }

    #[test]
    fn conservation_sums_postings() {
        let compiled =
            CompiledConstraint::compile(&constraint("conserve", "sum_is_zero(postings)")).unwrap();
        let balanced = CheckContext::from([(
            "postings".to_string(),
            ContextValue::IntList(vec![500, -300, -200]),
        )]);
        assert!(compiled.evaluate(&balanced).unwrap());
        let leaky = CheckContext::from([(
            "postings".to_string(),
            ContextValue::IntList(vec![500, -300]),
        )]);
        assert!(!compiled.evaluate(&leaky).unwrap());
    }

    #[test]
    fn missing_field_is_an_error_not_false() {
        let compiled =
            CompiledConstraint::compile(&constraint("spend", "bigint_gte(limit, spent)")).unwrap();
        assert_eq!(
            compiled.evaluate(&ints(&[("limit", 100)])),
            Err(EvalError::MissingField("spent".to_string()))
        );
    }

    #[test]
    fn compile_rejections() {
        assert!(matches!(
            CompiledConstraint::compile(&constraint("x", "nonsense(")),
            Err(CompileError::Syntax { .. })
        ));
        assert!(matches!(
            CompiledConstraint::compile(&constraint("x", "frobnicate(a, b)")),
            Err(CompileError::UnknownFunction { .. })
        ));
        assert!(matches!(
            CompiledConstraint::compile(&constraint("x", "bigint_gte(a)")),
            Err(CompileError::Arity { .. })
        ));
        assert!(matches!(
            CompiledConstraint::compile(&constraint("x", "bigint_gte(a, b-c)")),
            Err(CompileError::Syntax { .. })
        ));
    }
}
