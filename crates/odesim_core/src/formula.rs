//! Per-row commit formulas.
//!
//! Every evaluating row is reduced to one line of text in the model grammar
//! that assigns the row's temp shadow (`<key>_temp_`). The interpreter parses
//! and compiles that text; the code generators render the very same tree as
//! C. The only thing that differs between the two is the [`StepRepr`]: a
//! numeric literal for the interpreter, the `MODEL_STEP` constant for
//! generated code.

use crate::equation_engine::{format_number, parse, Expr, ExprError};
use crate::preprocess::rewrite_power;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Suffix of the private shadow each evaluating row writes before commit.
pub const TEMP_SUFFIX: &str = "_temp_";

/// Scratch slopes shared by the Heun and RK4 formulas.
pub const SCRATCH_NAMES: [&str; 4] = ["__k1", "__k2", "__k3", "__k4"];

/// Name of the step-size constant in generated sources.
pub const STEP_CONSTANT: &str = "MODEL_STEP";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Euler,
    /// Heun as historically implemented: the derivative is evaluated once
    /// and reused, see [`commit_formula`].
    Heun,
    Rk4,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scheme::Euler => "euler",
            Scheme::Heun => "heun",
            Scheme::Rk4 => "rk4",
        })
    }
}

impl FromStr for Scheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "euler" => Ok(Scheme::Euler),
            "heun" => Ok(Scheme::Heun),
            "rk4" => Ok(Scheme::Rk4),
            other => Err(format!("unknown integration scheme `{other}`")),
        }
    }
}

/// Textual representation of the model step inside a formula.
#[derive(Debug, Clone, PartialEq)]
pub enum StepRepr {
    /// The step written as a number, for the interpreter.
    Literal(f64),
    /// The step written as a named constant, for generated code.
    Symbol(String),
}

impl StepRepr {
    pub fn generated() -> Self {
        StepRepr::Symbol(STEP_CONSTANT.to_string())
    }

    pub fn text(&self) -> String {
        match self {
            StepRepr::Literal(value) => format_number(*value),
            StepRepr::Symbol(name) => name.clone(),
        }
    }
}

pub fn temp_name(key: &str) -> String {
    format!("{key}{TEMP_SUFFIX}")
}

/// Builds the commit formula of a State row.
///
/// - Euler: `key_temp_ = key + h*(f)`
/// - Heun: `__k1 = key + h*(f), key_temp_ = key + h*0.5*((f) + __k1)`.
///   `f` is not re-evaluated at the predicted state; trajectories recorded
///   with this scheme depend on that exact formula.
/// - RK4: the four stages, with every read of `key` in `f` replaced by the
///   staged state, followed by the weighted update.
///
/// `derivative` is preprocessed with [`rewrite_power`] first, so callers may
/// pass user text unchanged.
pub fn commit_formula(
    key: &str,
    derivative: &str,
    step: &StepRepr,
    scheme: Scheme,
) -> Result<String, ExprError> {
    let h = step.text();
    let temp = temp_name(key);
    let derivative = normalized(derivative)?;

    Ok(match scheme {
        Scheme::Euler => format!("{temp} = {key} + {h}*({derivative})"),
        Scheme::Heun => format!(
            "__k1 = {key} + {h}*({derivative}), {temp} = {key} + {h}*0.5*(({derivative}) + __k1)"
        ),
        Scheme::Rk4 => {
            let tree = parse(&derivative)?;
            let stage = |replacement: String| -> Result<String, ExprError> {
                let replacement = parse(&replacement)?;
                Ok(tree.substitute(key, &replacement).render())
            };
            let k2 = stage(format!("({key} + ({h}/2)*__k1)"))?;
            let k3 = stage(format!("({key} + ({h}/2)*__k2)"))?;
            let k4 = stage(format!("({key} + {h}*__k3)"))?;
            format!(
                "__k1 = {derivative}, __k2 = {k2}, __k3 = {k3}, __k4 = {k4}, \
                 {temp} = {key} + ({h}/6)*(__k1 + 2*__k2 + 2*__k3 + __k4)"
            )
        }
    })
}

/// Commit formula of an expression-driven Variable row.
pub fn variable_formula(key: &str, expression: &str) -> Result<String, ExprError> {
    Ok(format!("{} = {}", temp_name(key), normalized(expression)?))
}

/// Commit formula of a frozen row: the temp is forced to `reset`.
pub fn frozen_formula(key: &str, reset: &str) -> String {
    format!("{} = {}", temp_name(key), reset)
}

/// Power-rewrites `text` and renders it back through the parser so that the
/// formula embeds a canonical, fully-checked expression. Blank text becomes
/// `0.0`.
fn normalized(text: &str) -> Result<String, ExprError> {
    let rewritten = rewrite_power(text);
    let tree = parse(&rewritten)?;
    if matches!(tree, Expr::Sequence(_)) {
        // A bare sequence would change meaning once wrapped in `h*(...)`.
        return Ok(format!("({})", tree.render()));
    }
    Ok(tree.render())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::{compile_text, SymbolTable, VM};

    fn run(formula: &str, names: &[(&str, f64)]) -> Vec<f64> {
        let mut symbols = SymbolTable::new();
        let mut slots = Vec::new();
        for (name, value) in names {
            symbols.insert(name);
            slots.push(*value);
        }
        let code = compile_text(formula, &symbols).expect("formula should compile");
        VM::execute(&code, &mut slots, &mut Vec::new());
        slots
    }

    #[test]
    fn euler_formula_text() {
        let text = commit_formula("x", "-x", &StepRepr::Literal(0.1), Scheme::Euler).expect("formula");
        assert_eq!(text, "x_temp_ = x + 0.1*(-x)");
        let text = commit_formula("x", "-x", &StepRepr::generated(), Scheme::Euler).expect("formula");
        assert_eq!(text, "x_temp_ = x + MODEL_STEP*(-x)");
    }

    #[test]
    fn heun_reuses_the_single_derivative_evaluation() {
        let text = commit_formula("x", "a*x", &StepRepr::Literal(0.5), Scheme::Heun).expect("formula");
        assert_eq!(text, "__k1 = x + 0.5*(a*x), x_temp_ = x + 0.5*0.5*((a*x) + __k1)");
        let slots = run(&text, &[("x", 1.0), ("a", 2.0), ("__k1", 0.0), ("x_temp_", 0.0)]);
        // k1 = 1 + 0.5*2 = 2 ; temp = 1 + 0.25*(2 + 2) = 2
        assert_eq!(slots[2], 2.0);
        assert_eq!(slots[3], 2.0);
    }

    #[test]
    fn heun_keeps_a_comparison_derivative_whole() {
        let text = commit_formula("x", "x > a", &StepRepr::Literal(0.5), Scheme::Heun).expect("formula");
        let slots = run(&text, &[("x", 1.0), ("a", 0.5), ("__k1", 0.0), ("x_temp_", 0.0)]);
        // f = 1 ; k1 = 1.5 ; temp = 1 + 0.25*(1 + 1.5)
        assert_eq!(slots[2], 1.5);
        assert_eq!(slots[3], 1.625);
    }

    #[test]
    fn rk4_matches_classic_runge_kutta_step() {
        let h = 0.1;
        let text = commit_formula("x", "x*x - a", &StepRepr::Literal(h), Scheme::Rk4).expect("formula");
        let names = [
            ("x", 0.7),
            ("a", 0.3),
            ("__k1", 0.0),
            ("__k2", 0.0),
            ("__k3", 0.0),
            ("__k4", 0.0),
            ("x_temp_", 0.0),
        ];
        let slots = run(&text, &names);

        let f = |x: f64| x * x - 0.3;
        let x = 0.7;
        let k1 = f(x);
        let k2 = f(x + (h / 2.0) * k1);
        let k3 = f(x + (h / 2.0) * k2);
        let k4 = f(x + h * k3);
        let expected = x + (h / 6.0) * (k1 + 2.0 * k2 + 2.0 * k3 + k4);
        assert!((slots[6] - expected).abs() < 1e-15, "{} vs {expected}", slots[6]);
    }

    #[test]
    fn rk4_substitution_ignores_longer_identifiers() {
        let text = commit_formula("x", "x + x2 + xx", &StepRepr::generated(), Scheme::Rk4).expect("formula");
        assert!(text.contains("__k2 = x+MODEL_STEP/2.0*__k1+x2+xx"), "{text}");
        assert!(text.contains("__k4 = x+MODEL_STEP*__k3+x2+xx"), "{text}");
    }

    #[test]
    fn power_operator_is_rewritten_before_embedding() {
        let text = commit_formula("y", "y^2", &StepRepr::Literal(1.0), Scheme::Euler).expect("formula");
        assert_eq!(text, "y_temp_ = y + 1.0*(pow(y,2.0))");
    }

    #[test]
    fn empty_derivative_is_zero() {
        let text = commit_formula("y", "", &StepRepr::Literal(0.25), Scheme::Euler).expect("formula");
        assert_eq!(text, "y_temp_ = y + 0.25*(0.0)");
    }

    #[test]
    fn variable_and_frozen_formulas() {
        assert_eq!(variable_formula("w", "a + b").expect("formula"), "w_temp_ = a+b");
        assert_eq!(frozen_formula("x", "x_0"), "x_temp_ = x_0");
    }

    #[test]
    fn scheme_parses_from_text() {
        assert_eq!("RK4".parse::<Scheme>(), Ok(Scheme::Rk4));
        assert!("midpoint".parse::<Scheme>().is_err());
    }
}
