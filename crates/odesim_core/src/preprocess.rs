//! Text-level rewrite of the power operator.
//!
//! Model authors write `a^b`; C has no such operator, and the interpreter and
//! the code generators must see the same text. [`rewrite_power`] turns every
//! `base^exp` into `pow(base,exp)` before either backend touches the formula.

/// Characters that terminate an operand when found at parenthesis depth 0.
const BOUNDARY_OPERATORS: &str = "<>?:!%&|~=+-*/,";

/// Rewrites every `base^exp` into `pow(base,exp)`, innermost-left first,
/// until no `^` remains. Whitespace is stripped. The result is a fixpoint:
/// rewriting it again returns it unchanged.
pub fn rewrite_power(expr: &str) -> String {
    let mut chars: Vec<char> = expr.chars().filter(|c| !c.is_whitespace()).collect();

    while let Some(caret) = chars.iter().position(|&c| c == '^') {
        let base_start = scan_base_start(&chars, caret);
        let exp_end = scan_exponent_end(&chars, caret);

        let mut rewritten: Vec<char> = Vec::with_capacity(chars.len() + 6);
        rewritten.extend_from_slice(&chars[..base_start]);
        rewritten.extend("pow(".chars());
        rewritten.extend_from_slice(&chars[base_start..caret]);
        rewritten.push(',');
        rewritten.extend_from_slice(&chars[caret + 1..exp_end]);
        rewritten.push(')');
        rewritten.extend_from_slice(&chars[exp_end..]);
        chars = rewritten;
    }

    chars.into_iter().collect()
}

/// Walks left from the `^` at `caret` and returns the index where the base
/// operand begins.
fn scan_base_start(chars: &[char], caret: usize) -> usize {
    let mut depth = 0usize;
    let mut i = caret;
    while i > 0 {
        let c = chars[i - 1];
        match c {
            ')' => depth += 1,
            '(' => {
                if depth == 0 {
                    // Unmatched: we are inside a call's argument list.
                    return i;
                }
                depth -= 1;
            }
            _ if depth == 0
                && BOUNDARY_OPERATORS.contains(c)
                && !is_literal_exponent_sign(chars, i - 1) =>
            {
                return i;
            }
            _ => {}
        }
        i -= 1;
    }
    0
}

/// Walks right from the `^` at `caret` and returns the index one past the
/// end of the exponent operand.
fn scan_exponent_end(chars: &[char], caret: usize) -> usize {
    let mut j = caret + 1;
    if j < chars.len() && (chars[j] == '-' || chars[j] == '+') {
        j += 1;
    }
    let mut depth = 0usize;
    while j < chars.len() {
        let c = chars[j];
        match c {
            '(' => depth += 1,
            ')' => {
                if depth == 0 {
                    return j;
                }
                depth -= 1;
            }
            '^' if depth == 0 => return j,
            _ if depth == 0
                && BOUNDARY_OPERATORS.contains(c)
                && !is_literal_exponent_sign(chars, j) =>
            {
                return j;
            }
            _ => {}
        }
        j += 1;
    }
    chars.len()
}

/// True when the `+`/`-` at `idx` is the exponent sign of a numeric literal
/// such as `2.5e-3`, which must not split the operand.
fn is_literal_exponent_sign(chars: &[char], idx: usize) -> bool {
    if !matches!(chars[idx], '+' | '-') || idx < 2 {
        return false;
    }
    if !matches!(chars[idx - 1], 'e' | 'E') {
        return false;
    }
    // The mantissa must be a bare number, not the tail of an identifier
    // like `rate-1`.
    let mut k = idx - 1;
    let mut saw_digit = false;
    while k > 0 {
        let c = chars[k - 1];
        if c.is_ascii_digit() {
            saw_digit = true;
        } else if c != '.' {
            if c.is_alphanumeric() || c == '_' {
                return false;
            }
            break;
        }
        k -= 1;
    }
    saw_digit
}

#[cfg(test)]
mod tests {
    use super::rewrite_power;

    #[test]
    fn rewrites_simple_power() {
        assert_eq!(rewrite_power("a^2"), "pow(a,2)");
        assert_eq!(rewrite_power("a ^ 2"), "pow(a,2)");
    }

    #[test]
    fn chained_powers_associate_left() {
        assert_eq!(rewrite_power("a^b^c"), "pow(pow(a,b),c)");
    }

    #[test]
    fn parenthesized_operands_are_kept_whole() {
        assert_eq!(rewrite_power("(x+1)^(y-2)"), "pow((x+1),(y-2))");
        assert_eq!(rewrite_power("a^(b+c)"), "pow(a,(b+c))");
        assert_eq!(rewrite_power("f(x)^2*3"), "pow(f(x),2)*3");
    }

    #[test]
    fn leading_minus_belongs_to_exponent() {
        assert_eq!(rewrite_power("a^-2"), "pow(a,-2)");
        assert_eq!(rewrite_power("a^-b+1"), "pow(a,-b)+1");
    }

    #[test]
    fn operators_bound_the_operands() {
        assert_eq!(rewrite_power("2*x^3+1"), "2*pow(x,3)+1");
        assert_eq!(rewrite_power("-x^2"), "-pow(x,2)");
        assert_eq!(rewrite_power("x>y^2?1:0"), "x>pow(y,2)?1:0");
        assert_eq!(rewrite_power("v=u^2"), "v=pow(u,2)");
    }

    #[test]
    fn powers_inside_call_arguments() {
        assert_eq!(rewrite_power("max(a,b^2)"), "max(a,pow(b,2))");
        assert_eq!(rewrite_power("sin(x^2)"), "sin(pow(x,2))");
        assert_eq!(rewrite_power("exp(-(x-m)^2/s)"), "exp(-pow((x-m),2)/s)");
    }

    #[test]
    fn numeric_literal_exponents_are_not_boundaries() {
        assert_eq!(rewrite_power("1e-3^2"), "pow(1e-3,2)");
        assert_eq!(rewrite_power("x^2.5e-1"), "pow(x,2.5e-1)");
        assert_eq!(rewrite_power("rate-1^2"), "rate-pow(1,2)");
    }

    #[test]
    fn exponent_at_string_edges() {
        assert_eq!(rewrite_power("x^y"), "pow(x,y)");
        assert_eq!(rewrite_power("(x)^(y)"), "pow((x),(y))");
    }

    #[test]
    fn rewrite_is_idempotent() {
        for source in ["a^b^c", "(x+1)^(y-2)", "a^-2", "x + y", "", "pow(a,2)"] {
            let once = rewrite_power(source);
            assert_eq!(rewrite_power(&once), once, "source {source:?}");
        }
    }
}
