//! Pieces shared by the CPU C targets (native, shared object, MEX).
//!
//! Every model name lives in a file-scope `static double m_<name>`; row
//! functions assign temps, the loop commits them.

use super::{CodegenError, EmitContext, EmittedRow};
use crate::equation_engine::{format_number, Expr};
use std::fmt::Write as _;

/// Storage name of a model identifier.
pub(super) fn var(name: &str) -> String {
    format!("m_{name}")
}

pub(super) fn render(ctx: &EmitContext, expr: &Expr) -> String {
    expr.render_c(&|name| ctx.has_slot(name).then(|| var(name)))
}

/// Escapes `text` for a C string literal.
pub(super) fn c_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c if c.is_control() => {
                let _ = write!(out, "\\{:03o}", c as u32 & 0xff);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

pub(super) fn banner(ctx: &EmitContext, out: &mut String, what: &str) -> Result<(), CodegenError> {
    writeln!(
        out,
        "/* {what} for model `{}`, {} scheme, step {}. Generated by odesim. */",
        ctx.name,
        ctx.scheme,
        format_number(ctx.model_step)
    )?;
    writeln!(out, "/* Compile with -ffp-contract=off to reproduce the interpreter exactly. */")?;
    Ok(())
}

pub(super) fn includes(out: &mut String) -> Result<(), CodegenError> {
    for header in ["math.h", "stddef.h", "stdint.h", "stdio.h", "stdlib.h"] {
        writeln!(out, "#include <{header}>")?;
    }
    writeln!(out)?;
    Ok(())
}

pub(super) fn constants(ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
    writeln!(out, "#define MODEL_STEP {}", format_number(ctx.model_step))?;
    writeln!(out, "#define NUM_FIELDS {}", ctx.fields.len())?;
    writeln!(out, "#define NUM_PARS {}", ctx.arguments.len())?;
    writeln!(out, "#define NUM_INPUTS {}", ctx.inputs.len())?;
    writeln!(out)?;
    writeln!(out, "static double odesim_sign(double x)")?;
    writeln!(out, "{{")?;
    writeln!(out, "    return (double)((x > 0.0) - (x < 0.0));")?;
    writeln!(out, "}}")?;
    writeln!(out)?;
    Ok(())
}

pub(super) fn declarations(ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
    for name in &ctx.slots {
        writeln!(out, "static double {} = 0.0;", var(name))?;
    }
    writeln!(out)?;
    for k in 0..ctx.inputs.len() {
        writeln!(out, "static double* odesim_in_buf_{k} = NULL;")?;
        writeln!(
            out,
            "static long odesim_in_len_{k} = 0, odesim_in_cadence_{k} = 1, odesim_in_counter_{k} = 0, odesim_in_cursor_{k} = 0;"
        )?;
    }
    writeln!(out, "static void odesim_free_inputs(void)")?;
    writeln!(out, "{{")?;
    for k in 0..ctx.inputs.len() {
        writeln!(out, "    free(odesim_in_buf_{k});")?;
        writeln!(out, "    odesim_in_buf_{k} = NULL;")?;
    }
    writeln!(out, "}}")?;
    writeln!(out)?;
    if !ctx.inputs.is_empty() {
        out.push_str(SAMPLE_LOADER);
        writeln!(out)?;
    }
    Ok(())
}

const SAMPLE_LOADER: &str = r#"static int odesim_load_samples(const char* path, double** buf, long* len, long* cadence)
{
    FILE* f = fopen(path, "rb");
    if (!f) {
        return -1;
    }
    int32_t header[3];
    if (fread(header, sizeof(int32_t), 3, f) != 3 || header[0] != 1 || header[1] <= 0 || header[2] <= 0) {
        fclose(f);
        return -1;
    }
    double* samples = (double*)malloc((size_t)header[2] * sizeof(double));
    if (!samples || fread(samples, sizeof(double), (size_t)header[2], f) != (size_t)header[2]) {
        free(samples);
        fclose(f);
        return -1;
    }
    fclose(f);
    long c = (long)ceil(1.0 / (MODEL_STEP * (double)header[1]));
    *buf = samples;
    *len = header[2];
    *cadence = c < 1 ? 1 : c;
    return 0;
}
"#;

pub(super) fn row_function(ctx: &EmitContext, row: &EmittedRow, out: &mut String) -> Result<(), CodegenError> {
    writeln!(out, "static void odesim_eval_{}(void)", row.key)?;
    writeln!(out, "{{")?;
    writeln!(out, "    {};", render(ctx, &row.formula))?;
    writeln!(out, "}}")?;
    writeln!(out)?;
    Ok(())
}

/// Assigns every argument from `source(i)` and resets the evaluating rows:
/// Variables and temps to zero, State to its InitialCondition.
pub(super) fn assign_arguments(
    ctx: &EmitContext,
    out: &mut String,
    source: impl Fn(usize) -> String,
) -> Result<(), CodegenError> {
    for (i, arg) in ctx.arguments.iter().enumerate() {
        writeln!(out, "    {} = {};", var(&arg.key), source(i))?;
    }
    for row in ctx.rows() {
        writeln!(out, "    {} = 0.0;", var(&row.temp))?;
    }
    for row in &ctx.variables {
        writeln!(out, "    {} = 0.0;", var(&row.key))?;
    }
    for (state, initial) in &ctx.state_initials {
        writeln!(out, "    {} = {};", var(state), var(initial))?;
    }
    Ok(())
}

/// Declares `numIters` and `numRecords` from `duration` and `saveModN`.
pub(super) fn iteration_count(out: &mut String) -> Result<(), CodegenError> {
    writeln!(out, "    if (saveModN < 1) {{")?;
    writeln!(out, "        saveModN = 1;")?;
    writeln!(out, "    }}")?;
    writeln!(out, "    long numIters = (long)floor(duration / MODEL_STEP + 0.5);")?;
    writeln!(out, "    if (numIters < 0) {{")?;
    writeln!(out, "        numIters = 0;")?;
    writeln!(out, "    }}")?;
    writeln!(out, "    long numRecords = (numIters + saveModN - 1) / saveModN;")?;
    Ok(())
}

/// Loads every input stream and publishes its first sample. `on_error` is
/// the statement run when a file cannot be read.
pub(super) fn input_load(ctx: &EmitContext, out: &mut String, on_error: &str) -> Result<(), CodegenError> {
    let paths = ctx.input_paths()?;
    for (k, path) in paths.iter().enumerate() {
        let literal = c_string(&path.display().to_string());
        writeln!(
            out,
            "    if (odesim_load_samples({literal}, &odesim_in_buf_{k}, &odesim_in_len_{k}, &odesim_in_cadence_{k}) != 0) {{"
        )?;
        writeln!(out, "        odesim_free_inputs();")?;
        writeln!(out, "        {on_error}")?;
        writeln!(out, "    }}")?;
        writeln!(out, "    odesim_in_counter_{k} = 0;")?;
        writeln!(out, "    odesim_in_cursor_{k} = 0;")?;
    }
    for (k, key) in ctx.input_listeners() {
        writeln!(out, "    {} = odesim_in_buf_{k}[0];", var(key))?;
    }
    Ok(())
}

pub(super) fn loop_begin(out: &mut String) -> Result<(), CodegenError> {
    writeln!(out, "    long rec = 0;")?;
    writeln!(out, "    for (long iter = 0; iter < numIters; ++iter) {{")?;
    Ok(())
}

/// Variables publish their value as soon as it is computed.
pub(super) fn evaluate_variables(ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
    for row in &ctx.variables {
        writeln!(out, "        odesim_eval_{}();", row.key)?;
        writeln!(out, "        {} = {};", var(&row.key), var(&row.temp))?;
    }
    Ok(())
}

pub(super) fn evaluate_state(ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
    for row in &ctx.states {
        writeln!(out, "        odesim_eval_{}();", row.key)?;
    }
    Ok(())
}

pub(super) fn commit(ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
    for row in ctx.rows() {
        writeln!(out, "        {} = {};", var(&row.key), var(&row.temp))?;
    }
    Ok(())
}

pub(super) fn advance_inputs(ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
    for k in 0..ctx.inputs.len() {
        writeln!(out, "        if (++odesim_in_counter_{k} >= odesim_in_cadence_{k}) {{")?;
        writeln!(out, "            odesim_in_counter_{k} = 0;")?;
        writeln!(
            out,
            "            odesim_in_cursor_{k} = (odesim_in_cursor_{k} + 1) % odesim_in_len_{k};"
        )?;
        writeln!(out, "        }}")?;
    }
    for (k, key) in ctx.input_listeners() {
        writeln!(out, "        {} = odesim_in_buf_{k}[odesim_in_cursor_{k}];", var(key))?;
    }
    Ok(())
}

/// Stores the fields into the column-major `data` buffer every
/// `saveModN`-th iteration.
pub(super) fn record(ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
    writeln!(out, "        if (iter % saveModN == 0) {{")?;
    for (f, field) in ctx.fields.iter().enumerate() {
        writeln!(out, "            data[(size_t){f} * (size_t)numRecords + (size_t)rec] = {};", var(field))?;
    }
    writeln!(out, "            ++rec;")?;
    writeln!(out, "        }}")?;
    Ok(())
}

pub(super) fn conditions(ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
    for condition in &ctx.conditions {
        writeln!(out, "        if ({}) {{", render(ctx, &condition.test))?;
        for result in &condition.results {
            writeln!(out, "            {};", render(ctx, result))?;
        }
        writeln!(out, "        }}")?;
    }
    Ok(())
}

pub(super) fn loop_end(out: &mut String) -> Result<(), CodegenError> {
    writeln!(out, "    }}")?;
    Ok(())
}

/// Interval-RMSE bookkeeping shared by the measure targets.
///
/// `value` is the C expression of the measured field. The first call
/// (`at == "0"`) samples leading empty intervals before the loop.
pub(super) fn measure_sample(
    out: &mut String,
    indent: &str,
    value: &str,
    at: &str,
) -> Result<(), CodegenError> {
    writeln!(out, "{indent}while (measureK < numIntervals && measureBoundary == {at}) {{")?;
    writeln!(out, "{indent}    double err = {value} - target[measureK];")?;
    writeln!(out, "{indent}    measureSum += err * err;")?;
    writeln!(out, "{indent}    ++measureK;")?;
    writeln!(out, "{indent}    if (measureK < numIntervals) {{")?;
    writeln!(out, "{indent}        measureBoundary += (long)intervalLens[measureK];")?;
    writeln!(out, "{indent}    }}")?;
    writeln!(out, "{indent}}}")?;
    Ok(())
}

/// The leaves every CPU C target shares, expanded inside an `Emitter` impl.
macro_rules! cpu_leaves {
    () => {
        fn declarations(
            &mut self,
            ctx: &$crate::codegen::EmitContext,
            out: &mut String,
        ) -> Result<(), $crate::codegen::CodegenError> {
            super::c::declarations(ctx, out)
        }

        fn row_function(
            &mut self,
            ctx: &$crate::codegen::EmitContext,
            row: &$crate::codegen::EmittedRow,
            out: &mut String,
        ) -> Result<(), $crate::codegen::CodegenError> {
            super::c::row_function(ctx, row, out)
        }

        fn loop_begin(
            &mut self,
            _ctx: &$crate::codegen::EmitContext,
            out: &mut String,
        ) -> Result<(), $crate::codegen::CodegenError> {
            super::c::loop_begin(out)
        }

        fn evaluate_variables(
            &mut self,
            ctx: &$crate::codegen::EmitContext,
            out: &mut String,
        ) -> Result<(), $crate::codegen::CodegenError> {
            super::c::evaluate_variables(ctx, out)
        }

        fn evaluate_state(
            &mut self,
            ctx: &$crate::codegen::EmitContext,
            out: &mut String,
        ) -> Result<(), $crate::codegen::CodegenError> {
            super::c::evaluate_state(ctx, out)
        }

        fn commit(
            &mut self,
            ctx: &$crate::codegen::EmitContext,
            out: &mut String,
        ) -> Result<(), $crate::codegen::CodegenError> {
            super::c::commit(ctx, out)
        }

        fn advance_inputs(
            &mut self,
            ctx: &$crate::codegen::EmitContext,
            out: &mut String,
        ) -> Result<(), $crate::codegen::CodegenError> {
            super::c::advance_inputs(ctx, out)
        }

        fn conditions(
            &mut self,
            ctx: &$crate::codegen::EmitContext,
            out: &mut String,
        ) -> Result<(), $crate::codegen::CodegenError> {
            super::c::conditions(ctx, out)
        }

        fn loop_end(
            &mut self,
            _ctx: &$crate::codegen::EmitContext,
            out: &mut String,
        ) -> Result<(), $crate::codegen::CodegenError> {
            super::c::loop_end(out)
        }
    };
}
pub(super) use cpu_leaves;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::tests::{neuron, options};

    #[test]
    fn model_names_are_prefixed() {
        let ctx = EmitContext::new(&neuron(), &options()).expect("context");
        assert_eq!(
            render(&ctx, &ctx.states[0].formula),
            "m_v_temp_ = m_v+MODEL_STEP*(m_tau*(m_u+m_a)/m_b)"
        );
        let mut out = String::new();
        conditions(&ctx, &mut out).expect("conditions");
        assert!(out.contains("if (m_v>30.0) {"), "{out}");
        assert!(out.contains("m_u = m_u+8.0;"), "{out}");
    }

    #[test]
    fn strings_are_escaped() {
        assert_eq!(c_string(r#"C:\data\"in".bin"#), r#""C:\\data\\\"in\".bin""#);
    }
}
