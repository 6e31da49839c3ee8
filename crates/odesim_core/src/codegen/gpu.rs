//! CUDA kernel, one thread per parameter set.
//!
//! ```text
//! simulate(input, inputLen, samplesPerUnitTime, parMatrix, numPars, numTests, out)
//! ```
//!
//! Row `tid` of `parMatrix` is `[duration, saveModN, parameters...,
//! initial conditions...]`. Stream `k` of `input` occupies
//! `input[k * inputLen .. (k + 1) * inputLen]`. Every thread keeps its model
//! in a local slot array; the plain kernel writes its trajectory at
//! `out + tid * NUM_FIELDS * numRecords`, the measure kernel writes the
//! interval RMSE to `out[tid]`.

use super::c::measure_sample;
use super::{CodegenError, EmitContext, EmittedRow, Emitter};
use crate::equation_engine::{format_number, Expr};
use std::fmt::Write as _;

pub struct GpuEmitter {
    pub measure: bool,
}

fn slot(name: &str) -> String {
    format!("s[OFF_{name}]")
}

fn render(ctx: &EmitContext, expr: &Expr) -> String {
    expr.render_c(&|name| ctx.has_slot(name).then(|| slot(name)))
}

impl Emitter for GpuEmitter {
    fn includes(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        let what = if self.measure { "CUDA measure kernel" } else { "CUDA kernel" };
        writeln!(
            out,
            "/* {what} for model `{}`, {} scheme, step {}. Generated by odesim. */",
            ctx.name,
            ctx.scheme,
            format_number(ctx.model_step)
        )?;
        writeln!(out, "/* Compile with --fmad=false to reproduce the interpreter exactly. */")?;
        writeln!(out, "#include <math.h>")?;
        writeln!(out)?;
        Ok(())
    }

    fn constants(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        writeln!(out, "#define MODEL_STEP {}", format_number(ctx.model_step))?;
        writeln!(out, "#define NUM_FIELDS {}", ctx.fields.len())?;
        writeln!(out, "#define NUM_PARS {}", ctx.arguments.len())?;
        writeln!(out, "#define NUM_INPUTS {}", ctx.inputs.len())?;
        // nvcc rejects zero-length arrays.
        writeln!(out, "#define NUM_SLOTS {}", ctx.slots.len().max(1))?;
        writeln!(out)?;
        for (index, name) in ctx.slots.iter().enumerate() {
            writeln!(out, "#define OFF_{name} {index}")?;
        }
        writeln!(out)?;
        writeln!(out, "__device__ double odesim_sign(double x)")?;
        writeln!(out, "{{")?;
        writeln!(out, "    return (double)((x > 0.0) - (x < 0.0));")?;
        writeln!(out, "}}")?;
        writeln!(out)?;
        Ok(())
    }

    fn row_function(&mut self, ctx: &EmitContext, row: &EmittedRow, out: &mut String) -> Result<(), CodegenError> {
        writeln!(out, "__device__ void odesim_eval_{}(double* s)", row.key)?;
        writeln!(out, "{{")?;
        writeln!(out, "    {};", render(ctx, &row.formula))?;
        writeln!(out, "}}")?;
        writeln!(out)?;
        Ok(())
    }

    fn entry_prologue(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        let extra = if self.measure {
            ",\n                         const double* target, const int* intervalLens, int numIntervals"
        } else {
            ""
        };
        writeln!(
            out,
            "extern \"C\" __global__ void simulate(const double* input, int inputLen, const int* samplesPerUnitTime,\n                         const double* parMatrix, int numPars, int numTests, double* out{extra})"
        )?;
        writeln!(out, "{{")?;
        writeln!(out, "    int tid = blockIdx.x * blockDim.x + threadIdx.x;")?;
        writeln!(out, "    if (tid >= numTests || numPars != 2 + NUM_PARS) {{")?;
        writeln!(out, "        return;")?;
        writeln!(out, "    }}")?;
        writeln!(out, "    const double* pars = parMatrix + (size_t)tid * (size_t)numPars;")?;
        writeln!(out, "    double s[NUM_SLOTS];")?;
        writeln!(out, "    for (int i = 0; i < NUM_SLOTS; ++i) {{")?;
        writeln!(out, "        s[i] = 0.0;")?;
        writeln!(out, "    }}")?;
        for (i, arg) in ctx.arguments.iter().enumerate() {
            writeln!(out, "    {} = pars[{}];", slot(&arg.key), 2 + i)?;
        }
        for (state, initial) in &ctx.state_initials {
            writeln!(out, "    {} = {};", slot(state), slot(initial))?;
        }
        writeln!(out, "    long saveModN = (long)pars[1];")?;
        writeln!(out, "    if (saveModN < 1) {{")?;
        writeln!(out, "        saveModN = 1;")?;
        writeln!(out, "    }}")?;
        if self.measure {
            writeln!(out, "    long numIters = 0;")?;
            writeln!(out, "    for (int k = 0; k < numIntervals; ++k) {{")?;
            writeln!(out, "        numIters += intervalLens[k] > 0 ? intervalLens[k] : 0;")?;
            writeln!(out, "    }}")?;
        } else {
            writeln!(out, "    long numIters = (long)floor(pars[0] / MODEL_STEP + 0.5);")?;
            writeln!(out, "    if (numIters < 0) {{")?;
            writeln!(out, "        numIters = 0;")?;
            writeln!(out, "    }}")?;
            writeln!(out, "    long numRecords = (numIters + saveModN - 1) / saveModN;")?;
        }
        Ok(())
    }

    fn input_load(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        for k in 0..ctx.inputs.len() {
            writeln!(out, "    const double* in_{k} = input + (size_t){k} * (size_t)inputLen;")?;
            writeln!(
                out,
                "    long cadence_{k} = (long)ceil(1.0 / (MODEL_STEP * (double)samplesPerUnitTime[{k}]));"
            )?;
            writeln!(out, "    if (cadence_{k} < 1) {{")?;
            writeln!(out, "        cadence_{k} = 1;")?;
            writeln!(out, "    }}")?;
            writeln!(out, "    long counter_{k} = 0, cursor_{k} = 0;")?;
        }
        for (k, key) in ctx.input_listeners() {
            writeln!(out, "    {} = in_{k}[0];", slot(key))?;
        }
        Ok(())
    }

    fn output_header(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        if self.measure {
            writeln!(out, "    long measureK = 0;")?;
            writeln!(out, "    long measureBoundary = numIntervals > 0 ? (long)intervalLens[0] : 0;")?;
            writeln!(out, "    double measureSum = 0.0;")?;
            measure_sample(out, "    ", &slot(ctx.measure_field()?), "0")?;
        } else {
            writeln!(
                out,
                "    double* data = out + (size_t)tid * (size_t)NUM_FIELDS * (size_t)numRecords;"
            )?;
        }
        Ok(())
    }

    fn loop_begin(&mut self, _ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        if !self.measure {
            writeln!(out, "    long rec = 0;")?;
        }
        writeln!(out, "    for (long iter = 0; iter < numIters; ++iter) {{")?;
        Ok(())
    }

    fn evaluate_variables(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        for row in &ctx.variables {
            writeln!(out, "        odesim_eval_{}(s);", row.key)?;
            writeln!(out, "        {} = {};", slot(&row.key), slot(&row.temp))?;
        }
        Ok(())
    }

    fn evaluate_state(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        for row in &ctx.states {
            writeln!(out, "        odesim_eval_{}(s);", row.key)?;
        }
        Ok(())
    }

    fn commit(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        for row in ctx.rows() {
            writeln!(out, "        {} = {};", slot(&row.key), slot(&row.temp))?;
        }
        Ok(())
    }

    fn advance_inputs(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        for k in 0..ctx.inputs.len() {
            writeln!(out, "        if (++counter_{k} >= cadence_{k}) {{")?;
            writeln!(out, "            counter_{k} = 0;")?;
            writeln!(out, "            cursor_{k} = (cursor_{k} + 1) % inputLen;")?;
            writeln!(out, "        }}")?;
        }
        for (k, key) in ctx.input_listeners() {
            writeln!(out, "        {} = in_{k}[cursor_{k}];", slot(key))?;
        }
        Ok(())
    }

    fn record(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        if self.measure {
            return measure_sample(out, "        ", &slot(ctx.measure_field()?), "iter + 1");
        }
        writeln!(out, "        if (iter % saveModN == 0) {{")?;
        for (f, field) in ctx.fields.iter().enumerate() {
            writeln!(
                out,
                "            data[(size_t){f} * (size_t)numRecords + (size_t)rec] = {};",
                slot(field)
            )?;
        }
        writeln!(out, "            ++rec;")?;
        writeln!(out, "        }}")?;
        Ok(())
    }

    fn conditions(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        for condition in &ctx.conditions {
            writeln!(out, "        if ({}) {{", render(ctx, &condition.test))?;
            for result in &condition.results {
                writeln!(out, "            {};", render(ctx, result))?;
            }
            writeln!(out, "        }}")?;
        }
        Ok(())
    }

    fn loop_end(&mut self, _ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        writeln!(out, "    }}")?;
        Ok(())
    }

    fn epilogue(&mut self, _ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        if self.measure {
            writeln!(
                out,
                "    out[tid] = numIntervals > 0 ? sqrt(measureSum / (double)numIntervals) : 0.0;"
            )?;
        }
        writeln!(out, "}}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::codegen::tests::{neuron, options};
    use crate::codegen::{emit, Target};
    use crate::model::{Row, TableKind};

    #[test]
    fn kernel_indexes_the_slot_array() {
        let source = emit(&neuron(), &options(), Target::Gpu).expect("emit");
        assert!(source.contains("#define OFF_a 0"));
        assert!(source.contains("extern \"C\" __global__ void simulate("));
        assert!(source.contains("if (tid >= numTests || numPars != 2 + NUM_PARS) {"));
        assert!(source.contains(
            "s[OFF_v_temp_] = s[OFF_v]+MODEL_STEP*(s[OFF_tau]*(s[OFF_u]+s[OFF_a])/s[OFF_b]);"
        ));
        assert!(source.contains("double* data = out + (size_t)tid * (size_t)NUM_FIELDS * (size_t)numRecords;"));
        assert!(source.contains("s[OFF_v] = s[OFF_v_0];"));
        assert!(!source.contains("m_v"));
    }

    #[test]
    fn empty_model_still_declares_a_slot() {
        let source = emit(&crate::model::ModelTables::new(), &options(), Target::Gpu).expect("emit");
        assert!(source.contains("#define NUM_SLOTS 1\n"));
        assert!(source.contains("double s[NUM_SLOTS];"));
    }

    #[test]
    fn measure_kernel_writes_one_value_per_thread() {
        let source = emit(&neuron(), &options(), Target::GpuMeasure).expect("emit");
        assert!(source.contains("const double* target, const int* intervalLens, int numIntervals)"));
        assert!(source.contains("double err = s[OFF_v] - target[measureK];"));
        assert!(source.contains("out[tid] = numIntervals > 0 ? sqrt(measureSum / (double)numIntervals) : 0.0;"));
        assert!(!source.contains("long rec = 0;"));
    }

    #[test]
    fn generated_inputs_are_read_from_the_packed_buffer() {
        let mut tables = neuron();
        tables
            .push_row(TableKind::Variables, Row::new("noise", "normal"))
            .expect("noise");
        let source = emit(&tables, &options(), Target::Gpu).expect("emit");
        assert!(source.contains("const double* in_0 = input + (size_t)0 * (size_t)inputLen;"));
        assert!(source.contains("s[OFF_noise] = in_0[0];"));
        assert!(source.contains("s[OFF_noise] = in_0[cursor_0];"));
    }
}
