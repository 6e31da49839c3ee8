//! MATLAB MEX host extension.
//!
//! `data = <model>_mex(duration, saveModN, parameters..., initial
//! conditions...)` takes one scalar per argument and returns the
//! `numRecords x NUM_FIELDS` trajectory. The measure variant,
//! `[rmse, data] = <model>_measure_mex(pars, intervalLens, target)`, runs
//! `sum(intervalLens)` iterations and ignores the duration in `pars`.

use super::c::{self, var};
use super::{CodegenError, EmitContext, Emitter};
use std::fmt::Write as _;

pub struct HostExtensionEmitter {
    pub measure: bool,
}

impl HostExtensionEmitter {
    fn error(id: &str, message: &str) -> String {
        format!("mexErrMsgIdAndTxt(\"odesim:{id}\", \"{message}\");")
    }

    /// Unpacks `(pars, intervalLens, target)`; the run length is the sum of
    /// the interval lengths.
    fn measure_prologue(&self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        writeln!(out, "    if (nrhs != 3) {{")?;
        writeln!(out, "        {}", Self::error("nrhs", "expected pars, intervalLens and target"))?;
        writeln!(out, "    }}")?;
        writeln!(
            out,
            "    if (!mxIsDouble(prhs[0]) || mxGetNumberOfElements(prhs[0]) != 2 + NUM_PARS) {{"
        )?;
        writeln!(
            out,
            "        {}",
            Self::error("pars", "pars must hold duration, saveModN and every parameter and initial condition")
        )?;
        writeln!(out, "    }}")?;
        writeln!(out, "    if (!mxIsDouble(prhs[1]) || !mxIsDouble(prhs[2])) {{")?;
        writeln!(out, "        {}", Self::error("measure", "intervalLens and target must be double arrays"))?;
        writeln!(out, "    }}")?;
        writeln!(out, "    const double* pars = mxGetPr(prhs[0]);")?;
        writeln!(out, "    long saveModN = (long)pars[1];")?;
        c::assign_arguments(ctx, out, |i| format!("pars[{}]", 2 + i))?;
        writeln!(out, "    const double* intervalLens = mxGetPr(prhs[1]);")?;
        writeln!(out, "    long numIntervals = (long)mxGetNumberOfElements(prhs[1]);")?;
        writeln!(out, "    const double* target = mxGetPr(prhs[2]);")?;
        writeln!(out, "    if ((long)mxGetNumberOfElements(prhs[2]) < numIntervals) {{")?;
        writeln!(out, "        {}", Self::error("measure", "target is shorter than intervalLens"))?;
        writeln!(out, "    }}")?;
        writeln!(out, "    if (saveModN < 1) {{")?;
        writeln!(out, "        saveModN = 1;")?;
        writeln!(out, "    }}")?;
        writeln!(out, "    long numIters = 0;")?;
        writeln!(out, "    for (long k = 0; k < numIntervals; ++k) {{")?;
        writeln!(out, "        if (intervalLens[k] < 0.0) {{")?;
        writeln!(out, "            {}", Self::error("measure", "interval lengths must be non-negative"))?;
        writeln!(out, "        }}")?;
        writeln!(out, "        numIters += (long)intervalLens[k];")?;
        writeln!(out, "    }}")?;
        writeln!(out, "    long numRecords = (numIters + saveModN - 1) / saveModN;")?;
        Ok(())
    }
}

impl Emitter for HostExtensionEmitter {
    fn includes(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        let what = if self.measure { "MEX measure function" } else { "MEX function" };
        c::banner(ctx, out, what)?;
        c::includes(out)?;
        writeln!(out, "#include \"mex.h\"")?;
        writeln!(out)?;
        Ok(())
    }

    fn constants(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        c::constants(ctx, out)
    }

    c::cpu_leaves!();

    fn entry_prologue(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        writeln!(
            out,
            "void mexFunction(int nlhs, mxArray* plhs[], int nrhs, const mxArray* prhs[])"
        )?;
        writeln!(out, "{{")?;
        if self.measure {
            self.measure_prologue(ctx, out)
        } else {
            writeln!(out, "    if (nrhs != 2 + NUM_PARS) {{")?;
            writeln!(
                out,
                "        {}",
                Self::error("nrhs", "expected duration, saveModN and every parameter and initial condition")
            )?;
            writeln!(out, "    }}")?;
            writeln!(out, "    double duration = mxGetScalar(prhs[0]);")?;
            writeln!(out, "    long saveModN = (long)mxGetScalar(prhs[1]);")?;
            c::assign_arguments(ctx, out, |i| format!("mxGetScalar(prhs[{}])", 2 + i))?;
            c::iteration_count(out)
        }
    }

    fn input_load(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        c::input_load(ctx, out, &Self::error("input", "cannot read input samples"))
    }

    fn output_header(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        writeln!(
            out,
            "    mxArray* trajectory = mxCreateDoubleMatrix((mwSize)numRecords, NUM_FIELDS, mxREAL);"
        )?;
        writeln!(out, "    double* data = mxGetPr(trajectory);")?;
        if self.measure {
            writeln!(out, "    long measureK = 0;")?;
            writeln!(
                out,
                "    long measureBoundary = numIntervals > 0 ? (long)intervalLens[0] : 0;"
            )?;
            writeln!(out, "    double measureSum = 0.0;")?;
            c::measure_sample(out, "    ", &var(ctx.measure_field()?), "0")?;
        }
        Ok(())
    }

    fn record(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        if self.measure {
            c::measure_sample(out, "        ", &var(ctx.measure_field()?), "iter + 1")?;
        }
        c::record(ctx, out)
    }

    fn epilogue(&mut self, _ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        writeln!(out, "    odesim_free_inputs();")?;
        if self.measure {
            writeln!(
                out,
                "    plhs[0] = mxCreateDoubleScalar(numIntervals > 0 ? sqrt(measureSum / (double)numIntervals) : 0.0);"
            )?;
            writeln!(out, "    if (nlhs > 1) {{")?;
            writeln!(out, "        plhs[1] = trajectory;")?;
            writeln!(out, "    }} else {{")?;
            writeln!(out, "        mxDestroyArray(trajectory);")?;
            writeln!(out, "    }}")?;
        } else {
            writeln!(out, "    plhs[0] = trajectory;")?;
        }
        writeln!(out, "}}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::codegen::tests::{neuron, options};
    use crate::codegen::{emit, Target};

    #[test]
    fn plain_extension_returns_the_trajectory() {
        let source = emit(&neuron(), &options(), Target::HostExtension).expect("emit");
        assert!(source.contains("#include \"mex.h\""));
        assert!(source.contains("if (nrhs != 2 + NUM_PARS) {"));
        assert!(source.contains("double duration = mxGetScalar(prhs[0]);"));
        assert!(source.contains("m_tau = mxGetScalar(prhs[4]);"));
        assert!(source.contains("plhs[0] = trajectory;"));
        assert!(!source.contains("measureSum"));
    }

    #[test]
    fn measure_extension_samples_after_commit_and_before_conditions() {
        let source = emit(&neuron(), &options(), Target::HostExtensionMeasure).expect("emit");
        assert!(source.contains("if (nrhs != 3) {"));
        assert!(!source.contains("double duration"));
        assert!(source.contains("numIters += (long)intervalLens[k];"));
        assert!(source.contains("    while (measureK < numIntervals && measureBoundary == 0) {"));
        // The first State row is measured by default.
        assert!(source.contains("double err = m_v - target[measureK];"));

        let commit = source.find("        m_u = m_u_temp_;").expect("commit");
        let sample = source
            .find("measureBoundary == iter + 1")
            .expect("in-loop sample");
        let condition = source.find("if (m_v>30.0)").expect("condition");
        assert!(commit < sample && sample < condition);
        assert!(source.contains("sqrt(measureSum / (double)numIntervals)"));
    }

    #[test]
    fn measure_field_can_be_chosen() {
        let mut options = options();
        options.measure_field = Some("drive".to_string());
        let source = emit(&neuron(), &options, Target::HostExtensionMeasure).expect("emit");
        assert!(source.contains("double err = m_drive - target[measureK];"));
    }
}
