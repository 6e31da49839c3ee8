//! C shared library.
//!
//! Exports `int simulate(size_t numPars, const double* pars, double* data)`
//! where `pars` is `[duration, saveModN, parameters..., initial conditions...]`
//! and `data` holds `NUM_FIELDS * numRecords` doubles, column-major. The
//! library keeps its state in file-scope globals and is not reentrant.

use super::c;
use super::{CodegenError, EmitContext, Emitter};
use std::fmt::Write as _;

pub struct SharedObjectEmitter;

impl Emitter for SharedObjectEmitter {
    fn includes(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        c::banner(ctx, out, "Shared library")?;
        c::includes(out)?;
        writeln!(out, "#if defined(_WIN32)")?;
        writeln!(out, "#define ODESIM_EXPORT __declspec(dllexport)")?;
        writeln!(out, "#else")?;
        writeln!(out, "#define ODESIM_EXPORT __attribute__((visibility(\"default\")))")?;
        writeln!(out, "#endif")?;
        writeln!(out)?;
        Ok(())
    }

    fn constants(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        c::constants(ctx, out)
    }

    c::cpu_leaves!();

    fn entry_prologue(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        writeln!(out, "ODESIM_EXPORT int simulate(size_t numPars, const double* pars, double* data)")?;
        writeln!(out, "{{")?;
        writeln!(out, "    if (numPars != 2 + NUM_PARS || !pars || !data) {{")?;
        writeln!(out, "        return -1;")?;
        writeln!(out, "    }}")?;
        writeln!(out, "    double duration = pars[0];")?;
        writeln!(out, "    long saveModN = (long)pars[1];")?;
        c::assign_arguments(ctx, out, |i| format!("pars[{}]", 2 + i))?;
        c::iteration_count(out)
    }

    fn input_load(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        c::input_load(ctx, out, "return -1;")
    }

    fn record(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        c::record(ctx, out)
    }

    fn epilogue(&mut self, _ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        writeln!(out, "    odesim_free_inputs();")?;
        writeln!(out, "    return 0;")?;
        writeln!(out, "}}")?;
        writeln!(out)?;
        writeln!(out, "ODESIM_EXPORT long num_records(double duration, long saveModN)")?;
        writeln!(out, "{{")?;
        c::iteration_count(out)?;
        writeln!(out, "    return numRecords;")?;
        writeln!(out, "}}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::codegen::tests::{neuron, options};
    use crate::codegen::{emit, Target};

    #[test]
    fn arguments_come_from_the_packed_array() {
        let source = emit(&neuron(), &options(), Target::SharedObject).expect("emit");
        assert!(source.contains("ODESIM_EXPORT int simulate(size_t numPars, const double* pars, double* data)"));
        assert!(source.contains("if (numPars != 2 + NUM_PARS"));
        assert!(source.contains("m_a = pars[2];"));
        assert!(source.contains("m_u_0 = pars[6];"));
        assert!(source.contains("#define NUM_PARS 5"));
        assert!(source.contains("ODESIM_EXPORT long num_records(double duration, long saveModN)"));
        assert!(!source.contains("int main("));
    }
}
