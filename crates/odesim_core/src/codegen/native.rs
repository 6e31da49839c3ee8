//! Standalone C program.
//!
//! `model duration saveModN output [parameters... initial conditions...]`
//! runs the model and writes the trajectory file. Without the trailing
//! values the defaults baked in at generation time are used.

use super::c::{self, c_string};
use super::{CodegenError, EmitContext, Emitter};
use crate::equation_engine::format_number;
use std::fmt::Write as _;

pub struct NativeEmitter;

impl Emitter for NativeEmitter {
    fn includes(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        c::banner(ctx, out, "Native executable")?;
        c::includes(out)
    }

    fn constants(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        c::constants(ctx, out)?;
        writeln!(out, "static int odesim_write_i32(FILE* f, int32_t value)")?;
        writeln!(out, "{{")?;
        writeln!(out, "    return fwrite(&value, sizeof(int32_t), 1, f) == 1 ? 0 : -1;")?;
        writeln!(out, "}}")?;
        writeln!(out)?;
        writeln!(out, "static int odesim_write_name(FILE* f, const char* name, int32_t len)")?;
        writeln!(out, "{{")?;
        writeln!(
            out,
            "    return odesim_write_i32(f, len) == 0 && fwrite(name, 1, (size_t)len, f) == (size_t)len ? 0 : -1;"
        )?;
        writeln!(out, "}}")?;
        writeln!(out)?;
        Ok(())
    }

    c::cpu_leaves!();

    fn entry_prologue(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        writeln!(out, "int main(int argc, char** argv)")?;
        writeln!(out, "{{")?;
        writeln!(out, "    if (argc != 4 && argc != 4 + NUM_PARS) {{")?;
        let names: Vec<&str> = ctx.arguments.iter().map(|a| a.key.as_str()).collect();
        writeln!(
            out,
            "        fprintf(stderr, \"usage: %s duration saveModN output [{}]\\n\", argv[0]);",
            names.join(" ")
        )?;
        writeln!(out, "        return 1;")?;
        writeln!(out, "    }}")?;
        writeln!(out, "    double duration = atof(argv[1]);")?;
        writeln!(out, "    long saveModN = atol(argv[2]);")?;
        writeln!(out, "    const char* outPath = argv[3];")?;
        c::assign_arguments(ctx, out, |i| {
            format!(
                "argc > 4 ? atof(argv[{}]) : {}",
                4 + i,
                format_number(ctx.arguments[i].default)
            )
        })?;
        c::iteration_count(out)
    }

    fn input_load(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        c::input_load(
            ctx,
            out,
            "fprintf(stderr, \"odesim: cannot read input samples\\n\");\n        return 1;",
        )
    }

    fn output_header(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        writeln!(out, "    FILE* out = fopen(outPath, \"wb\");")?;
        writeln!(out, "    if (!out) {{")?;
        writeln!(out, "        fprintf(stderr, \"odesim: cannot open %s\\n\", outPath);")?;
        writeln!(out, "        odesim_free_inputs();")?;
        writeln!(out, "        return 1;")?;
        writeln!(out, "    }}")?;
        let mut checks = vec!["odesim_write_i32(out, 1)".to_string(), "odesim_write_i32(out, NUM_FIELDS)".to_string()];
        for field in &ctx.fields {
            checks.push(format!("odesim_write_name(out, {}, {})", c_string(field), field.len()));
        }
        checks.push("odesim_write_i32(out, (int32_t)saveModN)".to_string());
        checks.push("odesim_write_i32(out, (int32_t)numRecords)".to_string());
        writeln!(out, "    int failed = 0;")?;
        for check in checks {
            writeln!(out, "    failed |= {check};")?;
        }
        writeln!(
            out,
            "    double* data = (double*)calloc((size_t)NUM_FIELDS * (size_t)numRecords + 1, sizeof(double));"
        )?;
        writeln!(out, "    if (failed || !data) {{")?;
        writeln!(out, "        fprintf(stderr, \"odesim: cannot write %s\\n\", outPath);")?;
        writeln!(out, "        fclose(out);")?;
        writeln!(out, "        free(data);")?;
        writeln!(out, "        odesim_free_inputs();")?;
        writeln!(out, "        return 1;")?;
        writeln!(out, "    }}")?;
        Ok(())
    }

    fn record(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        c::record(ctx, out)
    }

    fn epilogue(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        writeln!(out, "    size_t count = (size_t)NUM_FIELDS * (size_t)numRecords;")?;
        writeln!(out, "    int status = fwrite(data, sizeof(double), count, out) == count ? 0 : 1;")?;
        writeln!(out, "    status |= fclose(out) == 0 ? 0 : 1;")?;
        writeln!(out, "    free(data);")?;
        writeln!(out, "    odesim_free_inputs();")?;
        writeln!(
            out,
            "    fprintf(stderr, \"odesim: {}: %ld iterations, %ld records written to %s\\n\", numIters, numRecords, outPath);",
            ctx.name
        )?;
        writeln!(out, "    return status;")?;
        writeln!(out, "}}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::codegen::tests::{neuron, options};
    use crate::codegen::{emit, Target};

    #[test]
    fn emits_a_complete_program() {
        let source = emit(&neuron(), &options(), Target::Native).expect("emit");
        assert!(source.contains("#define MODEL_STEP 0.1"));
        assert!(source.contains("int main(int argc, char** argv)"));
        assert!(source.contains("m_a = argc > 4 ? atof(argv[4]) : 4.0;"));
        assert!(source.contains("m_u_0 = argc > 4 ? atof(argv[8]) : 0.0;"));
        assert!(source.contains("m_v = m_v_0;"));
        assert!(source.contains("odesim_write_name(out, \"drive\", 5)"));

        // Variables publish, State commits, then the record, then Conditions.
        let publish = source.find("m_drive = m_drive_temp_;").expect("publish");
        let eval_v = source.find("        odesim_eval_v();").expect("eval v");
        let commit = source.find("        m_v = m_v_temp_;").expect("commit");
        let record = source.find("if (iter % saveModN == 0)").expect("record");
        let condition = source.find("if (m_v>30.0)").expect("condition");
        assert!(publish < eval_v && eval_v < commit && commit < record && record < condition);
        assert!(source.trim_end().ends_with('}'));
    }
}
