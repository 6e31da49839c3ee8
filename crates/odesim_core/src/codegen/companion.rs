//! MATLAB companion function.
//!
//! A plain `.m` file that carries the argument names, defaults and bounds
//! and forwards to the compiled extension, so callers never pack `pars` by
//! hand. Called with no arguments it returns that description.

use super::{CodegenError, EmitContext, Emitter, Target};
use std::fmt::Write as _;

pub struct CompanionEmitter {
    pub measure: bool,
}

impl CompanionEmitter {
    fn function_name(&self, ctx: &EmitContext) -> String {
        let target = if self.measure { Target::CompanionMeasure } else { Target::Companion };
        target.stem(&ctx.name)
    }

    fn extension_name(&self, ctx: &EmitContext) -> String {
        let target = if self.measure {
            Target::HostExtensionMeasure
        } else {
            Target::HostExtension
        };
        target.stem(&ctx.name)
    }
}

fn matlab_number(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "Inf" } else { "-Inf" }.to_string()
    } else {
        format!("{value:?}")
    }
}

fn matlab_string(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn row_vector(values: impl Iterator<Item = String>) -> String {
    format!("[{}]", values.collect::<Vec<_>>().join(", "))
}

fn cell_vector<'a>(names: impl Iterator<Item = &'a str>) -> String {
    format!("{{{}}}", names.map(matlab_string).collect::<Vec<_>>().join(", "))
}

impl Emitter for CompanionEmitter {
    fn includes(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        let name = self.function_name(ctx);
        writeln!(out, "function varargout = {name}(varargin)")?;
        writeln!(
            out,
            "% {}  Model `{}`, {} scheme, step {}. Generated by odesim.",
            name.to_uppercase(),
            ctx.name,
            ctx.scheme,
            matlab_number(ctx.model_step)
        )?;
        writeln!(out, "%   info = {name}() describes the arguments and recorded fields.")?;
        if self.measure {
            writeln!(
                out,
                "%   [rmse, data] = {name}(intervalLens, target) compares `{}` against target",
                ctx.measure_field()?
            )?;
            writeln!(out, "%   at the end of every interval, using the default arguments.")?;
            writeln!(out, "%   {name}(intervalLens, target, pars, saveModN) overrides them.")?;
        } else {
            writeln!(out, "%   data = {name}(duration, saveModN) runs with the default arguments.")?;
            writeln!(out, "%   data = {name}(duration, saveModN, pars) overrides them.")?;
        }
        writeln!(out, "%   Requires the compiled extension {}.", self.extension_name(ctx))?;
        writeln!(out)?;
        Ok(())
    }

    fn constants(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        writeln!(out, "info.name = {};", matlab_string(&ctx.name))?;
        writeln!(out, "info.scheme = {};", matlab_string(&ctx.scheme.to_string()))?;
        writeln!(out, "info.modelStep = {};", matlab_number(ctx.model_step))?;
        writeln!(
            out,
            "info.parNames = {};",
            cell_vector(ctx.arguments.iter().map(|a| a.key.as_str()))
        )?;
        writeln!(
            out,
            "info.defaults = {};",
            row_vector(ctx.arguments.iter().map(|a| matlab_number(a.default)))
        )?;
        writeln!(
            out,
            "info.lb = {};",
            row_vector(
                ctx.arguments
                    .iter()
                    .map(|a| matlab_number(a.range.map_or(f64::NEG_INFINITY, |r| r.min)))
            )
        )?;
        writeln!(
            out,
            "info.ub = {};",
            row_vector(
                ctx.arguments
                    .iter()
                    .map(|a| matlab_number(a.range.map_or(f64::INFINITY, |r| r.max)))
            )
        )?;
        writeln!(out, "info.fields = {};", cell_vector(ctx.fields.iter().map(String::as_str)))?;
        if self.measure {
            writeln!(out, "info.measureField = {};", matlab_string(ctx.measure_field()?))?;
        }
        writeln!(out)?;
        Ok(())
    }

    fn entry_prologue(&mut self, _ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        writeln!(out, "if nargin == 0")?;
        writeln!(out, "    varargout{{1}} = info;")?;
        writeln!(out, "    return;")?;
        writeln!(out, "end")?;
        let (required, optional) = if self.measure { (2, 4) } else { (2, 3) };
        writeln!(out, "if nargin < {required} || nargin > {optional}")?;
        writeln!(
            out,
            "    error('odesim:nargin', 'expected {required} to {optional} arguments, got %d', nargin);"
        )?;
        writeln!(out, "end")?;
        writeln!(out, "pars = info.defaults;")?;
        writeln!(out, "if nargin >= 3 && ~isempty(varargin{{3}})")?;
        writeln!(out, "    pars = reshape(double(varargin{{3}}), 1, []);")?;
        writeln!(out, "end")?;
        writeln!(out, "if numel(pars) ~= numel(info.defaults)")?;
        writeln!(
            out,
            "    error('odesim:pars', 'expected %d parameters and initial conditions', numel(info.defaults));"
        )?;
        writeln!(out, "end")?;
        Ok(())
    }

    fn epilogue(&mut self, ctx: &EmitContext, out: &mut String) -> Result<(), CodegenError> {
        let extension = self.extension_name(ctx);
        if self.measure {
            writeln!(out, "saveModN = 1;")?;
            writeln!(out, "if nargin >= 4")?;
            writeln!(out, "    saveModN = double(varargin{{4}});")?;
            writeln!(out, "end")?;
            writeln!(out, "intervalLens = double(varargin{{1}});")?;
            writeln!(out, "target = double(varargin{{2}});")?;
            writeln!(
                out,
                "[varargout{{1}}, varargout{{2}}] = {extension}([0, saveModN, pars], intervalLens, target);"
            )?;
        } else {
            writeln!(out, "duration = double(varargin{{1}});")?;
            writeln!(out, "saveModN = double(varargin{{2}});")?;
            writeln!(out, "args = num2cell(pars);")?;
            writeln!(out, "varargout{{1}} = {extension}(duration, saveModN, args{{:}});")?;
            writeln!(out, "varargout{{2}} = info.fields;")?;
        }
        writeln!(out, "end")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::tests::{neuron, options};
    use crate::codegen::emit;

    #[test]
    fn describes_arguments_and_forwards_to_the_extension() {
        let source = emit(&neuron(), &options(), Target::Companion).expect("emit");
        assert!(source.starts_with("function varargout = neuron(varargin)"));
        assert!(source.contains("info.parNames = {'a', 'b', 'tau', 'v_0', 'u_0'};"));
        assert!(source.contains("info.defaults = [4.0, 10.0, 0.1, 1.0, 0.0];"));
        assert!(source.contains("info.lb = [0.0, 0.0, 0.0, -Inf, -Inf];"));
        assert!(source.contains("info.ub = [20.0, 20.0, 20.0, Inf, Inf];"));
        assert!(source.contains("info.fields = {'drive', 'v', 'u'};"));
        assert!(source.contains("varargout{1} = neuron_mex(duration, saveModN, args{:});"));
        assert!(source.trim_end().ends_with("end"));
    }

    #[test]
    fn measure_companion_calls_the_measure_extension() {
        let source = emit(&neuron(), &options(), Target::CompanionMeasure).expect("emit");
        assert!(source.starts_with("function varargout = neuron_measure(varargin)"));
        assert!(source.contains("info.measureField = 'v';"));
        assert!(source.contains("neuron_measure_mex([0, saveModN, pars], intervalLens, target);"));
    }

    #[test]
    fn quotes_are_doubled() {
        assert_eq!(matlab_string("it's"), "'it''s'");
        assert_eq!(matlab_number(f64::NEG_INFINITY), "-Inf");
    }
}
