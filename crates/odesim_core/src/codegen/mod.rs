//! Ahead-of-time backend: Model Tables to source text.
//!
//! Every target walks the same skeleton, driven by [`emit_with`]:
//!
//! ```text
//! includes, constants, declarations, one function per evaluating row,
//! entry prologue, input load, output header,
//! loop { variables, state, commit, inputs, record, conditions },
//! epilogue
//! ```
//!
//! Targets only implement the leaves through [`Emitter`]. The per-row
//! formulas come from [`crate::formula`] with the step written as
//! `MODEL_STEP`, so the generated code runs the exact arithmetic of the
//! interpreter.

mod c;
pub mod companion;
pub mod gpu;
pub mod host_extension;
pub mod native;
pub mod shared_object;

use crate::engine::{constant_values, EngineConfig, EngineError};
use crate::equation_engine::{parse, Compiler, Expr, ExprError, SymbolTable};
use crate::formula::{
    commit_formula, frozen_formula, temp_name, variable_formula, Scheme, StepRepr, SCRATCH_NAMES,
    STEP_CONSTANT,
};
use crate::model::{InputBinding, ModelError, ModelTables, Range};
use crate::preprocess::rewrite_power;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodegenError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("cannot translate {row} `{text}`: {source}")]
    Expression {
        row: String,
        text: String,
        #[source]
        source: ExprError,
    },
    #[error("cannot evaluate default values: {0}")]
    Defaults(#[from] EngineError),
    #[error("input `{0}` has no sample file; write generated inputs to disk before emitting")]
    MissingInputFile(String),
    #[error("measured field `{0}` is not a Variable or State row")]
    UnknownMeasureField(String),
    #[error("measure targets need at least one recorded field")]
    NothingToMeasure,
    #[error(transparent)]
    Fmt(#[from] fmt::Error),
}

/// Emission backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// Standalone C program writing a trajectory file.
    Native,
    /// C shared library exporting `simulate`.
    SharedObject,
    /// CUDA kernel, one thread per parameter set.
    Gpu,
    /// CUDA kernel computing the interval RMSE per thread.
    GpuMeasure,
    /// MATLAB MEX function returning the trajectory.
    HostExtension,
    /// MATLAB MEX function returning (measure, trajectory).
    HostExtensionMeasure,
    /// MATLAB function file forwarding to the plain extension.
    Companion,
    /// MATLAB function file forwarding to the measure extension.
    CompanionMeasure,
}

impl Target {
    pub const ALL: [Target; 8] = [
        Target::Native,
        Target::SharedObject,
        Target::Gpu,
        Target::GpuMeasure,
        Target::HostExtension,
        Target::HostExtensionMeasure,
        Target::Companion,
        Target::CompanionMeasure,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Target::Native => "native",
            Target::SharedObject => "shared",
            Target::Gpu => "gpu",
            Target::GpuMeasure => "gpu-measure",
            Target::HostExtension => "mex",
            Target::HostExtensionMeasure => "mex-measure",
            Target::Companion => "companion",
            Target::CompanionMeasure => "companion-measure",
        }
    }

    pub fn is_measure(self) -> bool {
        matches!(
            self,
            Target::GpuMeasure | Target::HostExtensionMeasure | Target::CompanionMeasure
        )
    }

    /// Whether generated code reads sample files from disk.
    pub fn reads_input_files(self) -> bool {
        matches!(
            self,
            Target::Native
                | Target::SharedObject
                | Target::HostExtension
                | Target::HostExtensionMeasure
        )
    }

    /// File stem of the source and of the artifact built from it.
    pub fn stem(self, model: &str) -> String {
        match self {
            Target::Native | Target::SharedObject | Target::Gpu => model.to_string(),
            Target::GpuMeasure => format!("{model}_measure"),
            Target::HostExtension => format!("{model}_mex"),
            Target::HostExtensionMeasure => format!("{model}_measure_mex"),
            Target::Companion => model.to_string(),
            Target::CompanionMeasure => format!("{model}_measure"),
        }
    }

    pub fn source_extension(self) -> &'static str {
        match self {
            Target::Native | Target::SharedObject | Target::HostExtension | Target::HostExtensionMeasure => "c",
            Target::Gpu | Target::GpuMeasure => "cu",
            Target::Companion | Target::CompanionMeasure => "m",
        }
    }

    pub fn source_file(self, model: &str) -> String {
        let suffix = match self {
            Target::SharedObject => "_lib",
            _ => "",
        };
        format!("{}{suffix}.{}", self.stem(model), self.source_extension())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Target::ALL
            .into_iter()
            .find(|target| target.name() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = Target::ALL.iter().map(|t| t.name()).collect();
                format!("unknown target `{s}` (expected one of {})", names.join(", "))
            })
    }
}

/// Everything an emission needs besides the tables.
#[derive(Debug, Clone)]
pub struct EmitOptions {
    /// Model name, used for function and file names.
    pub name: String,
    pub scheme: Scheme,
    pub model_step: f64,
    /// Field compared against the target by measure variants; defaults to
    /// the first State row.
    pub measure_field: Option<String>,
    /// Sample file for each input source key. File-bound inputs default to
    /// their own path.
    pub input_files: BTreeMap<String, PathBuf>,
}

impl EmitOptions {
    pub fn new(name: impl Into<String>, config: &EngineConfig) -> Self {
        Self {
            name: name.into(),
            scheme: config.scheme,
            model_step: config.model_step,
            measure_field: None,
            input_files: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    Variable,
    State,
}

/// An evaluating row reduced to its commit formula.
#[derive(Debug, Clone)]
pub struct EmittedRow {
    pub key: String,
    pub temp: String,
    pub kind: RowKind,
    pub formula: Expr,
}

/// A sample stream and the Variables listening to it.
#[derive(Debug, Clone)]
pub struct InputStream {
    pub source: String,
    pub path: Option<PathBuf>,
    pub listeners: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EmittedCondition {
    pub test: Expr,
    pub results: Vec<Expr>,
}

/// One artifact argument: a Parameter or an InitialCondition.
#[derive(Debug, Clone)]
pub struct Argument {
    pub key: String,
    pub default: f64,
    pub range: Option<Range>,
}

/// The tables digested once per emission.
#[derive(Debug, Clone)]
pub struct EmitContext {
    pub name: String,
    pub scheme: Scheme,
    pub model_step: f64,
    /// Parameters then InitialConditions, in table order.
    pub arguments: Vec<Argument>,
    /// State key and paired InitialCondition key.
    pub state_initials: Vec<(String, String)>,
    /// Expression-driven and frozen Variables, in declaration order.
    pub variables: Vec<EmittedRow>,
    pub states: Vec<EmittedRow>,
    pub inputs: Vec<InputStream>,
    pub conditions: Vec<EmittedCondition>,
    /// Recorded field names: Variables then State.
    pub fields: Vec<String>,
    /// Every model name that receives storage, in slot order.
    pub slots: Vec<String>,
    pub measure_index: Option<usize>,
}

impl EmitContext {
    pub fn new(tables: &ModelTables, options: &EmitOptions) -> Result<Self, CodegenError> {
        tables.validate()?;
        let defaults = constant_values(tables)?;
        let arguments = tables
            .parameters
            .iter()
            .chain(&tables.initial_conditions)
            .zip(defaults)
            .map(|(row, default)| Argument {
                key: row.key.clone(),
                default,
                range: row.range,
            })
            .collect();

        let mut slots: Vec<String> = tables.keys().map(str::to_string).collect();
        slots.extend(tables.variables.iter().chain(&tables.state).map(|row| temp_name(&row.key)));
        slots.extend(SCRATCH_NAMES.iter().map(|name| name.to_string()));
        let mut symbols = SymbolTable::new();
        for name in &slots {
            symbols.insert(name);
        }
        symbols.insert(STEP_CONSTANT);
        let check = |row: &str, text: String| -> Result<Expr, CodegenError> {
            let expr = parse(&text).map_err(|source| expression_error(row, &text, source))?;
            Compiler::new(&symbols)
                .compile(&expr)
                .map_err(|source| expression_error(row, &text, source))?;
            Ok(expr)
        };

        let mut variables = Vec::new();
        let mut inputs: Vec<InputStream> = Vec::new();
        for row in &tables.variables {
            let label = format!("variable `{}`", row.key);
            let text = if row.freeze {
                frozen_formula(&row.key, "0")
            } else if let Some(binding) = row.input_binding() {
                let (source, path) = match binding {
                    InputBinding::Generator(kind) => (kind.token().to_string(), None),
                    InputBinding::File(path) => (format!("file:{}", path.display()), Some(path)),
                };
                match inputs.iter_mut().find(|input| input.source == source) {
                    Some(input) => input.listeners.push(row.key.clone()),
                    None => {
                        let path = options.input_files.get(&source).cloned().or(path);
                        inputs.push(InputStream {
                            source,
                            path,
                            listeners: vec![row.key.clone()],
                        });
                    }
                }
                continue;
            } else {
                variable_formula(&row.key, &row.expression)
                    .map_err(|source| expression_error(&label, &row.expression, source))?
            };
            variables.push(EmittedRow {
                key: row.key.clone(),
                temp: temp_name(&row.key),
                kind: RowKind::Variable,
                formula: check(&label, text)?,
            });
        }

        let mut states = Vec::new();
        let mut state_initials = Vec::new();
        for (row, initial) in tables.state.iter().zip(&tables.initial_conditions) {
            let label = format!("state `{}`", row.key);
            let text = if row.freeze {
                frozen_formula(&row.key, &initial.key)
            } else {
                commit_formula(&row.key, &row.expression, &StepRepr::generated(), options.scheme)
                    .map_err(|source| expression_error(&label, &row.expression, source))?
            };
            states.push(EmittedRow {
                key: row.key.clone(),
                temp: temp_name(&row.key),
                kind: RowKind::State,
                formula: check(&label, text)?,
            });
            state_initials.push((row.key.clone(), initial.key.clone()));
        }

        let mut conditions = Vec::new();
        for (index, condition) in tables.conditions.iter().enumerate() {
            let label = format!("condition #{index}");
            let test = check(&label, rewrite_power(&condition.test))?;
            let results = condition
                .results
                .iter()
                .map(|result| check(&label, rewrite_power(result)))
                .collect::<Result<Vec<_>, _>>()?;
            conditions.push(EmittedCondition { test, results });
        }

        let fields = tables.field_names();
        let measure_index = match &options.measure_field {
            Some(field) => Some(
                fields
                    .iter()
                    .position(|name| name == field)
                    .ok_or_else(|| CodegenError::UnknownMeasureField(field.clone()))?,
            ),
            None if !tables.state.is_empty() => Some(tables.variables.len()),
            None if !fields.is_empty() => Some(0),
            None => None,
        };

        Ok(Self {
            name: options.name.clone(),
            scheme: options.scheme,
            model_step: options.model_step,
            arguments,
            state_initials,
            variables,
            states,
            inputs,
            conditions,
            fields,
            slots,
            measure_index,
        })
    }

    /// Every evaluating row, Variables first.
    pub fn rows(&self) -> impl Iterator<Item = &EmittedRow> {
        self.variables.iter().chain(&self.states)
    }

    pub fn has_slot(&self, name: &str) -> bool {
        self.slots.iter().any(|slot| slot == name)
    }

    pub fn measure_field(&self) -> Result<&str, CodegenError> {
        self.measure_index
            .map(|index| self.fields[index].as_str())
            .ok_or(CodegenError::NothingToMeasure)
    }

    /// Variables fed by input streams.
    pub fn input_listeners(&self) -> impl Iterator<Item = (usize, &str)> {
        self.inputs
            .iter()
            .enumerate()
            .flat_map(|(index, input)| input.listeners.iter().map(move |key| (index, key.as_str())))
    }

    /// Path of every input stream; generated inputs need a materialised file.
    pub fn input_paths(&self) -> Result<Vec<&PathBuf>, CodegenError> {
        self.inputs
            .iter()
            .map(|input| {
                input
                    .path
                    .as_ref()
                    .ok_or_else(|| CodegenError::MissingInputFile(input.source.clone()))
            })
            .collect()
    }
}

fn expression_error(row: &str, text: &str, source: ExprError) -> CodegenError {
    CodegenError::Expression {
        row: row.to_string(),
        text: text.to_string(),
        source,
    }
}

/// The leaves of the emission skeleton. Every method appends to `out`; the
/// defaults emit nothing.
pub trait Emitter {
    fn includes(&mut self, _ctx: &EmitContext, _out: &mut String) -> Result<(), CodegenError> {
        Ok(())
    }

    fn constants(&mut self, _ctx: &EmitContext, _out: &mut String) -> Result<(), CodegenError> {
        Ok(())
    }

    fn declarations(&mut self, _ctx: &EmitContext, _out: &mut String) -> Result<(), CodegenError> {
        Ok(())
    }

    fn row_function(
        &mut self,
        _ctx: &EmitContext,
        _row: &EmittedRow,
        _out: &mut String,
    ) -> Result<(), CodegenError> {
        Ok(())
    }

    fn entry_prologue(&mut self, _ctx: &EmitContext, _out: &mut String) -> Result<(), CodegenError> {
        Ok(())
    }

    fn input_load(&mut self, _ctx: &EmitContext, _out: &mut String) -> Result<(), CodegenError> {
        Ok(())
    }

    fn output_header(&mut self, _ctx: &EmitContext, _out: &mut String) -> Result<(), CodegenError> {
        Ok(())
    }

    fn loop_begin(&mut self, _ctx: &EmitContext, _out: &mut String) -> Result<(), CodegenError> {
        Ok(())
    }

    fn evaluate_variables(&mut self, _ctx: &EmitContext, _out: &mut String) -> Result<(), CodegenError> {
        Ok(())
    }

    fn evaluate_state(&mut self, _ctx: &EmitContext, _out: &mut String) -> Result<(), CodegenError> {
        Ok(())
    }

    fn commit(&mut self, _ctx: &EmitContext, _out: &mut String) -> Result<(), CodegenError> {
        Ok(())
    }

    fn advance_inputs(&mut self, _ctx: &EmitContext, _out: &mut String) -> Result<(), CodegenError> {
        Ok(())
    }

    fn record(&mut self, _ctx: &EmitContext, _out: &mut String) -> Result<(), CodegenError> {
        Ok(())
    }

    fn conditions(&mut self, _ctx: &EmitContext, _out: &mut String) -> Result<(), CodegenError> {
        Ok(())
    }

    fn loop_end(&mut self, _ctx: &EmitContext, _out: &mut String) -> Result<(), CodegenError> {
        Ok(())
    }

    fn epilogue(&mut self, _ctx: &EmitContext, _out: &mut String) -> Result<(), CodegenError> {
        Ok(())
    }
}

/// Walks the skeleton in its fixed order.
pub fn emit_with(ctx: &EmitContext, emitter: &mut dyn Emitter) -> Result<String, CodegenError> {
    let mut out = String::new();
    emitter.includes(ctx, &mut out)?;
    emitter.constants(ctx, &mut out)?;
    emitter.declarations(ctx, &mut out)?;
    for row in ctx.rows() {
        emitter.row_function(ctx, row, &mut out)?;
    }
    emitter.entry_prologue(ctx, &mut out)?;
    emitter.input_load(ctx, &mut out)?;
    emitter.output_header(ctx, &mut out)?;
    emitter.loop_begin(ctx, &mut out)?;
    emitter.evaluate_variables(ctx, &mut out)?;
    emitter.evaluate_state(ctx, &mut out)?;
    emitter.commit(ctx, &mut out)?;
    emitter.advance_inputs(ctx, &mut out)?;
    emitter.record(ctx, &mut out)?;
    emitter.conditions(ctx, &mut out)?;
    emitter.loop_end(ctx, &mut out)?;
    emitter.epilogue(ctx, &mut out)?;
    Ok(out)
}

/// Emits the source of `target` for `tables`.
pub fn emit(tables: &ModelTables, options: &EmitOptions, target: Target) -> Result<String, CodegenError> {
    let ctx = EmitContext::new(tables, options)?;
    if target.reads_input_files() {
        ctx.input_paths()?;
    }
    if target.is_measure() {
        ctx.measure_field()?;
    }
    let mut emitter: Box<dyn Emitter> = match target {
        Target::Native => Box::new(native::NativeEmitter),
        Target::SharedObject => Box::new(shared_object::SharedObjectEmitter),
        Target::Gpu => Box::new(gpu::GpuEmitter { measure: false }),
        Target::GpuMeasure => Box::new(gpu::GpuEmitter { measure: true }),
        Target::HostExtension => Box::new(host_extension::HostExtensionEmitter { measure: false }),
        Target::HostExtensionMeasure => Box::new(host_extension::HostExtensionEmitter { measure: true }),
        Target::Companion => Box::new(companion::CompanionEmitter { measure: false }),
        Target::CompanionMeasure => Box::new(companion::CompanionEmitter { measure: true }),
    };
    tracing::debug!(%target, model = %options.name, "emitting source");
    emit_with(&ctx, emitter.as_mut())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Condition, Row, TableKind};

    pub(crate) fn neuron() -> ModelTables {
        let mut tables = ModelTables::new();
        for (key, value) in [("a", "4"), ("b", "10"), ("tau", "0.1")] {
            tables
                .push_row(TableKind::Parameters, Row::new(key, value).with_range(0.0, 20.0))
                .expect("parameter");
        }
        tables
            .push_row(TableKind::Variables, Row::new("drive", "u^2"))
            .expect("variable");
        tables.push_state("v", "tau*(u+a)/b", "1").expect("v");
        tables.push_state("u", "tau*(b-v)", "0").expect("u");
        tables.push_condition(Condition::new("v > 30", &["v = -65", "u = u + 8"]));
        tables
    }

    pub(crate) fn options() -> EmitOptions {
        EmitOptions {
            name: "neuron".to_string(),
            scheme: Scheme::Euler,
            model_step: 0.1,
            measure_field: None,
            input_files: BTreeMap::new(),
        }
    }

    /// Records every leaf call, to pin the skeleton order.
    #[derive(Default)]
    struct Trace(Vec<String>);

    impl Emitter for Trace {
        fn includes(&mut self, _: &EmitContext, _: &mut String) -> Result<(), CodegenError> {
            self.0.push("includes".into());
            Ok(())
        }
        fn row_function(&mut self, _: &EmitContext, row: &EmittedRow, _: &mut String) -> Result<(), CodegenError> {
            self.0.push(format!("row {}", row.key));
            Ok(())
        }
        fn entry_prologue(&mut self, _: &EmitContext, _: &mut String) -> Result<(), CodegenError> {
            self.0.push("prologue".into());
            Ok(())
        }
        fn evaluate_variables(&mut self, _: &EmitContext, _: &mut String) -> Result<(), CodegenError> {
            self.0.push("variables".into());
            Ok(())
        }
        fn commit(&mut self, _: &EmitContext, _: &mut String) -> Result<(), CodegenError> {
            self.0.push("commit".into());
            Ok(())
        }
        fn record(&mut self, _: &EmitContext, _: &mut String) -> Result<(), CodegenError> {
            self.0.push("record".into());
            Ok(())
        }
        fn conditions(&mut self, _: &EmitContext, _: &mut String) -> Result<(), CodegenError> {
            self.0.push("conditions".into());
            Ok(())
        }
        fn epilogue(&mut self, _: &EmitContext, _: &mut String) -> Result<(), CodegenError> {
            self.0.push("epilogue".into());
            Ok(())
        }
    }

    #[test]
    fn skeleton_order_is_fixed() {
        let ctx = EmitContext::new(&neuron(), &options()).expect("context");
        let mut trace = Trace::default();
        emit_with(&ctx, &mut trace).expect("emit");
        assert_eq!(
            trace.0,
            vec![
                "includes", "row drive", "row v", "row u", "prologue", "variables", "commit",
                "record", "conditions", "epilogue"
            ]
        );
    }

    #[test]
    fn context_digests_the_tables() {
        let ctx = EmitContext::new(&neuron(), &options()).expect("context");
        let args: Vec<(&str, f64)> = ctx.arguments.iter().map(|a| (a.key.as_str(), a.default)).collect();
        assert_eq!(args, vec![("a", 4.0), ("b", 10.0), ("tau", 0.1), ("v_0", 1.0), ("u_0", 0.0)]);
        assert_eq!(ctx.fields, vec!["drive", "v", "u"]);
        assert_eq!(ctx.measure_field().expect("measure"), "v");
        assert_eq!(
            ctx.states[0].formula.render(),
            "v_temp_ = v+MODEL_STEP*(tau*(u+a)/b)"
        );
        assert_eq!(ctx.variables[0].formula.render(), "drive_temp_ = pow(u,2.0)");
    }

    #[test]
    fn generated_inputs_need_a_file_for_cpu_targets() {
        let mut tables = neuron();
        tables
            .push_row(TableKind::Variables, Row::new("noise", "normal"))
            .expect("input");
        tables
            .push_row(TableKind::Variables, Row::new("noise2", "normal"))
            .expect("input");
        let err = emit(&tables, &options(), Target::Native).expect_err("no sample file");
        assert!(matches!(err, CodegenError::MissingInputFile(ref source) if source == "normal"));

        // The kernel takes its samples as an argument.
        emit(&tables, &options(), Target::Gpu).expect("gpu needs no files");

        let mut options = options();
        options.input_files.insert("normal".into(), PathBuf::from("/tmp/normal.bin"));
        let ctx = EmitContext::new(&tables, &options).expect("context");
        assert_eq!(ctx.inputs.len(), 1);
        assert_eq!(ctx.inputs[0].listeners, vec!["noise", "noise2"]);
        emit(&tables, &options, Target::Native).expect("native");
    }

    #[test]
    fn unknown_names_and_measure_fields_are_reported() {
        let mut tables = neuron();
        tables.set_expression(TableKind::State, 1, "tau*(b-w)").expect("edit");
        let err = emit(&tables, &options(), Target::Native).expect_err("unknown w");
        assert!(matches!(err, CodegenError::Expression { ref row, .. } if row == "state `u`"));

        let mut options = options();
        options.measure_field = Some("nope".into());
        assert!(matches!(
            emit(&neuron(), &options, Target::GpuMeasure),
            Err(CodegenError::UnknownMeasureField(_))
        ));
    }

    #[test]
    fn target_names_round_trip() {
        for target in Target::ALL {
            assert_eq!(target.name().parse::<Target>(), Ok(target));
        }
        assert!("fortran".parse::<Target>().is_err());
        assert_eq!(Target::SharedObject.source_file("m"), "m_lib.c");
        assert_eq!(Target::HostExtensionMeasure.source_file("m"), "m_measure_mex.c");
        assert_eq!(Target::CompanionMeasure.source_file("m"), "m_measure.m");
    }
}
