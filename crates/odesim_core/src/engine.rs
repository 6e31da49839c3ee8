//! The interpreter backend.
//!
//! Every evaluating row owns two slots, its committed value and its
//! `<key>_temp_` shadow. A step computes all temps from the previous committed
//! values, commits them in one pass, advances the input streams and then
//! applies the triggered Conditions. The formulas are the exact text the code
//! generators embed, with the step written as a literal.

use crate::equation_engine::{compile_text, Bytecode, ExprError, SymbolTable, VM};
use crate::formula::{
    commit_formula, frozen_formula, temp_name, variable_formula, Scheme, StepRepr, SCRATCH_NAMES,
};
use crate::inputs::{source_for, InputConfig, InputSet};
use crate::model::{ModelError, ModelTables, SharedModel};
use crate::preprocess::rewrite_power;
use crate::traits::SampleSource;
use crate::trajectory::Trajectory;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("the engine is not bound to a model")]
    Unbound,
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("cannot evaluate {row} `{text}`: {source}")]
    Expression {
        row: String,
        text: String,
        #[source]
        source: ExprError,
    },
    #[error("`{row}` diverged to {value} at iteration {iteration}")]
    Diverged {
        row: String,
        value: f64,
        iteration: u64,
    },
    #[error("cannot bind inputs: {0}")]
    Input(String),
    #[error("model step must be a positive finite number, got {0}")]
    InvalidStep(f64),
    #[error("`{0}` is not a recorded field")]
    UnknownField(String),
    #[error("{intervals} measure intervals but only {targets} target values")]
    MissingTargets { intervals: usize, targets: usize },
}

/// Numeric settings shared by the interpreter and the code generators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub model_step: f64,
    pub scheme: Scheme,
    /// Largest State magnitude tolerated before stepping stops.
    pub divergence_limit: f64,
    pub inputs: InputConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_step: 0.01,
            scheme: Scheme::Euler,
            divergence_limit: 1e12,
            inputs: InputConfig::default(),
        }
    }
}

impl EngineConfig {
    /// `floor(duration / model_step + 0.5)`, the iteration count every
    /// backend derives from a duration.
    pub fn iterations_for(&self, duration: f64) -> u64 {
        let iterations = (duration / self.model_step + 0.5).floor();
        if iterations.is_finite() && iterations > 0.0 {
            iterations as u64
        } else {
            0
        }
    }
}

#[derive(Debug, Clone)]
struct RowProgram {
    code: Bytecode,
    temp: usize,
    value: usize,
}

#[derive(Debug, Clone)]
struct ConditionProgram {
    test: Bytecode,
    results: Vec<Bytecode>,
}

/// Everything derived from one read of the Model Tables.
#[derive(Debug, Clone)]
struct Binding {
    symbols: SymbolTable,
    variables: Vec<RowProgram>,
    states: Vec<RowProgram>,
    commits: Vec<(usize, usize)>,
    conditions: Vec<ConditionProgram>,
    /// Row value slots a Condition may write back into the primary context.
    published: Vec<usize>,
    fields: Vec<usize>,
    field_names: Vec<String>,
    /// (key, value slot, initial-condition slot)
    state_rows: Vec<(String, usize, usize)>,
    inputs: InputSet,
}

#[derive(Debug, Clone)]
pub struct Engine {
    config: EngineConfig,
    binding: Option<Binding>,
    slots: Vec<f64>,
    scratch: Vec<f64>,
    stack: Vec<f64>,
    iteration: u64,
    generation: Option<u64>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            binding: None,
            slots: Vec::new(),
            scratch: Vec::new(),
            stack: Vec::with_capacity(32),
            iteration: 0,
            generation: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Replaces the configuration. Takes effect at the next bind; `sync`
    /// re-binds on its next call.
    pub fn set_config(&mut self, config: EngineConfig) {
        self.config = config;
        self.generation = None;
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn iterations_for(&self, duration: f64) -> u64 {
        self.config.iterations_for(duration)
    }

    /// Compiles the tables from scratch. Parameters and InitialConditions are
    /// evaluated in table order; State starts from its InitialConditions.
    pub fn bind(&mut self, tables: &ModelTables) -> Result<(), EngineError> {
        self.bind_with(tables, &HashMap::new())
    }

    /// Like [`Engine::bind`], but Variables and State rows that survive the
    /// edit keep their committed values.
    pub fn rebind(&mut self, tables: &ModelTables) -> Result<(), EngineError> {
        let carried: HashMap<String, f64> = match &self.binding {
            Some(binding) => binding
                .field_names
                .iter()
                .cloned()
                .zip(binding.fields.iter().map(|&slot| self.slots[slot]))
                .collect(),
            None => HashMap::new(),
        };
        let iteration = self.iteration;
        self.bind_with(tables, &carried)?;
        self.iteration = iteration;
        Ok(())
    }

    /// Re-binds when the shared model changed since the last bind. Returns
    /// whether a re-bind happened.
    pub fn sync(&mut self, model: &SharedModel) -> Result<bool, EngineError> {
        let generation = model.generation();
        if self.generation == Some(generation) && self.binding.is_some() {
            return Ok(false);
        }
        let tables = model.read();
        if self.binding.is_some() {
            self.rebind(&tables)?;
        } else {
            self.bind(&tables)?;
        }
        self.generation = Some(generation);
        Ok(true)
    }

    fn bind_with(
        &mut self,
        tables: &ModelTables,
        carried: &HashMap<String, f64>,
    ) -> Result<(), EngineError> {
        tables.validate()?;
        let step = self.config.model_step;
        if !(step.is_finite() && step > 0.0) {
            return Err(EngineError::InvalidStep(step));
        }

        let Layout {
            symbols,
            parameters: param_slots,
            initial_conditions: ic_slots,
            variables: variable_slots,
            state: state_slots,
            variable_temps,
            state_temps,
        } = Layout::new(tables);
        let mut slots = vec![0.0; symbols.len()];
        evaluate_constants(tables, &symbols, &param_slots, &ic_slots, &mut slots)?;

        let mut listeners: Vec<(usize, Box<dyn SampleSource>)> = Vec::new();
        let mut variables = Vec::new();
        let mut commits = Vec::new();
        for ((row, &value), &temp) in tables.variables.iter().zip(&variable_slots).zip(&variable_temps) {
            let label = format!("variable `{}`", row.key);
            let text = if row.freeze {
                frozen_formula(&row.key, "0")
            } else if let Some(binding) = row.input_binding() {
                listeners.push((value, source_for(&binding, &self.config.inputs)));
                continue;
            } else {
                variable_formula(&row.key, &row.expression)
                    .map_err(|source| expression_error(&label, &row.expression, source))?
            };
            let code = compile_row(&label, &text, &symbols)?;
            variables.push(RowProgram { code, temp, value });
            commits.push((temp, value));
        }

        let mut states = Vec::new();
        let mut state_rows = Vec::new();
        for (index, row) in tables.state.iter().enumerate() {
            let (value, temp, ic) = (state_slots[index], state_temps[index], ic_slots[index]);
            let label = format!("state `{}`", row.key);
            let text = if row.freeze {
                frozen_formula(&row.key, &tables.initial_conditions[index].key)
            } else {
                commit_formula(
                    &row.key,
                    &row.expression,
                    &StepRepr::Literal(step),
                    self.config.scheme,
                )
                .map_err(|source| expression_error(&label, &row.expression, source))?
            };
            let code = compile_row(&label, &text, &symbols)?;
            states.push(RowProgram { code, temp, value });
            commits.push((temp, value));
            state_rows.push((row.key.clone(), value, ic));
            slots[value] = slots[ic];
        }

        let mut conditions = Vec::with_capacity(tables.conditions.len());
        for (index, condition) in tables.conditions.iter().enumerate() {
            let label = format!("condition #{index}");
            let test = compile_row(&label, &rewrite_power(&condition.test), &symbols)?;
            let results = condition
                .results
                .iter()
                .map(|result| compile_row(&label, &rewrite_power(result), &symbols))
                .collect::<Result<Vec<_>, _>>()?;
            conditions.push(ConditionProgram { test, results });
        }

        let inputs = InputSet::bind(listeners, step).map_err(|err| EngineError::Input(format!("{err:#}")))?;

        let mut field_names = Vec::new();
        let mut fields = Vec::new();
        for (row, &slot) in tables
            .variables
            .iter()
            .zip(&variable_slots)
            .chain(tables.state.iter().zip(&state_slots))
        {
            if let Some(&value) = carried.get(&row.key) {
                slots[slot] = value;
            }
            field_names.push(row.key.clone());
            fields.push(slot);
        }
        // Input-bound Variables restart with their rewound stream.
        inputs.publish(&mut slots);

        let published = param_slots
            .iter()
            .chain(&ic_slots)
            .chain(&variable_slots)
            .chain(&state_slots)
            .copied()
            .collect();

        info!(
            parameters = tables.parameters.len(),
            variables = tables.variables.len(),
            state = tables.state.len(),
            conditions = tables.conditions.len(),
            inputs = inputs.inputs().len(),
            scheme = %self.config.scheme,
            model_step = step,
            "bound model"
        );

        self.binding = Some(Binding {
            symbols,
            variables,
            states,
            commits,
            conditions,
            published,
            fields,
            field_names,
            state_rows,
            inputs,
        });
        self.slots = slots;
        self.iteration = 0;
        Ok(())
    }

    /// Restores State from the InitialConditions, zeroes Variables and
    /// rewinds the input streams.
    pub fn reset(&mut self) -> Result<(), EngineError> {
        let binding = self.binding.as_mut().ok_or(EngineError::Unbound)?;
        for program in &binding.variables {
            self.slots[program.value] = 0.0;
        }
        for (_, value, ic) in &binding.state_rows {
            self.slots[*value] = self.slots[*ic];
        }
        binding.inputs.rewind();
        binding.inputs.publish(&mut self.slots);
        self.iteration = 0;
        debug!("engine reset");
        Ok(())
    }

    /// One full step: temps, commit, inputs, Conditions, divergence check.
    pub fn step(&mut self) -> Result<(), EngineError> {
        self.advance()?;
        self.apply_conditions();
        self.check_divergence()
    }

    /// Binds `tables` and runs `iterations` steps, recording every
    /// `save_mod_n`-th iteration starting at iteration 0. A record is taken
    /// after the commit and input advance, before the Conditions.
    pub fn run(
        &mut self,
        tables: &ModelTables,
        iterations: u64,
        save_mod_n: u32,
    ) -> Result<Trajectory, EngineError> {
        self.bind(tables)?;
        let save_mod_n = save_mod_n.max(1);
        let mut trajectory = Trajectory::new(self.field_names(), save_mod_n);
        let mut record = Vec::new();
        for i in 0..iterations {
            self.advance()?;
            if i % u64::from(save_mod_n) == 0 {
                record.clear();
                record.extend(self.field_slots().iter().map(|&slot| self.slots[slot]));
                trajectory.push_record(&record);
            }
            self.apply_conditions();
            self.check_divergence()?;
        }
        debug!(iterations, records = trajectory.num_records(), "run finished");
        Ok(trajectory)
    }

    /// Interval-sampled RMSE of `field` against `target`, the statistic the
    /// measure artifacts compute.
    ///
    /// The run lasts `sum(interval_lens)` iterations. At the end of interval
    /// `k` (the record point of its last iteration, or the initial value for
    /// leading empty intervals) the field is compared with `target[k]`.
    pub fn measure(
        &mut self,
        tables: &ModelTables,
        field: &str,
        interval_lens: &[u64],
        target: &[f64],
    ) -> Result<f64, EngineError> {
        if target.len() < interval_lens.len() {
            return Err(EngineError::MissingTargets {
                intervals: interval_lens.len(),
                targets: target.len(),
            });
        }
        self.bind(tables)?;
        let slot = self
            .binding
            .as_ref()
            .and_then(|b| b.field_names.iter().position(|name| name == field).map(|i| b.fields[i]))
            .ok_or_else(|| EngineError::UnknownField(field.to_string()))?;

        let count = interval_lens.len();
        let total: u64 = interval_lens.iter().sum();
        let mut sum_sq = 0.0;
        let mut k = 0;
        let mut boundary = interval_lens.first().copied().unwrap_or(0);
        let mut sample = |k: &mut usize, boundary: &mut u64, value: f64, at: u64| {
            while *k < count && *boundary == at {
                let err = value - target[*k];
                sum_sq += err * err;
                *k += 1;
                if *k < count {
                    *boundary += interval_lens[*k];
                }
            }
        };

        sample(&mut k, &mut boundary, self.slots[slot], 0);
        for i in 0..total {
            self.advance()?;
            sample(&mut k, &mut boundary, self.slots[slot], i + 1);
            self.apply_conditions();
            self.check_divergence()?;
        }
        if count == 0 {
            return Ok(0.0);
        }
        Ok((sum_sq / count as f64).sqrt())
    }

    fn advance(&mut self) -> Result<(), EngineError> {
        let binding = self.binding.as_mut().ok_or(EngineError::Unbound)?;
        for program in &binding.variables {
            VM::execute(&program.code, &mut self.slots, &mut self.stack);
            self.slots[program.value] = self.slots[program.temp];
        }
        for program in &binding.states {
            VM::execute(&program.code, &mut self.slots, &mut self.stack);
        }
        for &(temp, value) in &binding.commits {
            self.slots[value] = self.slots[temp];
        }
        binding.inputs.advance(&mut self.slots);
        self.iteration += 1;
        Ok(())
    }

    /// Runs every Condition against a copy of the slots, then publishes the
    /// row values back. Temps and scheme scratch in the primary context are
    /// never touched.
    fn apply_conditions(&mut self) {
        let Some(binding) = self.binding.as_ref() else {
            return;
        };
        if binding.conditions.is_empty() {
            return;
        }
        self.scratch.clear();
        self.scratch.extend_from_slice(&self.slots);
        for condition in &binding.conditions {
            if VM::execute(&condition.test, &mut self.scratch, &mut self.stack) != 0.0 {
                for result in &condition.results {
                    VM::execute(result, &mut self.scratch, &mut self.stack);
                }
            }
        }
        for &slot in &binding.published {
            self.slots[slot] = self.scratch[slot];
        }
    }

    fn check_divergence(&self) -> Result<(), EngineError> {
        let Some(binding) = self.binding.as_ref() else {
            return Ok(());
        };
        let limit = self.config.divergence_limit;
        for (key, slot, _) in &binding.state_rows {
            let value = self.slots[*slot];
            if value.is_nan() || value.abs() > limit {
                return Err(EngineError::Diverged {
                    row: key.clone(),
                    value,
                    iteration: self.iteration,
                });
            }
        }
        Ok(())
    }

    fn field_slots(&self) -> &[usize] {
        self.binding
            .as_ref()
            .map(|b| b.fields.as_slice())
            .unwrap_or(&[])
    }

    /// Names of the recorded fields: Variables then State.
    pub fn field_names(&self) -> Vec<String> {
        self.binding
            .as_ref()
            .map(|b| b.field_names.clone())
            .unwrap_or_default()
    }

    /// Committed values of the recorded fields, in `field_names` order.
    pub fn values(&self) -> Vec<f64> {
        self.field_slots().iter().map(|&slot| self.slots[slot]).collect()
    }

    /// Committed value of any named row.
    pub fn value(&self, key: &str) -> Option<f64> {
        let slot = self.binding.as_ref()?.symbols.get(key)?;
        Some(self.slots[slot])
    }
}

/// Slot assignment for every name of a model: row keys, temps, scratch.
struct Layout {
    symbols: SymbolTable,
    parameters: Vec<usize>,
    initial_conditions: Vec<usize>,
    variables: Vec<usize>,
    state: Vec<usize>,
    variable_temps: Vec<usize>,
    state_temps: Vec<usize>,
}

impl Layout {
    fn new(tables: &ModelTables) -> Self {
        let mut symbols = SymbolTable::new();
        let mut slots_of = |rows: &[crate::model::Row], temp: bool| -> Vec<usize> {
            rows.iter()
                .map(|row| {
                    if temp {
                        symbols.insert(&temp_name(&row.key))
                    } else {
                        symbols.insert(&row.key)
                    }
                })
                .collect()
        };
        let parameters = slots_of(&tables.parameters, false);
        let initial_conditions = slots_of(&tables.initial_conditions, false);
        let variables = slots_of(&tables.variables, false);
        let state = slots_of(&tables.state, false);
        let variable_temps = slots_of(&tables.variables, true);
        let state_temps = slots_of(&tables.state, true);
        for name in SCRATCH_NAMES {
            symbols.insert(name);
        }
        Self {
            symbols,
            parameters,
            initial_conditions,
            variables,
            state,
            variable_temps,
            state_temps,
        }
    }
}

/// Evaluates Parameters then InitialConditions, in table order, into `slots`.
fn evaluate_constants(
    tables: &ModelTables,
    symbols: &SymbolTable,
    param_slots: &[usize],
    ic_slots: &[usize],
    slots: &mut [f64],
) -> Result<(), EngineError> {
    let mut stack = Vec::new();
    let constants = tables
        .parameters
        .iter()
        .zip(param_slots)
        .map(|(row, &slot)| ("parameter", row, slot))
        .chain(
            tables
                .initial_conditions
                .iter()
                .zip(ic_slots)
                .map(|(row, &slot)| ("initial condition", row, slot)),
        );
    for (role, row, slot) in constants {
        let text = rewrite_power(&row.expression);
        let code = compile_row(&format!("{role} `{}`", row.key), &text, symbols)?;
        let value = VM::execute(&code, slots, &mut stack);
        slots[slot] = value;
    }
    Ok(())
}

/// Default values of the Parameters followed by the InitialConditions, the
/// argument order every generated artifact takes.
pub fn constant_values(tables: &ModelTables) -> Result<Vec<f64>, EngineError> {
    tables.validate()?;
    let layout = Layout::new(tables);
    let mut slots = vec![0.0; layout.symbols.len()];
    evaluate_constants(
        tables,
        &layout.symbols,
        &layout.parameters,
        &layout.initial_conditions,
        &mut slots,
    )?;
    Ok(layout
        .parameters
        .iter()
        .chain(&layout.initial_conditions)
        .map(|&slot| slots[slot])
        .collect())
}

fn compile_row(label: &str, text: &str, symbols: &SymbolTable) -> Result<Bytecode, EngineError> {
    compile_text(text, symbols).map_err(|source| expression_error(label, text, source))
}

fn expression_error(label: &str, text: &str, source: ExprError) -> EngineError {
    tracing::warn!(row = label, text, position = source.position(), %source, "expression error");
    EngineError::Expression {
        row: label.to_string(),
        text: text.to_string(),
        source,
    }
}
