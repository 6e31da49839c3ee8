//! Interpreter wrapper owning one model and one engine.

use odesim_core::engine::{Engine, EngineConfig};
use odesim_core::formula::Scheme;
use odesim_core::model::{Condition, ModelTables, Row, TableKind};
use serde::Serialize;
use serde_wasm_bindgen::{from_value, to_value};
use wasm_bindgen::prelude::*;

#[wasm_bindgen]
pub struct WasmSimulation {
    pub(crate) tables: ModelTables,
    engine: Engine,
}

/// Row counts reported to the editor.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelSummary {
    parameters: usize,
    variables: usize,
    state: usize,
    conditions: usize,
    fields: Vec<String>,
}

pub(crate) fn js_error(err: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&err.to_string())
}

fn table(kind: &str) -> Result<TableKind, JsValue> {
    kind.parse().map_err(|err: String| JsValue::from_str(&err))
}

#[wasm_bindgen]
impl WasmSimulation {
    #[wasm_bindgen(constructor)]
    pub fn new(model_json: &str, scheme: &str, model_step: f64) -> Result<WasmSimulation, JsValue> {
        console_error_panic_hook::set_once();

        let tables = ModelTables::from_json(model_json).map_err(js_error)?;
        let scheme: Scheme = scheme.parse().map_err(js_error)?;
        if !(model_step.is_finite() && model_step > 0.0) {
            return Err(JsValue::from_str("model step must be positive"));
        }
        let config = EngineConfig {
            model_step,
            scheme,
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(config);
        engine.bind(&tables).map_err(js_error)?;
        Ok(WasmSimulation { tables, engine })
    }

    /// Replaces the whole engine configuration (an `EngineConfig` object)
    /// and re-binds from the initial conditions.
    pub fn set_config(&mut self, config_val: JsValue) -> Result<(), JsValue> {
        let config: EngineConfig = from_value(config_val)
            .map_err(|e| JsValue::from_str(&format!("Invalid engine config: {}", e)))?;
        self.engine.set_config(config);
        self.engine.bind(&self.tables).map_err(js_error)
    }

    pub fn step(&mut self, iterations: u32) -> Result<(), JsValue> {
        for _ in 0..iterations {
            self.engine.step().map_err(js_error)?;
        }
        Ok(())
    }

    pub fn reset(&mut self) -> Result<(), JsValue> {
        self.engine.reset().map_err(js_error)
    }

    pub fn iteration(&self) -> f64 {
        self.engine.iteration() as f64
    }

    pub fn field_names(&self) -> Vec<String> {
        self.engine.field_names()
    }

    pub fn values(&self) -> Vec<f64> {
        self.engine.values()
    }

    pub fn value(&self, key: &str) -> Option<f64> {
        self.engine.value(key)
    }

    pub fn model_json(&self) -> Result<String, JsValue> {
        self.tables.to_json().map_err(js_error)
    }

    /// Swaps in a saved model; on error the current model stays loaded.
    pub fn load_model(&mut self, model_json: &str) -> Result<(), JsValue> {
        let tables = ModelTables::from_json(model_json).map_err(js_error)?;
        self.engine.bind(&tables).map_err(js_error)?;
        self.tables = tables;
        Ok(())
    }

    pub fn summary(&self) -> Result<JsValue, JsValue> {
        let summary = ModelSummary {
            parameters: self.tables.parameters.len(),
            variables: self.tables.variables.len(),
            state: self.tables.state.len(),
            conditions: self.tables.conditions.len(),
            fields: self.tables.field_names(),
        };
        to_value(&summary).map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }

    pub fn set_expression(&mut self, kind: &str, index: usize, expression: &str) -> Result<(), JsValue> {
        let kind = table(kind)?;
        self.edit(|tables| tables.set_expression(kind, index, expression))
    }

    pub fn set_freeze(&mut self, kind: &str, index: usize, freeze: bool) -> Result<(), JsValue> {
        let kind = table(kind)?;
        self.edit(|tables| tables.set_freeze(kind, index, freeze))
    }

    pub fn add_row(&mut self, kind: &str, key: &str, expression: &str) -> Result<(), JsValue> {
        let kind = table(kind)?;
        self.edit(|tables| tables.push_row(kind, Row::new(key, expression)))
    }

    pub fn remove_row(&mut self, kind: &str, index: usize) -> Result<(), JsValue> {
        let kind = table(kind)?;
        self.edit(|tables| tables.remove_row(kind, index).map(drop))
    }

    pub fn add_condition(&mut self, test: &str, results: Vec<String>) -> Result<(), JsValue> {
        let results: Vec<&str> = results.iter().map(String::as_str).collect();
        self.edit(|tables| {
            tables.push_condition(Condition::new(test, &results));
            Ok(())
        })
    }

    /// Runs `iterations` steps from the initial conditions and returns the
    /// trajectory file bytes.
    pub fn run(&mut self, iterations: u32, save_mod_n: u32) -> Result<Vec<u8>, JsValue> {
        let trajectory = self
            .engine
            .run(&self.tables, u64::from(iterations), save_mod_n)
            .map_err(js_error)?;
        Ok(trajectory.to_bytes())
    }

    /// Like [`WasmSimulation::run`], but one `Float64Array` per field in
    /// `field_names` order, ready for plotting.
    pub fn run_columns(&mut self, iterations: u32, save_mod_n: u32) -> Result<js_sys::Array, JsValue> {
        let trajectory = self
            .engine
            .run(&self.tables, u64::from(iterations), save_mod_n)
            .map_err(js_error)?;
        let columns = js_sys::Array::new();
        for index in 0..trajectory.num_fields() {
            let column = trajectory.column_at(index).unwrap_or(&[]);
            columns.push(&js_sys::Float64Array::from(column));
        }
        Ok(columns)
    }

    pub fn measure(&mut self, field: &str, interval_lens: Vec<u32>, target: Vec<f64>) -> Result<f64, JsValue> {
        let lens: Vec<u64> = interval_lens.into_iter().map(u64::from).collect();
        self.engine
            .measure(&self.tables, field, &lens, &target)
            .map_err(js_error)
    }
}

impl WasmSimulation {
    pub(crate) fn config(&self) -> &EngineConfig {
        self.engine.config()
    }

    /// Applies `change` to a copy of the tables and keeps it only if the
    /// engine accepts the result; committed values carry over.
    fn edit<F>(&mut self, change: F) -> Result<(), JsValue>
    where
        F: FnOnce(&mut ModelTables) -> Result<(), odesim_core::model::ModelError>,
    {
        let mut tables = self.tables.clone();
        change(&mut tables).map_err(js_error)?;
        self.engine.rebind(&tables).map_err(js_error)?;
        self.tables = tables;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odesim_core::trajectory::Trajectory;

    fn neuron_json() -> String {
        let mut tables = ModelTables::new();
        tables
            .push_row(TableKind::Parameters, Row::new("a", "4"))
            .expect("a");
        tables
            .push_row(TableKind::Parameters, Row::new("b", "10"))
            .expect("b");
        tables
            .push_row(TableKind::Parameters, Row::new("tau", "0.1"))
            .expect("tau");
        tables.push_state("v", "tau*(u+a)/b", "1").expect("v");
        tables.push_state("u", "tau*(b-v)", "0").expect("u");
        tables.to_json().expect("json")
    }

    #[test]
    fn simulation_steps_like_the_engine() {
        let mut sim = WasmSimulation::new(&neuron_json(), "euler", 0.1).expect("simulation");
        sim.step(1).expect("step");
        assert_eq!(sim.field_names(), vec!["v", "u"]);
        assert!((sim.value("v").expect("v") - 1.004).abs() < 1e-12);
        assert!((sim.value("u").expect("u") - 0.09).abs() < 1e-12);
        assert_eq!(sim.iteration(), 1.0);

        sim.reset().expect("reset");
        assert_eq!(sim.values(), vec![1.0, 0.0]);
    }

    #[test]
    fn edits_rebind_and_keep_committed_values() {
        let mut sim = WasmSimulation::new(&neuron_json(), "euler", 0.1).expect("simulation");
        sim.step(3).expect("step");
        let v = sim.value("v").expect("v");
        sim.set_freeze("state", 1, true).expect("freeze u");
        assert_eq!(sim.value("v"), Some(v));
        sim.step(1).expect("step");
        // A frozen State row holds its initial condition.
        assert_eq!(sim.value("u"), Some(0.0));
    }

    #[test]
    fn run_returns_a_trajectory_file() {
        let mut sim = WasmSimulation::new(&neuron_json(), "rk4", 0.1).expect("simulation");
        let bytes = sim.run(10, 5).expect("run");
        let trajectory = Trajectory::from_bytes(&bytes).expect("trajectory");
        assert_eq!(trajectory.num_records(), 2);
        assert_eq!(trajectory.names(), ["v", "u"]);
    }
}
