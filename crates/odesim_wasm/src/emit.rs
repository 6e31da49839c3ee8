//! Source generation without a toolchain: the page offers the text for
//! download.

use crate::simulation::WasmSimulation;
use odesim_core::codegen::{emit, EmitOptions, Target};
use wasm_bindgen::prelude::*;

/// Names accepted by [`emit_source`].
#[wasm_bindgen]
pub fn target_names() -> Vec<String> {
    Target::ALL.iter().map(|target| target.name().to_string()).collect()
}

/// Generates the source of `target` for the simulation's current model and
/// configuration.
#[wasm_bindgen]
pub fn emit_source(simulation: &WasmSimulation, target: &str, name: &str) -> Result<String, JsValue> {
    let target: Target = target.parse().map_err(|err: String| JsValue::from_str(&err))?;
    let options = EmitOptions::new(name, simulation.config());
    emit(&simulation.tables, &options, target).map_err(|err| {
        let err = anyhow::Error::new(err).context(format!("cannot generate {target} source"));
        JsValue::from_str(&format!("{err:#}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use odesim_core::model::ModelTables;

    #[test]
    fn emits_companion_for_the_current_model() {
        let mut tables = ModelTables::new();
        tables.push_state("x", "-x", "1").expect("x");
        let sim = WasmSimulation::new(&tables.to_json().expect("json"), "heun", 0.05).expect("simulation");
        let source = emit_source(&sim, "companion", "decay").expect("emit");
        assert!(source.starts_with("function varargout = decay(varargin)"));
        assert!(target_names().contains(&"gpu-measure".to_string()));
    }
}
