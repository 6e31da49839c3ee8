//! Browser bridge: the live interpreter and the code generators behind
//! `wasm_bindgen` types.

mod emit;
mod simulation;

pub use emit::{emit_source, target_names};
pub use simulation::WasmSimulation;
