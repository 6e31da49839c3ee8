pub mod codegen;
pub mod engine;
pub mod equation_engine;
pub mod formula;
pub mod inputs;
pub mod log;
pub mod model;
pub mod preprocess;
pub mod toolchain;
pub mod trajectory;
/// The `odesim_core` crate simulates dynamical systems described by Model Tables.
///
/// The same per-step formulas drive two executors: an interpreter that runs the
/// model live, and code generators that emit C, CUDA and MATLAB sources for
/// external toolchains.
///
/// Key components:
/// - **Model**: `ModelTables` (Parameters, Variables, State, InitialConditions, Conditions) and the shared, generation-counted `SharedModel`.
/// - **Equation Engine**: A custom bytecode VM for evaluating row expressions efficiently.
/// - **Formula**: Euler, Heun and RK4 commit formulas, parameterised by the step representation.
/// - **Engine**: The two-phase interpreter (evaluate into temps, then commit), with inputs, Conditions and trajectory recording.
/// - **Codegen / Toolchain**: One emission skeleton with per-target emitters, and the driver that compiles and launches the results.
pub mod traits;
pub mod worker;
