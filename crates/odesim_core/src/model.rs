//! Model Tables: the intermediate representation both backends read.

use crate::equation_engine::Function;
use crate::formula::{SCRATCH_NAMES, TEMP_SUFFIX};
use crate::inputs::GeneratorKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use thiserror::Error;

/// Current version of the saved-model JSON layout.
pub const MODEL_FORMAT_VERSION: u32 = 1;

/// Names generated sources use for their own purposes, plus C keywords.
const RESERVED_NAMES: &[&str] = &[
    "MODEL_STEP", "NUM_FIELDS", "NUM_PARS", "NUM_INPUTS", "main", "data", "pars", "auto",
    "break", "case", "char", "const", "continue", "default", "do", "double", "else", "enum",
    "extern", "float", "for", "goto", "if", "inline", "int", "long", "register", "restrict",
    "return", "short", "signed", "sizeof", "static", "struct", "switch", "typedef", "union",
    "unsigned", "void", "volatile", "while", "fmod", "fabs", "fmin", "fmax", "uniform",
    "normal", "gamma",
];

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid key `{key}`: {reason}")]
    InvalidKey { key: String, reason: String },
    #[error("key `{0}` is already used in the model")]
    DuplicateKey(String),
    #[error("row index {index} is out of range for {table} (length {len})")]
    IndexOutOfRange {
        table: TableKind,
        index: usize,
        len: usize,
    },
    #[error("condition index {index} is out of range (length {len})")]
    ConditionOutOfRange { index: usize, len: usize },
    #[error("state has {state} rows but initial conditions have {initial}")]
    PairingMismatch { state: usize, initial: usize },
    #[error("initial conditions are inserted and removed through their State row")]
    PairedRow,
    #[error("unsupported model format version {0}")]
    UnsupportedVersion(u32),
    #[error("malformed model data: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("cannot access model file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Parameters,
    Variables,
    State,
    InitialConditions,
}

impl TableKind {
    pub const ALL: [TableKind; 4] = [
        TableKind::Parameters,
        TableKind::Variables,
        TableKind::State,
        TableKind::InitialConditions,
    ];
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TableKind::Parameters => "parameters",
            TableKind::Variables => "variables",
            TableKind::State => "state",
            TableKind::InitialConditions => "initial conditions",
        })
    }
}

impl FromStr for TableKind {
    type Err = String;

    /// Accepts the serialized table names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parameters" => Ok(TableKind::Parameters),
            "variables" => Ok(TableKind::Variables),
            "state" => Ok(TableKind::State),
            "initial_conditions" => Ok(TableKind::InitialConditions),
            other => Err(format!(
                "unknown table `{other}` (expected parameters, variables, state or initial_conditions)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

/// One named quantity of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub key: String,
    /// Expression in the model grammar; blank means zero.
    #[serde(default)]
    pub expression: String,
    #[serde(default)]
    pub freeze: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
}

impl Row {
    pub fn new(key: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            expression: expression.into(),
            freeze: false,
            range: None,
        }
    }

    pub fn frozen(mut self) -> Self {
        self.freeze = true;
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some(Range { min, max });
        self
    }

    /// Input binding carried by a Variable's expression, if any.
    pub fn input_binding(&self) -> Option<InputBinding> {
        InputBinding::classify(&self.expression)
    }
}

/// A Variable fed by a sample stream instead of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum InputBinding {
    Generator(GeneratorKind),
    File(PathBuf),
}

impl InputBinding {
    /// A reserved generator token, or a double-quoted file path.
    pub fn classify(expression: &str) -> Option<InputBinding> {
        let trimmed = expression.trim();
        if let Some(kind) = GeneratorKind::from_token(trimmed) {
            return Some(InputBinding::Generator(kind));
        }
        let path = trimmed.strip_prefix('"')?.strip_suffix('"')?;
        (!path.is_empty()).then(|| InputBinding::File(PathBuf::from(path)))
    }
}

/// A triggered event: when `test` is non-zero, `results` are evaluated in
/// order. Fires on every step the test holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub test: String,
    #[serde(default)]
    pub results: Vec<String>,
}

impl Condition {
    pub fn new(test: impl Into<String>, results: &[&str]) -> Self {
        Self {
            test: test.into(),
            results: results.iter().map(|r| r.to_string()).collect(),
        }
    }
}

/// The five model tables. State and InitialConditions are paired by index.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelTables {
    #[serde(default)]
    pub parameters: Vec<Row>,
    #[serde(default)]
    pub variables: Vec<Row>,
    #[serde(default)]
    pub state: Vec<Row>,
    #[serde(default)]
    pub initial_conditions: Vec<Row>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Serialize, Deserialize)]
struct SavedModel {
    version: u32,
    #[serde(flatten)]
    tables: ModelTables,
}

impl ModelTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self, kind: TableKind) -> &[Row] {
        match kind {
            TableKind::Parameters => &self.parameters,
            TableKind::Variables => &self.variables,
            TableKind::State => &self.state,
            TableKind::InitialConditions => &self.initial_conditions,
        }
    }

    fn rows_mut(&mut self, kind: TableKind) -> &mut Vec<Row> {
        match kind {
            TableKind::Parameters => &mut self.parameters,
            TableKind::Variables => &mut self.variables,
            TableKind::State => &mut self.state,
            TableKind::InitialConditions => &mut self.initial_conditions,
        }
    }

    pub fn row(&self, kind: TableKind, key: &str) -> Option<&Row> {
        self.rows(kind).iter().find(|row| row.key == key)
    }

    /// Paired InitialCondition of the State row at `index`.
    pub fn initial_for(&self, index: usize) -> Option<&Row> {
        self.initial_conditions.get(index)
    }

    /// Names of the recorded fields: Variables then State, in table order.
    pub fn field_names(&self) -> Vec<String> {
        self.variables
            .iter()
            .chain(self.state.iter())
            .map(|row| row.key.clone())
            .collect()
    }

    /// Every key of the shared namespace, in table order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.parameters
            .iter()
            .chain(self.variables.iter())
            .chain(self.state.iter())
            .chain(self.initial_conditions.iter())
            .map(|row| row.key.as_str())
    }

    fn contains_key(&self, key: &str) -> bool {
        self.keys().any(|existing| existing == key)
    }

    // --- Edits ---

    /// Appends a row. Appending to State also appends its InitialCondition.
    pub fn push_row(&mut self, kind: TableKind, row: Row) -> Result<(), ModelError> {
        let index = self.rows(kind).len();
        self.insert_row(kind, index, row)
    }

    /// Appends a State row together with its InitialCondition expression.
    pub fn push_state(
        &mut self,
        key: &str,
        derivative: &str,
        initial: &str,
    ) -> Result<(), ModelError> {
        let index = self.state.len();
        self.insert_state_pair(
            index,
            Row::new(key, derivative),
            Row::new(initial_key(key), initial),
        )
    }

    /// Inserts a row at `index`. A State insert mirrors an InitialCondition
    /// row named `<key>_0` (expression `0`) at the same index.
    pub fn insert_row(&mut self, kind: TableKind, index: usize, row: Row) -> Result<(), ModelError> {
        match kind {
            TableKind::InitialConditions => Err(ModelError::PairedRow),
            TableKind::State => {
                let initial = Row::new(initial_key(&row.key), "0");
                self.insert_state_pair(index, row, initial)
            }
            _ => {
                check_key(&row.key)?;
                if self.contains_key(&row.key) {
                    return Err(ModelError::DuplicateKey(row.key));
                }
                let rows = self.rows_mut(kind);
                check_insert_index(kind, index, rows.len())?;
                rows.insert(index, row);
                Ok(())
            }
        }
    }

    pub fn insert_state_pair(
        &mut self,
        index: usize,
        state: Row,
        initial: Row,
    ) -> Result<(), ModelError> {
        check_key(&state.key)?;
        check_key(&initial.key)?;
        if state.key == initial.key {
            return Err(ModelError::DuplicateKey(initial.key));
        }
        for key in [&state.key, &initial.key] {
            if self.contains_key(key) {
                return Err(ModelError::DuplicateKey(key.clone()));
            }
        }
        check_insert_index(TableKind::State, index, self.state.len())?;
        self.state.insert(index, state);
        self.initial_conditions.insert(index, initial);
        Ok(())
    }

    /// Removes a row. Removing a State row also removes its InitialCondition.
    pub fn remove_row(&mut self, kind: TableKind, index: usize) -> Result<Row, ModelError> {
        if kind == TableKind::InitialConditions {
            return Err(ModelError::PairedRow);
        }
        check_index(kind, index, self.rows(kind).len())?;
        if kind == TableKind::State {
            self.initial_conditions.remove(index);
        }
        Ok(self.rows_mut(kind).remove(index))
    }

    pub fn set_expression(
        &mut self,
        kind: TableKind,
        index: usize,
        expression: impl Into<String>,
    ) -> Result<(), ModelError> {
        self.row_mut(kind, index)?.expression = expression.into();
        Ok(())
    }

    pub fn set_freeze(&mut self, kind: TableKind, index: usize, freeze: bool) -> Result<(), ModelError> {
        self.row_mut(kind, index)?.freeze = freeze;
        Ok(())
    }

    pub fn set_range(
        &mut self,
        kind: TableKind,
        index: usize,
        range: Option<Range>,
    ) -> Result<(), ModelError> {
        self.row_mut(kind, index)?.range = range;
        Ok(())
    }

    pub fn rename(&mut self, kind: TableKind, index: usize, key: &str) -> Result<(), ModelError> {
        check_key(key)?;
        check_index(kind, index, self.rows(kind).len())?;
        if self.rows(kind)[index].key == key {
            return Ok(());
        }
        if self.contains_key(key) {
            return Err(ModelError::DuplicateKey(key.to_string()));
        }
        self.rows_mut(kind)[index].key = key.to_string();
        Ok(())
    }

    fn row_mut(&mut self, kind: TableKind, index: usize) -> Result<&mut Row, ModelError> {
        let len = self.rows(kind).len();
        self.rows_mut(kind)
            .get_mut(index)
            .ok_or(ModelError::IndexOutOfRange {
                table: kind,
                index,
                len,
            })
    }

    pub fn push_condition(&mut self, condition: Condition) {
        self.conditions.push(condition);
    }

    pub fn set_condition(&mut self, index: usize, condition: Condition) -> Result<(), ModelError> {
        let len = self.conditions.len();
        let slot = self
            .conditions
            .get_mut(index)
            .ok_or(ModelError::ConditionOutOfRange { index, len })?;
        *slot = condition;
        Ok(())
    }

    pub fn remove_condition(&mut self, index: usize) -> Result<Condition, ModelError> {
        if index >= self.conditions.len() {
            return Err(ModelError::ConditionOutOfRange {
                index,
                len: self.conditions.len(),
            });
        }
        Ok(self.conditions.remove(index))
    }

    // --- Validation & persistence ---

    /// Checks keys, namespace uniqueness, and State/IC pairing.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.state.len() != self.initial_conditions.len() {
            return Err(ModelError::PairingMismatch {
                state: self.state.len(),
                initial: self.initial_conditions.len(),
            });
        }
        let mut seen = HashSet::new();
        for key in self.keys() {
            check_key(key)?;
            if !seen.insert(key) {
                return Err(ModelError::DuplicateKey(key.to_string()));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, ModelError> {
        let saved = SavedModel {
            version: MODEL_FORMAT_VERSION,
            tables: self.clone(),
        };
        Ok(serde_json::to_string_pretty(&saved)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ModelError> {
        let saved: SavedModel = serde_json::from_str(text)?;
        if saved.version != MODEL_FORMAT_VERSION {
            return Err(ModelError::UnsupportedVersion(saved.version));
        }
        saved.tables.validate()?;
        Ok(saved.tables)
    }

    /// Replaces `self` with the model in `text`. On any error `self` is
    /// left exactly as it was.
    pub fn replace_from_json(&mut self, text: &str) -> Result<(), ModelError> {
        let loaded = Self::from_json(text)?;
        *self = loaded;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let text = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let text = self.to_json()?;
        std::fs::write(path, text).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Default key of the InitialCondition paired with State row `key`.
pub fn initial_key(key: &str) -> String {
    format!("{key}_0")
}

fn check_key(key: &str) -> Result<(), ModelError> {
    let invalid = |reason: &str| {
        Err(ModelError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        })
    };
    let mut chars = key.chars();
    match chars.next() {
        None => return invalid("keys must not be empty"),
        Some(c) if !(c.is_ascii_alphabetic() || c == '_') => {
            return invalid("keys must start with a letter or underscore")
        }
        _ => {}
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return invalid("keys may only contain letters, digits and underscores");
    }
    if key.ends_with(TEMP_SUFFIX) {
        return invalid("the `_temp_` suffix is reserved for commit shadows");
    }
    if key.starts_with("__") || key.starts_with("odesim_") || SCRATCH_NAMES.contains(&key) {
        return invalid("names starting with `__` or `odesim_` are reserved");
    }
    if RESERVED_NAMES.contains(&key) || Function::is_builtin_name(key) {
        return invalid("the name is reserved");
    }
    Ok(())
}

fn check_index(table: TableKind, index: usize, len: usize) -> Result<(), ModelError> {
    if index < len {
        Ok(())
    } else {
        Err(ModelError::IndexOutOfRange { table, index, len })
    }
}

fn check_insert_index(table: TableKind, index: usize, len: usize) -> Result<(), ModelError> {
    if index <= len {
        Ok(())
    } else {
        Err(ModelError::IndexOutOfRange { table, index, len })
    }
}

// --- Shared model ---

/// Model Tables shared between the editing layer, the simulation worker and
/// the generation pipeline.
///
/// Readers take the whole table per pass. Every successful edit bumps the
/// generation counter, which the worker compares at its next step boundary
/// to decide whether to re-bind.
#[derive(Debug, Clone, Default)]
pub struct SharedModel {
    tables: Arc<RwLock<ModelTables>>,
    generation: Arc<AtomicU64>,
}

impl SharedModel {
    pub fn new(tables: ModelTables) -> Self {
        Self {
            tables: Arc::new(RwLock::new(tables)),
            generation: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ModelTables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> ModelTables {
        self.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Applies `edit` to a copy of the tables and swaps it in only if the
    /// edit succeeds, so a failed edit never leaves a partial change behind.
    pub fn edit<R>(
        &self,
        edit: impl FnOnce(&mut ModelTables) -> Result<R, ModelError>,
    ) -> Result<R, ModelError> {
        let mut guard = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let mut draft = guard.clone();
        let result = edit(&mut draft)?;
        *guard = draft;
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(result)
    }

    /// Loads a saved model file, keeping the current model on failure.
    pub fn load_file(&self, path: &Path) -> Result<(), ModelError> {
        let loaded = ModelTables::load(path)?;
        self.edit(|tables| {
            *tables = loaded;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_model() -> ModelTables {
        let mut tables = ModelTables::new();
        tables
            .push_row(TableKind::Parameters, Row::new("a", "4"))
            .expect("param");
        tables.push_state("v", "u + a", "1").expect("state");
        tables.push_state("u", "-v", "0").expect("state");
        tables
    }

    #[test]
    fn state_inserts_and_removes_mirror_initial_conditions() {
        let mut tables = sample_model();
        tables
            .insert_row(TableKind::State, 1, Row::new("w", "0"))
            .expect("insert state");
        let keys: Vec<&str> = tables.initial_conditions.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["v_0", "w_0", "u_0"]);

        tables.remove_row(TableKind::State, 0).expect("remove state");
        let keys: Vec<&str> = tables.initial_conditions.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["w_0", "u_0"]);
        assert_eq!(tables.state.len(), tables.initial_conditions.len());
    }

    #[test]
    fn initial_conditions_cannot_be_edited_structurally() {
        let mut tables = sample_model();
        assert!(matches!(
            tables.push_row(TableKind::InitialConditions, Row::new("z", "0")),
            Err(ModelError::PairedRow)
        ));
        assert!(matches!(
            tables.remove_row(TableKind::InitialConditions, 0),
            Err(ModelError::PairedRow)
        ));
        tables
            .set_expression(TableKind::InitialConditions, 0, "2")
            .expect("expression edits are allowed");
    }

    #[test]
    fn keys_are_unique_across_tables() {
        let mut tables = sample_model();
        let err = tables
            .push_row(TableKind::Variables, Row::new("a", "1"))
            .expect_err("duplicate key");
        assert!(matches!(err, ModelError::DuplicateKey(key) if key == "a"));
        let err = tables.push_state("x", "0", "0").and_then(|_| tables.push_state("v_0", "0", "0"));
        assert!(matches!(err, Err(ModelError::DuplicateKey(_))));
    }

    #[test]
    fn reserved_and_malformed_keys_are_rejected() {
        let mut tables = ModelTables::new();
        for key in ["", "1x", "x y", "x_temp_", "__k1", "sin", "double", "MODEL_STEP", "normal"] {
            let result = tables.push_row(TableKind::Parameters, Row::new(key, "0"));
            assert!(
                matches!(result, Err(ModelError::InvalidKey { .. })),
                "key {key:?} should be rejected"
            );
        }
    }

    #[test]
    fn input_bindings_are_classified() {
        assert_eq!(
            InputBinding::classify(" normal "),
            Some(InputBinding::Generator(GeneratorKind::Normal))
        );
        assert_eq!(
            InputBinding::classify("\"data/drive.bin\""),
            Some(InputBinding::File(PathBuf::from("data/drive.bin")))
        );
        assert_eq!(InputBinding::classify("normal + 1"), None);
        assert_eq!(InputBinding::classify("\"\""), None);
    }

    #[test]
    fn json_round_trip_preserves_tables() {
        let mut tables = sample_model();
        tables
            .push_row(TableKind::Variables, Row::new("w", "uniform").with_range(0.0, 1.0))
            .expect("variable");
        tables.set_freeze(TableKind::State, 1, true).expect("freeze");
        tables.push_condition(Condition::new("v > 30", &["v = -65", "u = u + 8"]));

        let json = tables.to_json().expect("serialize");
        let loaded = ModelTables::from_json(&json).expect("deserialize");
        assert_eq!(loaded, tables);
    }

    #[test]
    fn malformed_load_leaves_model_intact() {
        let mut tables = sample_model();
        let before = tables.clone();

        let err = tables.replace_from_json("{ not json").expect_err("syntax error");
        assert!(matches!(err, ModelError::Parse(_)));

        let unpaired = r#"{"version":1,"state":[{"key":"x"}],"initial_conditions":[]}"#;
        let err = tables.replace_from_json(unpaired).expect_err("pairing error");
        assert!(matches!(err, ModelError::PairingMismatch { state: 1, initial: 0 }));

        let future = r#"{"version":99}"#;
        let err = tables.replace_from_json(future).expect_err("version error");
        assert!(matches!(err, ModelError::UnsupportedVersion(99)));

        assert_eq!(tables, before);
    }

    #[test]
    fn shared_model_bumps_generation_only_on_success() {
        let shared = SharedModel::new(sample_model());
        let start = shared.generation();
        shared
            .edit(|tables| tables.set_expression(TableKind::Parameters, 0, "5"))
            .expect("edit");
        assert_eq!(shared.generation(), start + 1);

        let failed = shared.edit(|tables| {
            tables.set_expression(TableKind::Parameters, 0, "6")?;
            tables.remove_row(TableKind::Variables, 3).map(|_| ())
        });
        assert!(failed.is_err());
        assert_eq!(shared.generation(), start + 1);
        assert_eq!(shared.read().parameters[0].expression, "5");
    }
}
