//! Input sources for Variables that are fed by sample streams.
//!
//! A stream is a fixed buffer, generated once from a seeded RNG or loaded once
//! from a sample file, and cycled circularly. Each stream advances on its own
//! cadence, `ceil(1 / (model_step * samples_per_unit_time))` steps per
//! sample, independent of the model clock. Variables bound to the same source
//! listen to one shared stream.

use crate::traits::SampleSource;
use crate::trajectory::{
    count_to_i32, read_count, read_f64, read_i32, write_i32, FormatError, MAX_PREALLOC,
};
use anyhow::{anyhow, ensure, Context};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Gamma, StandardNormal};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub const SAMPLE_FORMAT_VERSION: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorKind {
    Uniform,
    Normal,
    Gamma,
}

impl GeneratorKind {
    pub const ALL: [GeneratorKind; 3] = [
        GeneratorKind::Uniform,
        GeneratorKind::Normal,
        GeneratorKind::Gamma,
    ];

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.token() == token)
    }

    pub fn token(self) -> &'static str {
        match self {
            GeneratorKind::Uniform => "uniform",
            GeneratorKind::Normal => "normal",
            GeneratorKind::Gamma => "gamma",
        }
    }

    fn seed_offset(self) -> u64 {
        match self {
            GeneratorKind::Uniform => 0,
            GeneratorKind::Normal => 1,
            GeneratorKind::Gamma => 2,
        }
    }
}

/// Buffer length, rate and seed used for generated streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub buffer_len: usize,
    pub samples_per_unit_time: u32,
    pub seed: u64,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            buffer_len: 10_000,
            samples_per_unit_time: 100,
            seed: 0,
        }
    }
}

/// A fully loaded sample stream, in memory or on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    pub samples_per_unit_time: u32,
    pub samples: Vec<f64>,
}

impl SampleBuffer {
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), FormatError> {
        write_i32(writer, SAMPLE_FORMAT_VERSION)?;
        write_i32(
            writer,
            count_to_i32(self.samples_per_unit_time as usize, "samples per unit time")?,
        )?;
        write_i32(writer, count_to_i32(self.samples.len(), "sample count")?)?;
        for sample in &self.samples {
            writer.write_all(&sample.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, FormatError> {
        let version = read_i32(reader)?;
        if version != SAMPLE_FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }
        let samples_per_unit_time = read_count(reader, "samples per unit time")? as u32;
        if samples_per_unit_time == 0 {
            return Err(FormatError::Invalid(
                "samples per unit time must be positive".to_string(),
            ));
        }
        let count = read_count(reader, "sample count")?;
        if count == 0 {
            return Err(FormatError::Invalid("sample file is empty".to_string()));
        }
        let mut samples = Vec::with_capacity(count.min(MAX_PREALLOC));
        for _ in 0..count {
            samples.push(read_f64(reader)?);
        }
        Ok(Self {
            samples_per_unit_time,
            samples,
        })
    }

    pub fn write_file(&self, path: &Path) -> Result<(), FormatError> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_file(path: &Path) -> Result<Self, FormatError> {
        let mut reader = BufReader::new(File::open(path)?);
        Self::read_from(&mut reader)
    }
}

/// Pseudo-random stream seeded per generator kind.
#[derive(Debug, Clone)]
pub struct Generator {
    pub kind: GeneratorKind,
    pub config: InputConfig,
}

impl SampleSource for Generator {
    fn source_key(&self) -> String {
        self.kind.token().to_string()
    }

    fn load(&self) -> anyhow::Result<SampleBuffer> {
        ensure!(self.config.buffer_len > 0, "input buffer length must be positive");
        ensure!(
            self.config.samples_per_unit_time > 0,
            "samples per unit time must be positive"
        );
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(self.kind.seed_offset()));
        let len = self.config.buffer_len;
        let samples: Vec<f64> = match self.kind {
            GeneratorKind::Uniform => (0..len).map(|_| rng.gen::<f64>()).collect(),
            GeneratorKind::Normal => (0..len).map(|_| StandardNormal.sample(&mut rng)).collect(),
            GeneratorKind::Gamma => {
                let gamma = Gamma::new(1.0, 1.0).map_err(|err| anyhow!("gamma distribution: {err}"))?;
                (0..len).map(|_| gamma.sample(&mut rng)).collect()
            }
        };
        Ok(SampleBuffer {
            samples_per_unit_time: self.config.samples_per_unit_time,
            samples,
        })
    }
}

/// Stream read from a versioned sample file.
#[derive(Debug, Clone)]
pub struct SampleFile {
    pub path: PathBuf,
}

impl SampleSource for SampleFile {
    fn source_key(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn load(&self) -> anyhow::Result<SampleBuffer> {
        SampleBuffer::read_file(&self.path)
            .with_context(|| format!("failed to read sample file {}", self.path.display()))
    }
}

/// Steps per sample advance for a stream, never less than one.
pub fn cadence(model_step: f64, samples_per_unit_time: u32) -> u64 {
    let steps = (1.0 / (model_step * f64::from(samples_per_unit_time))).ceil();
    if steps.is_finite() && steps > 1.0 {
        steps as u64
    } else {
        1
    }
}

/// One live stream and the slots listening to it.
#[derive(Debug, Clone)]
pub struct Input {
    key: String,
    buffer: SampleBuffer,
    cadence: u64,
    counter: u64,
    cursor: usize,
    listeners: Vec<usize>,
}

impl Input {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn cadence(&self) -> u64 {
        self.cadence
    }

    pub fn current(&self) -> f64 {
        self.buffer.samples[self.cursor]
    }

    pub fn listeners(&self) -> &[usize] {
        &self.listeners
    }
}

/// All streams of a bound model.
#[derive(Debug, Clone, Default)]
pub struct InputSet {
    inputs: Vec<Input>,
}

impl InputSet {
    /// Builds one stream per distinct source and attaches each listener slot.
    pub fn bind(
        listeners: Vec<(usize, Box<dyn SampleSource>)>,
        model_step: f64,
    ) -> anyhow::Result<Self> {
        let mut inputs: Vec<Input> = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();
        for (slot, source) in listeners {
            let key = source.source_key();
            if let Some(&index) = by_key.get(&key) {
                inputs[index].listeners.push(slot);
                continue;
            }
            let buffer = source.load()?;
            ensure!(!buffer.samples.is_empty(), "input `{key}` has no samples");
            tracing::debug!(
                source = %key,
                samples = buffer.samples.len(),
                samples_per_unit_time = buffer.samples_per_unit_time,
                "bound input stream"
            );
            by_key.insert(key.clone(), inputs.len());
            inputs.push(Input {
                cadence: cadence(model_step, buffer.samples_per_unit_time),
                key,
                buffer,
                counter: 0,
                cursor: 0,
                listeners: vec![slot],
            });
        }
        Ok(Self { inputs })
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    /// Writes every stream's current sample into its listener slots.
    pub fn publish(&self, slots: &mut [f64]) {
        for input in &self.inputs {
            let value = input.current();
            for &slot in &input.listeners {
                slots[slot] = value;
            }
        }
    }

    /// Advances each stream's own clock by one model step and publishes.
    pub fn advance(&mut self, slots: &mut [f64]) {
        for input in &mut self.inputs {
            input.counter += 1;
            if input.counter >= input.cadence {
                input.counter = 0;
                input.cursor = (input.cursor + 1) % input.buffer.samples.len();
            }
        }
        self.publish(slots);
    }

    pub fn rewind(&mut self) {
        for input in &mut self.inputs {
            input.counter = 0;
            input.cursor = 0;
        }
    }
}

/// Builds the source for an input binding.
pub fn source_for(
    binding: &crate::model::InputBinding,
    config: &InputConfig,
) -> Box<dyn SampleSource> {
    match binding {
        crate::model::InputBinding::Generator(kind) => Box::new(Generator {
            kind: *kind,
            config: config.clone(),
        }),
        crate::model::InputBinding::File(path) => Box::new(SampleFile { path: path.clone() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator(kind: GeneratorKind, len: usize) -> Generator {
        Generator {
            kind,
            config: InputConfig {
                buffer_len: len,
                samples_per_unit_time: 10,
                seed: 42,
            },
        }
    }

    #[test]
    fn generators_are_deterministic_and_in_range() {
        let a = generator(GeneratorKind::Uniform, 500).load().expect("uniform");
        let b = generator(GeneratorKind::Uniform, 500).load().expect("uniform");
        assert_eq!(a, b);
        assert!(a.samples.iter().all(|s| (0.0..1.0).contains(s)));

        let gamma = generator(GeneratorKind::Gamma, 500).load().expect("gamma");
        assert!(gamma.samples.iter().all(|s| *s >= 0.0));

        let normal = generator(GeneratorKind::Normal, 2000).load().expect("normal");
        let mean = normal.samples.iter().sum::<f64>() / normal.samples.len() as f64;
        assert!(mean.abs() < 0.1, "mean {mean}");
    }

    #[test]
    fn cadence_rounds_up_and_is_at_least_one() {
        assert_eq!(cadence(0.1, 10), 1);
        assert_eq!(cadence(0.01, 10), 10);
        assert_eq!(cadence(0.03, 10), 4);
        assert_eq!(cadence(1.0, 100), 1);
    }

    #[test]
    fn sample_file_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("drive.bin");
        let buffer = SampleBuffer {
            samples_per_unit_time: 4,
            samples: vec![1.0, -2.5, 3.25],
        };
        buffer.write_file(&path).expect("write");
        let loaded = SampleFile { path: path.clone() }.load().expect("read");
        assert_eq!(loaded, buffer);

        let mut bytes = Vec::new();
        buffer.write_to(&mut bytes).expect("write bytes");
        assert_eq!(&bytes[4..8], &4i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &3i32.to_le_bytes());
        assert_eq!(bytes.len(), 12 + 3 * 8);
    }

    #[test]
    fn oversized_sample_count_is_a_read_error() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&4i32.to_le_bytes());
        bytes.extend_from_slice(&i32::MAX.to_le_bytes());
        bytes.extend_from_slice(&1.5f64.to_le_bytes());
        assert!(matches!(
            SampleBuffer::read_from(&mut bytes.as_slice()),
            Err(FormatError::Io(_))
        ));
    }

    #[test]
    fn streams_advance_on_their_own_cadence_and_wrap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("slow.bin");
        SampleBuffer {
            samples_per_unit_time: 5,
            samples: vec![10.0, 20.0, 30.0],
        }
        .write_file(&path)
        .expect("write");

        // step 0.1 at 5 samples/unit => one sample every 2 steps
        let listeners: Vec<(usize, Box<dyn SampleSource>)> = vec![
            (0, Box::new(SampleFile { path: path.clone() })),
            (1, Box::new(SampleFile { path: path.clone() })),
        ];
        let mut inputs = InputSet::bind(listeners, 0.1).expect("bind");
        assert_eq!(inputs.inputs().len(), 1, "same file shares one stream");
        assert_eq!(inputs.inputs()[0].cadence(), 2);

        let mut slots = vec![0.0; 2];
        inputs.publish(&mut slots);
        let mut seen = vec![slots[0]];
        for _ in 0..6 {
            inputs.advance(&mut slots);
            assert_eq!(slots[0], slots[1]);
            seen.push(slots[0]);
        }
        assert_eq!(seen, vec![10.0, 10.0, 20.0, 20.0, 30.0, 30.0, 10.0]);

        inputs.rewind();
        inputs.publish(&mut slots);
        assert_eq!(slots[0], 10.0);
    }

    #[test]
    fn missing_sample_file_is_an_error() {
        let source = SampleFile {
            path: PathBuf::from("/nonexistent/odesim/input.bin"),
        };
        let err = source.load().expect_err("missing file");
        assert!(format!("{err:#}").contains("failed to read sample file"));
    }
}
