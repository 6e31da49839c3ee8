use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars by the expression VM.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// A producer of input samples for Variables that are not driven by an expression.
///
/// Implemented by the pseudo-random generators and by versioned sample files.
/// `load` is called once per bind; the resulting buffer is cycled for the
/// lifetime of the binding.
pub trait SampleSource {
    /// Identity of the physical stream. Variables whose sources report the
    /// same key listen to one shared stream.
    fn source_key(&self) -> String;

    /// Reads or generates the full sample buffer.
    fn load(&self) -> anyhow::Result<crate::inputs::SampleBuffer>;
}
