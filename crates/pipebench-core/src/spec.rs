use serde::{Deserialize, Serialize};

use crate::{DType, Shape, TensorDesc};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IOName(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: IOName,
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(name: &str, dtype: DType, dims: &[usize]) -> Self {
        Self {
            name: IOName(name.to_string()),
            dtype,
            shape: Shape::from_slice(dims),
        }
    }

    pub fn desc(&self) -> TensorDesc {
        TensorDesc::new(self.dtype, self.shape.clone())
    }

    pub fn byte_len(&self) -> usize {
        self.shape.numel() * self.dtype.byte_size()
    }
}

/// One precompiled shape configuration of a computation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

impl StageSpec {
    /// Batch size served by this stage: dim 0 of the first input.
    pub fn batch(&self) -> Option<usize> {
        self.inputs.first().and_then(|input| input.shape.batch())
    }

    pub fn largest_input(&self) -> usize {
        self.inputs.iter().map(TensorSpec::byte_len).max().unwrap_or(0)
    }

    pub fn largest_output(&self) -> usize {
        self.outputs.iter().map(TensorSpec::byte_len).max().unwrap_or(0)
    }
}
