use anyhow::{bail, ensure, Context, Result};
use parking_lot::Mutex;
use pipebench_core::{
    Backend, Computation, DType, DeviceRuntime, IOName, ModelArtifact, Shape, StageSpec,
    TensorDesc, TensorSpec,
};
use ort::{
    session::{builder::GraphOptimizationLevel, builder::SessionBuilder, Session, SessionInputValue},
    tensor::TensorElementType,
    value::{DynValue, ValueType},
};
use tracing::debug;

/// Where sessions run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ExecutionTarget {
    Cpu,
    Cuda { device_count: usize },
}

/// ONNX Runtime as a device pool. On the CPU target the pool is a single
/// device and "device memory" is host memory.
pub struct OrtBackend {
    target: ExecutionTarget,
}

impl OrtBackend {
    pub fn new() -> Self {
        Self {
            target: ExecutionTarget::Cpu,
        }
    }

    pub fn cuda(device_count: usize) -> Self {
        Self {
            target: ExecutionTarget::Cuda { device_count },
        }
    }
}

impl Default for OrtBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for OrtBackend {
    type Device = OrtDevice;

    fn name(&self) -> &'static str {
        "onnxruntime"
    }

    fn device_count(&self) -> Result<usize> {
        Ok(match self.target {
            ExecutionTarget::Cpu => 1,
            ExecutionTarget::Cuda { device_count } => device_count,
        })
    }

    fn acquire(&self, device_id: u32) -> Result<Self::Device> {
        let count = self.device_count()?;
        ensure!(
            (device_id as usize) < count,
            "onnxruntime device {device_id} does not exist ({count} available)"
        );
        Ok(OrtDevice {
            device_id,
            target: self.target,
        })
    }
}

pub struct OrtDevice {
    device_id: u32,
    target: ExecutionTarget,
}

pub struct OrtComputation {
    name: String,
    stages: Vec<StageSpec>,
    input_names: Vec<String>,
    session: Mutex<Session>,
}

impl Computation for OrtComputation {
    fn name(&self) -> &str {
        &self.name
    }

    fn stages(&self) -> &[StageSpec] {
        &self.stages
    }
}

/// Host-resident tensor.
pub struct OrtTensor {
    desc: TensorDesc,
    data: Mutex<Vec<u8>>,
}

impl DeviceRuntime for OrtDevice {
    type Computation = OrtComputation;
    type Tensor = OrtTensor;

    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn hardware_class(&self) -> Result<String> {
        Ok(match self.target {
            ExecutionTarget::Cpu => "cpu".to_string(),
            ExecutionTarget::Cuda { .. } => "cuda".to_string(),
        })
    }

    fn load(&self, artifact: &ModelArtifact) -> Result<Self::Computation> {
        let ModelArtifact::OnnxPath(path) = artifact else {
            bail!("onnxruntime backend expects an ONNX file path");
        };

        let builder = Session::builder()
            .context("failed to create ORT session builder")?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .context("failed to configure ORT session builder")?;

        let builder = configure_session_builder(builder, self.target, self.device_id)?;

        let session = builder
            .commit_from_file(path)
            .context("failed to load ONNX model")?;

        let input_names = session
            .inputs
            .iter()
            .map(|input| input.name.clone())
            .collect();
        let stage = build_stage(&session)?;

        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        debug!(device_id = self.device_id, model = %name, "loaded ONNX session");

        Ok(OrtComputation {
            name,
            stages: vec![stage],
            input_names,
            session: Mutex::new(session),
        })
    }

    fn alloc(&self, desc: &TensorDesc) -> Result<Self::Tensor> {
        Ok(OrtTensor {
            desc: desc.clone(),
            data: Mutex::new(vec![0; desc.byte_len()]),
        })
    }

    fn transfer_to_device(&self, dst: &Self::Tensor, src: &[u8]) -> Result<()> {
        let mut data = dst.data.lock();
        ensure!(
            src.len() == data.len(),
            "host buffer is {} bytes, tensor needs {}",
            src.len(),
            data.len()
        );
        data.copy_from_slice(src);
        Ok(())
    }

    fn transfer_from_device(&self, dst: &mut [u8], src: &Self::Tensor) -> Result<()> {
        let data = src.data.lock();
        ensure!(
            dst.len() == data.len(),
            "host buffer is {} bytes, tensor holds {}",
            dst.len(),
            data.len()
        );
        dst.copy_from_slice(&data);
        Ok(())
    }

    fn execute(
        &self,
        computation: &Self::Computation,
        inputs: &[Self::Tensor],
        outputs: &[Self::Tensor],
    ) -> Result<()> {
        ensure!(
            inputs.len() == computation.input_names.len(),
            "expected {} inputs, got {}",
            computation.input_names.len(),
            inputs.len()
        );

        let mut ort_inputs = Vec::with_capacity(inputs.len());
        for (name, input) in computation.input_names.iter().zip(inputs) {
            let value = tensor_to_ort_value(input)?;
            ort_inputs.push((name.clone(), SessionInputValue::from(value)));
        }

        let mut session = computation.session.lock();
        let results = session.run(ort_inputs)?;
        ensure!(
            results.len() == outputs.len(),
            "session produced {} outputs, expected {}",
            results.len(),
            outputs.len()
        );
        for ((_, value), output) in results.iter().zip(outputs) {
            write_ort_value(&value, output)?;
        }
        Ok(())
    }
}

fn build_stage(session: &Session) -> Result<StageSpec> {
    let inputs = session
        .inputs
        .iter()
        .map(|input| tensor_spec_from_value_type(&input.name, &input.input_type))
        .collect::<Result<Vec<_>>>()?;

    let outputs = session
        .outputs
        .iter()
        .map(|output| tensor_spec_from_value_type(&output.name, &output.output_type))
        .collect::<Result<Vec<_>>>()?;

    Ok(StageSpec { inputs, outputs })
}

fn configure_session_builder(
    builder: SessionBuilder,
    target: ExecutionTarget,
    device_id: u32,
) -> Result<SessionBuilder> {
    match target {
        ExecutionTarget::Cpu => Ok(builder),
        ExecutionTarget::Cuda { .. } => configure_cuda(builder, device_id),
    }
}

fn configure_cuda(builder: SessionBuilder, device_id: u32) -> Result<SessionBuilder> {
    #[cfg(feature = "cuda")]
    {
        use ort::execution_providers::cuda::CUDAExecutionProvider;
        let ep = CUDAExecutionProvider::default()
            .with_device_id(device_id as i32)
            .build();
        builder
            .with_execution_providers([ep])
            .context("failed to enable ORT CUDA execution provider")
    }
    #[cfg(not(feature = "cuda"))]
    {
        let _ = (builder, device_id);
        bail!("CUDA requested but pipebench-backend-ort was built without the `cuda` feature")
    }
}

/// Dynamic dimensions are pinned to 1.
fn tensor_spec_from_value_type(name: &str, value_type: &ValueType) -> Result<TensorSpec> {
    let ValueType::Tensor { ty, shape, .. } = value_type else {
        bail!("unsupported non-tensor IO value type for {name}");
    };

    let dtype = ort_tensor_element_to_dtype(*ty)?;
    let dims = shape
        .iter()
        .map(|d| if *d < 0 { 1 } else { *d as usize })
        .collect::<Vec<_>>();

    Ok(TensorSpec {
        name: IOName(name.to_string()),
        dtype,
        shape: Shape::from(dims),
    })
}

fn ort_tensor_element_to_dtype(ty: TensorElementType) -> Result<DType> {
    match ty {
        TensorElementType::Float32 => Ok(DType::F32),
        TensorElementType::Float16 => Ok(DType::F16),
        TensorElementType::Int64 => Ok(DType::I64),
        TensorElementType::Int32 => Ok(DType::I32),
        TensorElementType::Int8 => Ok(DType::I8),
        TensorElementType::Uint8 => Ok(DType::U8),
        _ => bail!("unsupported tensor element type: {ty}"),
    }
}

fn tensor_to_ort_value(tensor: &OrtTensor) -> Result<DynValue> {
    let bytes = tensor.data.lock();
    let shape: Vec<usize> = tensor.desc.shape.dims().to_vec();
    ensure!(
        bytes.len() == tensor.desc.byte_len(),
        "input byte size mismatch: got {}, expected {}",
        bytes.len(),
        tensor.desc.byte_len()
    );

    let value = match tensor.desc.dtype {
        DType::F32 => {
            let data = decode(&bytes, f32::from_le_bytes);
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        DType::I64 => {
            let data = decode(&bytes, i64::from_le_bytes);
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        DType::I32 => {
            let data = decode(&bytes, i32::from_le_bytes);
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        DType::I8 => {
            let data = decode(&bytes, i8::from_le_bytes);
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        DType::U8 => {
            let data = bytes.to_vec();
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        DType::F16 => bail!("f16 inputs are not supported yet"),
    };

    Ok(value)
}

fn write_ort_value(value: &ort::value::ValueRef<'_>, output: &OrtTensor) -> Result<()> {
    let ValueType::Tensor { ty, .. } = value.dtype() else {
        bail!("non-tensor outputs are not supported");
    };

    let mut dst = output.data.lock();
    match *ty {
        TensorElementType::Float32 => {
            let array = value.try_extract_array::<f32>()?;
            let slice = array.as_slice().context("non-contiguous output tensor")?;
            encode(slice, &mut dst, f32::to_le_bytes)
        }
        TensorElementType::Int64 => {
            let array = value.try_extract_array::<i64>()?;
            let slice = array.as_slice().context("non-contiguous output tensor")?;
            encode(slice, &mut dst, i64::to_le_bytes)
        }
        TensorElementType::Int32 => {
            let array = value.try_extract_array::<i32>()?;
            let slice = array.as_slice().context("non-contiguous output tensor")?;
            encode(slice, &mut dst, i32::to_le_bytes)
        }
        TensorElementType::Int8 => {
            let array = value.try_extract_array::<i8>()?;
            let slice = array.as_slice().context("non-contiguous output tensor")?;
            encode(slice, &mut dst, i8::to_le_bytes)
        }
        TensorElementType::Uint8 => {
            let array = value.try_extract_array::<u8>()?;
            let slice = array.as_slice().context("non-contiguous output tensor")?;
            encode(slice, &mut dst, u8::to_le_bytes)
        }
        TensorElementType::Float16 => bail!("f16 outputs are not supported yet"),
        _ => bail!("unsupported output tensor element type: {ty}"),
    }
}

fn decode<T, const N: usize>(bytes: &[u8], from_le: fn([u8; N]) -> T) -> Vec<T> {
    bytes
        .chunks_exact(N)
        .map(|chunk| {
            let mut raw = [0u8; N];
            raw.copy_from_slice(chunk);
            from_le(raw)
        })
        .collect()
}

fn encode<T: Copy, const N: usize>(
    values: &[T],
    dst: &mut [u8],
    to_le: fn(T) -> [u8; N],
) -> Result<()> {
    ensure!(
        values.len() * N == dst.len(),
        "output byte size mismatch: got {}, expected {}",
        values.len() * N,
        dst.len()
    );
    for (chunk, value) in dst.chunks_exact_mut(N).zip(values) {
        chunk.copy_from_slice(&to_le(*value));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_helpers_are_inverse() {
        let values = [1.5f32, -2.0, 0.25];
        let mut bytes = vec![0u8; 12];
        encode(&values, &mut bytes, f32::to_le_bytes).unwrap();
        assert_eq!(decode(&bytes, f32::from_le_bytes), values);
    }

    #[test]
    fn encode_rejects_wrong_length() {
        let mut bytes = vec![0u8; 7];
        let err = encode(&[1i32, 2], &mut bytes, i32::to_le_bytes).unwrap_err();
        assert!(err.to_string().contains("output byte size mismatch"));
    }

    #[test]
    fn cpu_pool_has_one_device() {
        let backend = OrtBackend::new();
        assert_eq!(backend.device_count().unwrap(), 1);
        assert!(backend.acquire(1).is_err());

        let device = backend.acquire(0).unwrap();
        assert_eq!(device.hardware_class().unwrap(), "cpu");
    }

    #[test]
    fn host_tensors_round_trip_bytes() {
        let device = OrtBackend::new().acquire(0).unwrap();
        let tensor = device
            .alloc(&TensorDesc::new(DType::U8, Shape::from_slice(&[2, 2])))
            .unwrap();

        device.transfer_to_device(&tensor, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        device.transfer_from_device(&mut out, &tensor).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(device.transfer_to_device(&tensor, &[1, 2, 3]).is_err());
    }
}
