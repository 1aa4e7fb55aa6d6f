use anyhow::Result;

use crate::{ModelArtifact, StageSpec, TensorDesc};

/// Entry point into a device runtime: enumerates and hands out devices.
pub trait Backend: Send + Sync + 'static {
    type Device: DeviceRuntime;

    fn name(&self) -> &'static str;
    fn device_count(&self) -> Result<usize>;

    /// Acquire exclusive use of a device. Dropping the returned handle
    /// releases it.
    fn acquire(&self, device_id: u32) -> Result<Self::Device>;
}

/// An acquired device.
///
/// All calls take `&self`: the loader, executor and storer of one pipeline
/// share the handle from their own threads. Device tensors free their memory
/// when dropped.
pub trait DeviceRuntime: Send + Sync + 'static {
    type Computation: Computation;
    type Tensor: Send + Sync + 'static;

    fn device_id(&self) -> u32;

    /// Chip identifier; every device in one run must report the same value.
    fn hardware_class(&self) -> Result<String>;

    fn load(&self, artifact: &ModelArtifact) -> Result<Self::Computation>;
    fn alloc(&self, desc: &TensorDesc) -> Result<Self::Tensor>;

    fn transfer_to_device(&self, dst: &Self::Tensor, src: &[u8]) -> Result<()>;
    fn transfer_from_device(&self, dst: &mut [u8], src: &Self::Tensor) -> Result<()>;

    /// Synchronous launch. Inputs and outputs are already device resident.
    fn execute(
        &self,
        computation: &Self::Computation,
        inputs: &[Self::Tensor],
        outputs: &[Self::Tensor],
    ) -> Result<()>;
}

pub trait Computation: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Supported shape configurations, in the order the artifact lists them.
    fn stages(&self) -> &[StageSpec];
}
