//! Device and readback helpers for GPU tests. Tests return early when no
//! adapter is available.

/// Create a test GPU device and queue. Returns `None` if no GPU is available.
pub(crate) fn test_device() -> Option<(wgpu::Device, wgpu::Queue)> {
    pollster::block_on(async {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::default(),
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok()?;

        let downlevel = adapter.get_downlevel_capabilities().flags;
        if !downlevel.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS) {
            return None;
        }

        adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("voxlod_test_device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::default(),
                experimental_features: Default::default(),
                ..Default::default()
            })
            .await
            .ok()
    })
}

/// Copy `len` bytes of `buffer` starting at `offset` back to the CPU.
pub(crate) fn read_back(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    buffer: &wgpu::Buffer,
    offset: u64,
    len: u64,
) -> Vec<u8> {
    match crate::readback::read_buffer_blocking(device, queue, buffer, offset, len) {
        Ok(bytes) => bytes,
        Err(err) => panic!("readback failed: {err}"),
    }
}
