//! Adapter capability gate.
//!
//! The engine needs compute shaders, indirect draws whose count is read from
//! a GPU buffer, and a per-draw `first_instance` to carry the node slot.
//! Hosts check [`GpuCapabilities::meets_requirements`] before attaching; the
//! engine re-checks and disables itself rather than failing mid-frame.

use wgpu::{DownlevelFlags, Features};

/// Device features the engine requests at device creation.
pub fn required_features() -> Features {
    Features::MULTI_DRAW_INDIRECT_COUNT | Features::INDIRECT_FIRST_INSTANCE
}

/// What an adapter offers, reduced to what the engine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuCapabilities {
    pub compute_shaders: bool,
    pub indirect_execution: bool,
    pub multi_draw_indirect_count: bool,
    pub indirect_first_instance: bool,
    pub max_storage_buffer_binding_size: u32,
}

impl GpuCapabilities {
    pub fn from_adapter(adapter: &wgpu::Adapter) -> Self {
        Self::from_parts(
            adapter.features(),
            adapter.get_downlevel_capabilities().flags,
            &adapter.limits(),
        )
    }

    /// Capabilities of an already created device.
    pub fn from_device(device: &wgpu::Device, adapter: &wgpu::Adapter) -> Self {
        Self::from_parts(
            device.features(),
            adapter.get_downlevel_capabilities().flags,
            &device.limits(),
        )
    }

    pub fn from_parts(features: Features, downlevel: DownlevelFlags, limits: &wgpu::Limits) -> Self {
        Self {
            compute_shaders: downlevel.contains(DownlevelFlags::COMPUTE_SHADERS),
            indirect_execution: downlevel.contains(DownlevelFlags::INDIRECT_EXECUTION),
            multi_draw_indirect_count: features.contains(Features::MULTI_DRAW_INDIRECT_COUNT),
            indirect_first_instance: features.contains(Features::INDIRECT_FIRST_INSTANCE),
            max_storage_buffer_binding_size: limits.max_storage_buffer_binding_size,
        }
    }

    pub fn meets_requirements(&self) -> bool {
        self.missing().is_empty()
    }

    /// Names of the missing capabilities, for logging.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.compute_shaders {
            missing.push("compute shaders");
        }
        if !self.indirect_execution {
            missing.push("indirect execution");
        }
        if !self.multi_draw_indirect_count {
            missing.push("multi_draw_indirect_count");
        }
        if !self.indirect_first_instance {
            missing.push("indirect first instance");
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_support() {
        let caps = GpuCapabilities::from_parts(
            required_features(),
            DownlevelFlags::all(),
            &wgpu::Limits::default(),
        );
        assert!(caps.meets_requirements());
        assert!(caps.missing().is_empty());
    }

    #[test]
    fn test_missing_indirect_count() {
        let caps = GpuCapabilities::from_parts(
            Features::INDIRECT_FIRST_INSTANCE,
            DownlevelFlags::all(),
            &wgpu::Limits::default(),
        );
        assert!(!caps.meets_requirements());
        assert_eq!(caps.missing(), vec!["multi_draw_indirect_count"]);
    }

    #[test]
    fn test_downlevel_without_compute() {
        let caps = GpuCapabilities::from_parts(
            required_features(),
            DownlevelFlags::empty(),
            &wgpu::Limits::downlevel_webgl2_defaults(),
        );
        assert!(!caps.compute_shaders);
        assert!(!caps.indirect_execution);
        assert_eq!(caps.missing().len(), 2);
    }
}
