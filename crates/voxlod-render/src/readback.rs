//! GPU → CPU buffer readback.
//!
//! [`AsyncReadback`] copies into a staging buffer, maps it, and is polled on
//! later frames, so the render thread never waits on the GPU. A blocking
//! variant exists for tests and shutdown paths.

use crossbeam_channel::{Receiver, TryRecvError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReadbackError {
    #[error("buffer mapping failed: {0}")]
    Map(#[from] wgpu::BufferAsyncError),
    #[error("device poll failed: {0}")]
    Poll(#[from] wgpu::PollError),
    #[error("map callback dropped without a result")]
    Disconnected,
    #[error("readback range {offset}+{len} is not 4-byte aligned")]
    Unaligned { offset: u64, len: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadbackState {
    Idle,
    /// A copy was recorded; waiting for the submit.
    Copied,
    /// `map_async` is in flight.
    Mapping,
}

/// A reusable staging buffer cycling through copy → map → read.
pub struct AsyncReadback {
    staging: wgpu::Buffer,
    size: u64,
    state: ReadbackState,
    pending: Option<Receiver<Result<(), wgpu::BufferAsyncError>>>,
}

impl AsyncReadback {
    pub fn new(device: &wgpu::Device, label: &str, size: u64) -> Self {
        let size = size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT).max(wgpu::COPY_BUFFER_ALIGNMENT);
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            staging,
            size,
            state: ReadbackState::Idle,
            pending: None,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_idle(&self) -> bool {
        self.state == ReadbackState::Idle
    }

    /// Record a copy of `self.size()` bytes from `src` at `offset`. Returns
    /// `false` (and records nothing) while a previous readback is pending.
    pub fn record_copy(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        src: &wgpu::Buffer,
        offset: u64,
    ) -> bool {
        if self.state != ReadbackState::Idle {
            return false;
        }
        encoder.copy_buffer_to_buffer(src, offset, &self.staging, 0, self.size);
        self.state = ReadbackState::Copied;
        true
    }

    /// Start mapping. Call once the encoder holding the copy is submitted.
    pub fn request_map(&mut self) {
        if self.state != ReadbackState::Copied {
            return;
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });
        self.pending = Some(rx);
        self.state = ReadbackState::Mapping;
    }

    /// Poll the device without blocking. Returns the bytes once the map has
    /// completed, `None` while it is still in flight.
    pub fn try_read(&mut self, device: &wgpu::Device) -> Result<Option<Vec<u8>>, ReadbackError> {
        if self.state != ReadbackState::Mapping {
            return Ok(None);
        }
        device.poll(wgpu::PollType::Poll)?;
        let Some(rx) = &self.pending else {
            self.state = ReadbackState::Idle;
            return Err(ReadbackError::Disconnected);
        };
        let result = match rx.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return Ok(None),
            Err(TryRecvError::Disconnected) => {
                self.reset();
                return Err(ReadbackError::Disconnected);
            }
        };
        self.pending = None;
        self.state = ReadbackState::Idle;
        result?;
        let bytes = self.staging.slice(..).get_mapped_range().to_vec();
        self.staging.unmap();
        Ok(Some(bytes))
    }

    /// Forget an in-flight readback, e.g. after a device loss.
    pub fn reset(&mut self) {
        if self.state == ReadbackState::Mapping {
            self.staging.unmap();
        }
        self.pending = None;
        self.state = ReadbackState::Idle;
    }
}

/// Copy `len` bytes of `src` starting at `offset` to the CPU, waiting for
/// the GPU.
pub fn read_buffer_blocking(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    src: &wgpu::Buffer,
    offset: u64,
    len: u64,
) -> Result<Vec<u8>, ReadbackError> {
    if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 || len % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
        return Err(ReadbackError::Unaligned { offset, len });
    }
    if len == 0 {
        return Ok(Vec::new());
    }
    let mut readback = AsyncReadback::new(device, "lod_blocking_readback", len);
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("lod_blocking_readback"),
    });
    readback.record_copy(&mut encoder, src, offset);
    queue.submit(std::iter::once(encoder.finish()));
    readback.request_map();
    device.poll(wgpu::PollType::Wait {
        submission_index: None,
        timeout: None,
    })?;
    loop {
        if let Some(bytes) = readback.try_read(device)? {
            return Ok(bytes);
        }
    }
}
