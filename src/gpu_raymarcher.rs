use crate::raymarch::{Camera, Frame, IntensityVolume, RaymarchParams};
use crate::transfer_function::TransferFunction;

use half::f16;
use std::borrow::Cow;
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use web_time::Instant;
use wgpu::{PollType, util::DeviceExt};

const WORKGROUP_SIZE: u32 = 8;

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("No compatible GPU adapter found: {0}")]
    NoAdapter(#[from] wgpu::RequestAdapterError),

    #[error("Failed to request GPU device: {0}")]
    Device(#[from] wgpu::RequestDeviceError),

    #[error("Volume {0:?} exceeds the device 3D texture limit of {1}")]
    TooLarge([u32; 3], u32),

    #[error("GPU allocation failed: {0}")]
    Allocation(String),

    #[error("Failed to map readback buffer: {0}")]
    Map(#[from] wgpu::BufferAsyncError),

    #[error("Readback was cancelled")]
    Cancelled,

    #[error("Raymarcher resources were released")]
    Released,
}

/// Device and queue handed to GPU components.
#[derive(Clone, Debug)]
pub struct WGPU {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl WGPU {
    /// Request a headless device on the default adapter.
    pub async fn request() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await?;
        let info = adapter.get_info();
        debug!(adapter = %info.name, backend = ?info.backend, "GPU adapter selected");
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Raymarch Device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                ..Default::default()
            })
            .await?;
        Ok(Self { device, queue })
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct Uniforms {
    inv_view_proj: [[f32; 4]; 4],
    clip_min: [f32; 4],
    clip_max: [f32; 4],
    light_dir: [f32; 4],
    shading: [f32; 4],
    dims: [u32; 4],
    output_size: [u32; 4],
    limits: [f32; 4],
}

/// Raymarcher running `shaders/raymarch.wgsl` over an `R16Float` 3D texture.
pub struct GpuRaymarcher {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    volume_texture: wgpu::Texture,
    volume_view: wgpu::TextureView,
    transfer_texture: wgpu::Texture,
    transfer_view: wgpu::TextureView,
    transfer_len: u32,
    sampler: wgpu::Sampler,
    dims: [u32; 3],
    step_size: f32,
    released: bool,
}

impl GpuRaymarcher {
    pub async fn new(
        volume: &IntensityVolume,
        transfer: &TransferFunction,
        wgpu: WGPU,
    ) -> Result<Self, GpuError> {
        let WGPU { device, queue } = wgpu;
        let dims = volume.dims();
        let limit = device.limits().max_texture_dimension_3d;
        if dims.iter().any(|&d| d == 0 || d > limit) {
            return Err(GpuError::TooLarge(dims, limit));
        }

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);

        let volume_texture = Self::upload_volume(&device, &queue, volume);
        let volume_view = volume_texture.create_view(&wgpu::TextureViewDescriptor::default());
        let transfer_texture = Self::upload_transfer(&device, &queue, transfer);
        let transfer_view = transfer_texture.create_view(&wgpu::TextureViewDescriptor::default());

        let oom = device.pop_error_scope().await;
        let validation = device.pop_error_scope().await;
        if let Some(error) = oom.or(validation) {
            volume_texture.destroy();
            transfer_texture.destroy();
            return Err(GpuError::Allocation(error.to_string()));
        }

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Raymarch Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Raymarch Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("shaders/raymarch.wgsl"))),
        });

        let float_texture = |binding, view_dimension| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension,
                multisampled: false,
            },
            count: None,
        };
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Raymarch Bind Group Layout"),
            entries: &[
                float_texture(0, wgpu::TextureViewDimension::D3),
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                float_texture(2, wgpu::TextureViewDimension::D2),
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Raymarch Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Raymarch Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        info!(?dims, transfer_samples = transfer.len(), "GPU raymarcher ready");
        Ok(Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            volume_texture,
            volume_view,
            transfer_len: transfer.len() as u32,
            transfer_texture,
            transfer_view,
            sampler,
            dims,
            step_size: volume.step_size(),
            released: false,
        })
    }

    fn upload_volume(device: &wgpu::Device, queue: &wgpu::Queue, volume: &IntensityVolume) -> wgpu::Texture {
        let [width, height, depth] = volume.dims();
        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: depth,
        };
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Volume 3D Texture"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D3,
            format: wgpu::TextureFormat::R16Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        // Logical iteration order is z, y, x: x fastest, as the texture expects.
        let texels: Vec<f16> = volume.data().iter().map(|&v| f16::from_f32(v)).collect();
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(&texels),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * std::mem::size_of::<f16>() as u32),
                rows_per_image: Some(height),
            },
            size,
        );
        texture
    }

    fn upload_transfer(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        transfer: &TransferFunction,
    ) -> wgpu::Texture {
        let width = transfer.len() as u32;
        let size = wgpu::Extent3d {
            width,
            height: 1,
            depth_or_array_layers: 1,
        };
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Transfer Function Texture"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &transfer.to_rgba8(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * width),
                rows_per_image: Some(1),
            },
            size,
        );
        texture
    }

    /// Replace the transfer function texture.
    pub fn set_transfer_function(&mut self, transfer: &TransferFunction) -> Result<(), GpuError> {
        if self.released {
            return Err(GpuError::Released);
        }
        let texture = Self::upload_transfer(&self.device, &self.queue, transfer);
        self.transfer_texture.destroy();
        self.transfer_view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.transfer_texture = texture;
        self.transfer_len = transfer.len() as u32;
        Ok(())
    }

    pub fn dims(&self) -> [u32; 3] {
        self.dims
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Free the volume and transfer textures now instead of on drop.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.volume_texture.destroy();
        self.transfer_texture.destroy();
        self.released = true;
        debug!(dims = ?self.dims, "GPU raymarcher textures released");
    }

    fn uniforms(&self, camera: &Camera, params: &RaymarchParams, width: u32, height: u32) -> Uniforms {
        let inv_view_proj = camera.inverse_view_proj(width as f32 / height as f32);
        let light = params.light();
        let [x, y, z] = self.dims;
        Uniforms {
            inv_view_proj: inv_view_proj.to_cols_array_2d(),
            clip_min: params.clip.min.extend(params.threshold).to_array(),
            clip_max: params.clip.max.extend(params.global_opacity).to_array(),
            light_dir: light.extend(self.step_size).to_array(),
            shading: [
                params.shading.ambient,
                params.shading.diffuse,
                params.shading.specular,
                params.shading.shininess,
            ],
            dims: [x, y, z, params.max_steps],
            output_size: [width, height, params.jitter as u32, 0],
            limits: [
                params.alpha_cutoff,
                params.early_exit_alpha,
                params.gradient_step,
                self.transfer_len as f32,
            ],
        }
    }

    pub async fn render(
        &self,
        camera: &Camera,
        params: &RaymarchParams,
        width: u32,
        height: u32,
    ) -> Result<Frame, GpuError> {
        if self.released {
            return Err(GpuError::Released);
        }
        if width == 0 || height == 0 {
            return Ok(Frame::transparent(width, height));
        }
        let start = Instant::now();

        let uniforms = self.uniforms(camera, params, width, height);
        let uniform_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Raymarch Uniforms"),
                contents: bytemuck::bytes_of(&uniforms),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let output_size = (width as u64) * (height as u64) * std::mem::size_of::<u32>() as u64;
        let output_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Raymarch Output"),
            size: output_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Raymarch Staging"),
            size: output_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Raymarch Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&self.volume_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&self.transfer_view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: output_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: uniform_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Raymarch Encoder"),
            });
        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Raymarch Pass"),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(&self.pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);
            compute_pass.dispatch_workgroups(
                width.div_ceil(WORKGROUP_SIZE),
                height.div_ceil(WORKGROUP_SIZE),
                1,
            );
        }
        encoder.copy_buffer_to_buffer(&output_buffer, 0, &staging_buffer, 0, output_size);
        self.queue.submit(Some(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        if let Err(err) = self.device.poll(PollType::Wait {
            submission_index: None,
            timeout: None,
        }) {
            warn!(%err, "device poll failed");
        }
        receiver.await.map_err(|_| GpuError::Cancelled)??;

        let rgba = {
            let data = buffer_slice.get_mapped_range();
            data.chunks_exact(4)
                .map(|px| [px[0], px[1], px[2], px[3]].map(|c| c as f32 / 255.0))
                .collect()
        };
        staging_buffer.unmap();

        trace!(width, height, elapsed_ms = start.elapsed().as_secs_f64() * 1e3, "gpu raymarch");
        Ok(Frame { width, height, rgba })
    }
}
