//! Render-thread texture realization
//!
//! The loader only produces CPU pixels. Turning them into something the GPU
//! can sample happens here, on the thread that owns the graphics context.

use std::sync::Arc;

use anyhow::ensure;
use image::buffer::ConvertBuffer;
use image::{RgbImage, RgbaImage};

use super::loader::tile_memory_size;
use super::tile::TileKey;

/// Uploads decoded tiles. Implementations are driven from the render thread
/// only, through [`super::TileTextures::realize_texture`].
pub trait TextureRealizer {
    type Texture: Clone;

    /// Upload `image` (bottom row first) and return a handle to it
    fn realize(&mut self, key: &TileKey, image: &RgbImage) -> anyhow::Result<Self::Texture>;

    /// Free a texture whose tile was evicted
    fn release(&mut self, texture: Self::Texture) {
        drop(texture);
    }
}

/// Uploaded tile with GPU resources
pub struct RealizedTile {
    pub key: TileKey,
    pub texture: wgpu::Texture,
    pub texture_view: wgpu::TextureView,
    pub bind_group: wgpu::BindGroup,
    pub memory_size: usize,
}

/// wgpu-backed realizer. Rows arrive bottom-first, so samplers should treat
/// v = 0 as the bottom edge of the tile.
pub struct WgpuRealizer {
    device: wgpu::Device,
    queue: wgpu::Queue,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    uploaded_bytes: usize,
}

impl WgpuRealizer {
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue) -> Self {
        // Bind group layout for texture + sampler
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Tile Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Tile Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        Self {
            device: device.clone(),
            queue: queue.clone(),
            bind_group_layout,
            sampler,
            uploaded_bytes: 0,
        }
    }

    /// Layout the compositor's pipeline must use for tile bind groups
    pub fn bind_group_layout(&self) -> &wgpu::BindGroupLayout {
        &self.bind_group_layout
    }

    /// Bytes currently held by realized textures
    pub fn uploaded_bytes(&self) -> usize {
        self.uploaded_bytes
    }
}

impl TextureRealizer for WgpuRealizer {
    type Texture = Arc<RealizedTile>;

    fn realize(&mut self, key: &TileKey, image: &RgbImage) -> anyhow::Result<Self::Texture> {
        let (width, height) = image.dimensions();
        ensure!(width > 0 && height > 0, "tile {} has an empty image", key);

        // wgpu has no 3-channel format
        let rgba: RgbaImage = image.convert();

        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Map Tile Texture"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8UnormSrgb,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &rgba,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * width),
                rows_per_image: Some(height),
            },
            size,
        );

        let texture_view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Tile Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&texture_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });

        let memory_size = rgba_memory_size(width, height);
        self.uploaded_bytes += memory_size;
        log::debug!("Uploaded tile {} ({} bytes)", key, memory_size);

        Ok(Arc::new(RealizedTile {
            key: *key,
            texture,
            texture_view,
            bind_group,
            memory_size,
        }))
    }

    fn release(&mut self, texture: Self::Texture) {
        self.uploaded_bytes = self.uploaded_bytes.saturating_sub(texture.memory_size);
        log::debug!("Released texture for tile {}", texture.key);
    }
}

/// GPU footprint of an RGBA8 tile
fn rgba_memory_size(width: u32, height: u32) -> usize {
    tile_memory_size(width, height) / 3 * 4
}
