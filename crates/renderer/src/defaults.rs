//! Default resources shared by every pass.

use tracing::debug;

use lumen_rhi::{
    BufferHandle, BufferKind, Device, Format, RhiResult, TextureHandle, TextureSettings,
    VertexFormat, VertexLayout,
};

/// Clip-space positions of a triangle that covers the whole viewport.
pub const FULLSCREEN_TRIANGLE: [[f32; 2]; 3] = [[-1.0, -1.0], [3.0, -1.0], [-1.0, 3.0]];

/// Fallback textures and geometry, created once per engine and passed to
/// the pass-construction callback.
#[derive(Debug, Clone, Copy)]
pub struct EngineDefaults {
    /// 1x1 opaque white.
    pub white: TextureHandle,
    /// 1x1 opaque black.
    pub black: TextureHandle,
    /// 1x1 tangent-space normal pointing straight out of the surface.
    pub flat_normal: TextureHandle,
    /// [`FULLSCREEN_TRIANGLE`] as a vertex buffer.
    pub fullscreen_triangle: BufferHandle,
}

impl EngineDefaults {
    /// Creates and uploads the default resources.
    ///
    /// # Errors
    ///
    /// Returns an error if a resource cannot be created or uploaded.
    pub fn new(device: &mut Device) -> RhiResult<Self> {
        let white = solid(device, [255, 255, 255, 255])?;
        let black = solid(device, [0, 0, 0, 255])?;
        let flat_normal = solid(device, [128, 128, 255, 255])?;

        let size = std::mem::size_of_val(&FULLSCREEN_TRIANGLE) as u64;
        let fullscreen_triangle = device.create_buffer(BufferKind::Vertex, size)?;
        device.upload_slice(fullscreen_triangle, 0, &FULLSCREEN_TRIANGLE)?;

        debug!("Engine defaults created");
        Ok(Self {
            white,
            black,
            flat_normal,
            fullscreen_triangle,
        })
    }

    /// Vertex layout matching [`fullscreen_triangle`](Self::fullscreen_triangle).
    pub fn fullscreen_layout() -> VertexLayout {
        VertexLayout::packed(&[(0, VertexFormat::Float2)])
    }

    /// Releases the default resources.
    pub fn destroy(self, device: &mut Device) {
        device.destroy_texture(self.white);
        device.destroy_texture(self.black);
        device.destroy_texture(self.flat_normal);
        device.destroy_buffer(self.fullscreen_triangle);
    }
}

fn solid(device: &mut Device, texel: [u8; 4]) -> RhiResult<TextureHandle> {
    let texture = device.create_texture(TextureSettings::render_target(1, 1, Format::Rgba8Unorm))?;
    device.upload_texture(texture, &texel)?;
    Ok(texture)
}
