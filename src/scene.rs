mod mesh;
mod texture;
mod vertex;

pub use mesh::*;
pub use texture::*;
pub use vertex::*;

/// Everything both surfaces draw, already on the GPU.
pub struct Scene {
    pub mesh: Mesh,
    pub texture: Texture,
}
