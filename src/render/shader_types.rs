use crevice::std140::AsStd140;
use ultraviolet::Mat4;

/// Uniform of the raster vertex shader.
#[derive(AsStd140)]
pub struct MeshTransforms {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

/// Uniform of the ray generation shader.
#[derive(AsStd140)]
pub struct RayCamera {
    pub view_inverse: Mat4,
    pub proj_inverse: Mat4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrices_are_tightly_packed() {
        assert_eq!(MeshTransforms::std140_size_static(), 3 * 64);
        assert_eq!(RayCamera::std140_size_static(), 2 * 64);
    }
}
