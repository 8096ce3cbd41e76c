use std::path::Path;

use gltf::image::Format;
use log::{info, warn};

use crate::error::{RendererError, Result};
use crate::scene::Vertex;

pub struct LoadedMesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

/// Tightly packed RGBA8 pixels.
pub struct LoadedTexture {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl LoadedTexture {
    pub fn white() -> Self {
        Self {
            width: 1,
            height: 1,
            rgba: vec![255; 4],
        }
    }
}

pub struct LoadedModel {
    pub mesh: LoadedMesh,
    pub texture: LoadedTexture,
}

pub fn load_model(path: impl AsRef<Path>) -> Result<LoadedModel> {
    let path = path.as_ref();
    let (gltf, buffers, images) = gltf::import(path)?;
    let model = model_from_gltf(path, &gltf, &buffers, &images)?;
    info!(
        "Loaded {}: {} vertices, {} indices, {}x{} texture",
        path.display(),
        model.mesh.vertices.len(),
        model.mesh.indices.len(),
        model.texture.width,
        model.texture.height
    );
    Ok(model)
}

/// Takes the first triangle primitive of the document and its base colour texture.
pub fn model_from_gltf(
    path: &Path,
    gltf: &gltf::Document,
    buffers: &[gltf::buffer::Data],
    images: &[gltf::image::Data],
) -> Result<LoadedModel> {
    let primitive = gltf
        .meshes()
        .flat_map(|mesh| mesh.primitives().collect::<Vec<_>>())
        .find(|primitive| {
            primitive.mode() == gltf::mesh::Mode::Triangles
                && primitive.get(&gltf::Semantic::Positions).is_some()
        })
        .ok_or_else(|| RendererError::MissingMesh(path.to_path_buf()))?;

    let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|v| &v.0[..]));

    let positions = reader
        .read_positions()
        .ok_or_else(|| RendererError::MissingMesh(path.to_path_buf()))?;
    let mut uvs: Box<dyn Iterator<Item = [f32; 2]>> = match reader.read_tex_coords(0) {
        Some(tex_coords) => Box::new(tex_coords.into_f32()),
        None => Box::new(std::iter::repeat([0.0, 0.0])),
    };

    let vertices: Vec<Vertex> = positions
        .map(|position| Vertex {
            position,
            uv: uvs.next().unwrap_or([0.0, 0.0]),
        })
        .collect();

    let indices = match reader.read_indices() {
        Some(indices) => indices.into_u32().collect(),
        None => (0..vertices.len() as u32).collect(),
    };

    let texture = primitive
        .material()
        .pbr_metallic_roughness()
        .base_color_texture()
        .and_then(|info| images.get(info.texture().source().index()))
        .and_then(|image| {
            let rgba = to_rgba8(image.format, &image.pixels);
            if rgba.is_none() {
                warn!("Unsupported texture format {:?}, using white", image.format);
            }
            rgba.map(|rgba| LoadedTexture {
                width: image.width,
                height: image.height,
                rgba,
            })
        })
        .unwrap_or_else(LoadedTexture::white);

    Ok(LoadedModel {
        mesh: LoadedMesh { vertices, indices },
        texture,
    })
}

/// Expands 8 bit images to RGBA. Wider formats are not handled.
pub fn to_rgba8(format: Format, pixels: &[u8]) -> Option<Vec<u8>> {
    let rgba = match format {
        Format::R8G8B8A8 => pixels.to_vec(),
        Format::R8G8B8 => pixels
            .chunks_exact(3)
            .flat_map(|p| [p[0], p[1], p[2], 255])
            .collect(),
        Format::R8G8 => pixels
            .chunks_exact(2)
            .flat_map(|p| [p[0], p[1], 0, 255])
            .collect(),
        Format::R8 => pixels.iter().flat_map(|&p| [p, p, p, 255]).collect(),
        _ => return None,
    };
    Some(rgba)
}

#[cfg(test)]
mod tests {
    use super::*;

    // One triangle: three positions, three uvs, three u32 indices
    const TRIANGLE: &str = r#"{
        "asset": { "version": "2.0" },
        "scene": 0,
        "scenes": [{ "nodes": [0] }],
        "nodes": [{ "mesh": 0 }],
        "meshes": [{
            "primitives": [{
                "attributes": { "POSITION": 0, "TEXCOORD_0": 1 },
                "indices": 2
            }]
        }],
        "buffers": [{
            "byteLength": 72,
            "uri": "data:application/octet-stream;base64,AAAAAAAAAAAAAAAAAACAPwAAAAAAAAAAAAAAAAAAgD8AAAAAAAAAAAAAAAAAAIA/AAAAAAAAAAAAAIA/AAAAAAEAAAACAAAA"
        }],
        "bufferViews": [
            { "buffer": 0, "byteOffset": 0, "byteLength": 36 },
            { "buffer": 0, "byteOffset": 36, "byteLength": 24 },
            { "buffer": 0, "byteOffset": 60, "byteLength": 12 }
        ],
        "accessors": [
            { "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3",
              "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 0.0] },
            { "bufferView": 1, "componentType": 5126, "count": 3, "type": "VEC2" },
            { "bufferView": 2, "componentType": 5125, "count": 3, "type": "SCALAR" }
        ]
    }"#;

    fn load_triangle() -> LoadedModel {
        let (gltf, buffers, images) = gltf::import_slice(TRIANGLE.as_bytes()).unwrap();
        model_from_gltf(Path::new("triangle.gltf"), &gltf, &buffers, &images).unwrap()
    }

    #[test]
    fn reads_positions_uvs_and_indices() {
        let model = load_triangle();
        let vertices = &model.mesh.vertices;

        assert_eq!(vertices.len(), 3);
        assert_eq!(vertices[1].position, [1.0, 0.0, 0.0]);
        assert_eq!(vertices[2].position, [0.0, 1.0, 0.0]);
        assert_eq!(vertices[1].uv, [1.0, 0.0]);
        assert_eq!(model.mesh.indices, vec![0, 1, 2]);
    }

    #[test]
    fn untextured_models_get_a_white_texture() {
        let model = load_triangle();
        assert_eq!((model.texture.width, model.texture.height), (1, 1));
        assert_eq!(model.texture.rgba, vec![255, 255, 255, 255]);
    }

    #[test]
    fn documents_without_meshes_are_rejected() {
        let empty = r#"{ "asset": { "version": "2.0" } }"#;
        let (gltf, buffers, images) = gltf::import_slice(empty.as_bytes()).unwrap();
        let result = model_from_gltf(Path::new("empty.gltf"), &gltf, &buffers, &images);
        assert!(matches!(result, Err(RendererError::MissingMesh(_))));
    }

    #[test]
    fn rgb_pixels_gain_an_opaque_alpha() {
        let rgba = to_rgba8(Format::R8G8B8, &[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(rgba, vec![1, 2, 3, 255, 4, 5, 6, 255]);
    }

    #[test]
    fn grey_pixels_are_spread_over_all_channels() {
        assert_eq!(to_rgba8(Format::R8, &[7]).unwrap(), vec![7, 7, 7, 255]);
        assert!(to_rgba8(Format::R16, &[0, 0]).is_none());
    }
}
