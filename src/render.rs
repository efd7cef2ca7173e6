//! The frame renderer: one draw call per frame, no hot-path allocation
//! beyond what the host API itself requires.
//!
//! Per frame: re-upload live source media (that is the whole point of media
//! mode), activate the program, bind attributes (via the pre-built vertex
//! array when available), upload every uniform's current value, bind the
//! source texture to unit 0 and effect textures to consecutive units from 1
//! in descriptor order, then issue a single triangles draw covering the
//! quad grid.

use std::rc::Rc;

use crate::context::GpuContext;
use crate::program::CompiledProgram;
use crate::types::{Dimensions, MediaHandle, UniformType};

/// Draw one frame. Side-effecting; no return value.
pub(crate) fn draw(
    gpu: &Rc<dyn GpuContext>,
    media: Option<&MediaHandle>,
    compiled: &CompiledProgram,
    dimensions: Dimensions,
) {
    // Live media is re-uploaded unconditionally every call, vertically
    // flipped (the host Y origin disagrees with the rendering surface).
    if let (Some(media), Some(source)) = (media, compiled.source_texture) {
        let frame = media.borrow();
        gpu.bind_texture(0, Some(source));
        gpu.upload_texture(source, frame.width, frame.height, Some(&frame.pixels), true);
    }

    gpu.use_program(Some(compiled.program));

    match compiled.vao {
        Some(vao) => gpu.bind_vertex_array(Some(vao)),
        // No vertex-array capability: re-issue every binding each draw.
        None => {
            for attribute in &compiled.attributes {
                if let Some(location) = attribute.location {
                    gpu.bind_attribute(attribute.buffer, location, attribute.size);
                }
            }
        }
    }

    for uniform in &compiled.uniforms {
        let Some(location) = &uniform.location else {
            continue;
        };
        let data = uniform.data.borrow();
        match uniform.ty {
            UniformType::Float => gpu.set_uniform_f32(location, uniform.arity, &data),
            UniformType::Int => {
                // Copy through the pre-sized integer transmission buffer;
                // uploading float bits as ints would silently corrupt.
                let mut scratch = uniform.int_scratch.borrow_mut();
                scratch.clear();
                #[allow(clippy::cast_possible_truncation)]
                scratch.extend(data.iter().map(|v| *v as i32));
                gpu.set_uniform_i32(location, uniform.arity, &scratch);
            }
        }
    }

    if let Some(source) = compiled.source_texture {
        gpu.bind_texture(0, Some(source));
    }
    for (index, texture) in compiled.textures.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let unit = index as u32 + 1;
        gpu.bind_texture(unit, Some(texture.handle));
        if texture.spec.update {
            if let Some(cell) = &texture.spec.data {
                let pixels = cell.borrow();
                gpu.upload_texture(
                    texture.handle,
                    pixels.width,
                    pixels.height,
                    Some(&pixels.pixels),
                    false,
                );
            }
        }
    }

    gpu.viewport(dimensions.width, dimensions.height);
    gpu.draw_triangles(compiled.vertex_count);

    if compiled.vao.is_some() {
        gpu.bind_vertex_array(None);
    }
}
