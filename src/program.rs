//! The GPU program builder: compiles and links merged shader sources,
//! resolves resource binding locations, allocates buffers and textures, and
//! tears the whole set down again.
//!
//! A [`CompiledProgram`] owns GPU handles exclusively. Nothing here is
//! dropped implicitly — the instance controller destroys it explicitly, and
//! leaking one leaks GPU memory.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::warn;

use crate::context::{
    BufferHandle, GpuContext, ProgramHandle, ShaderHandle, ShaderStage, TextureHandle,
    TextureParams, UniformLocation, VertexArrayHandle,
};
use crate::error::ShaderError;
use crate::types::{Dimensions, MergedProgramData, TextureSpec, UniformSpec, UniformType};

/// One attribute's resolved binding: location, backing buffer, and vector
/// width. A `None` location means the linker optimized the attribute out;
/// binding is skipped for it.
pub(crate) struct AttributeBinding {
    pub name: String,
    pub location: Option<u32>,
    pub buffer: BufferHandle,
    pub size: u8,
}

/// One uniform's resolved binding, holding the *live* data cell (not a
/// copy) so per-frame uploads read current values.
pub(crate) struct UniformBinding {
    pub location: Option<UniformLocation>,
    pub ty: UniformType,
    pub arity: u8,
    pub data: Rc<RefCell<Vec<f32>>>,
    /// Integer transmission buffer, sized once at build. Integer uniforms
    /// are copied through this before upload so type fidelity is kept.
    pub int_scratch: RefCell<Vec<i32>>,
}

/// One effect texture's GPU allocation alongside its authoring spec.
pub(crate) struct TextureBinding {
    pub handle: TextureHandle,
    pub spec: TextureSpec,
}

/// A linked program with all resources resolved and allocated.
pub(crate) struct CompiledProgram {
    pub program: ProgramHandle,
    pub vertex_shader: ShaderHandle,
    pub fragment_shader: ShaderHandle,
    /// Pre-built attribute binding set, when the capability exists.
    pub vao: Option<VertexArrayHandle>,
    pub attributes: Vec<AttributeBinding>,
    pub uniforms: Vec<UniformBinding>,
    pub textures: Vec<TextureBinding>,
    /// Dedicated base-media texture (`no_source = false` only).
    pub source_texture: Option<TextureHandle>,
    pub vertex_count: u32,
}

impl From<&TextureSpec> for TextureParams {
    fn from(spec: &TextureSpec) -> Self {
        Self {
            format: spec.format,
            wrap_s: spec.wrap.0,
            wrap_t: spec.wrap.1,
        }
    }
}

/// Compile, link, and bind a merged program.
///
/// Each stage compiles independently; a failure stops the build and reports
/// the offending stage with its full source attached, without attempting a
/// partial link. A link failure releases both shaders (the backend releases
/// its own program object) so nothing leaks on the failure path.
pub(crate) fn build(
    gpu: &Rc<dyn GpuContext>,
    merged: &MergedProgramData,
    vertex_count: u32,
    dimensions: Dimensions,
    no_source: bool,
) -> Result<CompiledProgram, ShaderError> {
    let vertex_shader = gpu
        .compile_shader(ShaderStage::Vertex, &merged.vertex_source)
        .map_err(|log| ShaderError::Compile {
            stage: ShaderStage::Vertex,
            log,
            shader_source: merged.vertex_source.clone(),
        })?;

    let fragment_shader = match gpu.compile_shader(ShaderStage::Fragment, &merged.fragment_source)
    {
        Ok(shader) => shader,
        Err(log) => {
            gpu.delete_shader(vertex_shader);
            return Err(ShaderError::Compile {
                stage: ShaderStage::Fragment,
                log,
                shader_source: merged.fragment_source.clone(),
            });
        }
    };

    let program = match gpu.link_program(vertex_shader, fragment_shader) {
        Ok(program) => program,
        Err(log) => {
            gpu.delete_shader(vertex_shader);
            gpu.delete_shader(fragment_shader);
            return Err(ShaderError::Link { log });
        }
    };

    let attributes: Vec<AttributeBinding> = merged
        .attributes
        .iter()
        .map(|attr| {
            let location = gpu.attribute_location(program, &attr.name);
            if location.is_none() {
                warn!(name = %attr.name, "attribute not active in linked program; skipping");
            }
            let buffer = gpu.create_buffer();
            gpu.upload_vertex_data(buffer, &attr.data);
            AttributeBinding {
                name: attr.name.clone(),
                location,
                buffer,
                size: attr.size,
            }
        })
        .collect();

    // Capability-conditional fast path: bake the attribute bindings into a
    // vertex array once and reuse it every draw.
    let vao = gpu.supports_vertex_arrays().then(|| {
        let vao = gpu.create_vertex_array();
        gpu.bind_vertex_array(Some(vao));
        for attr in &attributes {
            if let Some(location) = attr.location {
                gpu.bind_attribute(attr.buffer, location, attr.size);
            }
        }
        gpu.bind_vertex_array(None);
        vao
    });

    let uniforms = merged
        .uniforms
        .iter()
        .map(|uniform| bind_uniform(gpu, program, uniform))
        .collect();

    let textures = merged
        .textures
        .iter()
        .map(|spec| {
            let handle = gpu.create_texture(&TextureParams::from(spec));
            upload_spec_texture(gpu, handle, spec, dimensions);
            TextureBinding {
                handle,
                spec: spec.clone(),
            }
        })
        .collect();

    let source_texture = (!no_source).then(|| {
        let handle = gpu.create_texture(&TextureParams {
            format: crate::types::TextureFormat::Rgba,
            wrap_s: crate::types::Wrap::Clamp,
            wrap_t: crate::types::Wrap::Clamp,
        });
        gpu.upload_texture(handle, dimensions.width, dimensions.height, None, false);
        handle
    });

    Ok(CompiledProgram {
        program,
        vertex_shader,
        fragment_shader,
        vao,
        attributes,
        uniforms,
        textures,
        source_texture,
        vertex_count,
    })
}

fn bind_uniform(
    gpu: &Rc<dyn GpuContext>,
    program: ProgramHandle,
    uniform: &UniformSpec,
) -> UniformBinding {
    let location = gpu.uniform_location(program, &uniform.name);
    if location.is_none() {
        warn!(name = %uniform.name, "uniform not active in linked program; skipping");
    }
    let int_scratch = match uniform.ty {
        UniformType::Int => RefCell::new(vec![0; uniform.data.borrow().len()]),
        UniformType::Float => RefCell::new(Vec::new()),
    };
    UniformBinding {
        location,
        ty: uniform.ty,
        arity: uniform.arity(),
        data: uniform.data.clone(),
        int_scratch,
    }
}

/// Upload a texture spec's pixels, or allocate empty storage sized to the
/// current target dimensions when the spec carries no data.
fn upload_spec_texture(
    gpu: &Rc<dyn GpuContext>,
    handle: TextureHandle,
    spec: &TextureSpec,
    dimensions: Dimensions,
) {
    match &spec.data {
        Some(cell) => {
            let pixels = cell.borrow();
            gpu.upload_texture(
                handle,
                pixels.width,
                pixels.height,
                Some(&pixels.pixels),
                false,
            );
        }
        None => gpu.upload_texture(handle, dimensions.width, dimensions.height, None, false),
    }
}

/// Re-allocate every effect texture for the current target dimensions.
/// Specs with their own data re-upload it; data-less specs get fresh empty
/// storage at the new size.
pub(crate) fn resize_textures(
    gpu: &Rc<dyn GpuContext>,
    compiled: &CompiledProgram,
    dimensions: Dimensions,
) {
    for texture in &compiled.textures {
        upload_spec_texture(gpu, texture.handle, &texture.spec, dimensions);
    }
    if let Some(source) = compiled.source_texture {
        gpu.upload_texture(source, dimensions.width, dimensions.height, None, false);
    }
}

/// Release every GPU handle owned by a compiled program: program, shaders,
/// buffers, textures, and the vertex array if one was built.
pub(crate) fn destroy(gpu: &Rc<dyn GpuContext>, compiled: CompiledProgram) {
    if let Some(vao) = compiled.vao {
        gpu.delete_vertex_array(vao);
    }
    for attribute in &compiled.attributes {
        gpu.delete_buffer(attribute.buffer);
    }
    for texture in &compiled.textures {
        gpu.delete_texture(texture.handle);
    }
    if let Some(source) = compiled.source_texture {
        gpu.delete_texture(source);
    }
    gpu.delete_program(compiled.program);
    gpu.delete_shader(compiled.vertex_shader);
    gpu.delete_shader(compiled.fragment_shader);
}
