//! OpenGL backend over [`glow`].
//!
//! Maps the opaque engine handles onto native `glow` objects through interior
//! tables. All GL issuance happens here; every call site is `unsafe` because
//! `glow` forwards raw GL, and safety rests on the host keeping the context
//! current on this thread for the lifetime of the [`GlowContext`].
//!
//! Desktop GL has no unpack-time vertical flip, so flipped uploads reverse
//! the pixel rows on the CPU through a reused scratch buffer.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use glow::{HasContext, PixelUnpackData};
use tracing::error;

use crate::context::{
    BufferHandle, GpuContext, ProgramHandle, ShaderHandle, ShaderStage, TextureHandle,
    TextureParams, UniformLocation, VertexArrayHandle,
};
use crate::types::{TextureFormat, Wrap};

#[derive(Default)]
struct HandleTables {
    next_id: u64,
    programs: HashMap<u64, glow::Program>,
    shaders: HashMap<u64, glow::Shader>,
    buffers: HashMap<u64, glow::Buffer>,
    textures: HashMap<u64, (glow::Texture, TextureParams)>,
    vertex_arrays: HashMap<u64, glow::VertexArray>,
    uniforms: HashMap<u64, glow::UniformLocation>,
    flip_scratch: Vec<u8>,
}

impl HandleTables {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// A [`GpuContext`] issuing calls through a shared [`glow::Context`].
pub struct GlowContext {
    gl: Rc<glow::Context>,
    tables: RefCell<HandleTables>,
    supports_vertex_arrays: bool,
}

impl GlowContext {
    /// Wrap an already-current `glow` context.
    ///
    /// # Safety
    ///
    /// The context must be current on this thread and stay current for every
    /// call made through the returned value.
    #[must_use]
    pub unsafe fn new(gl: Rc<glow::Context>) -> Self {
        // Vertex arrays are core from GL 3.0 / GLES 3.0.
        let supports_vertex_arrays = gl.version().major >= 3;
        Self {
            gl,
            tables: RefCell::new(HandleTables::default()),
            supports_vertex_arrays,
        }
    }

    /// The wrapped `glow` context.
    #[must_use]
    pub fn raw(&self) -> &Rc<glow::Context> {
        &self.gl
    }
}

fn stage_kind(stage: ShaderStage) -> u32 {
    match stage {
        ShaderStage::Vertex => glow::VERTEX_SHADER,
        ShaderStage::Fragment => glow::FRAGMENT_SHADER,
    }
}

/// `(internal format, pixel format, bytes per pixel)` for one engine format.
fn format_info(format: TextureFormat) -> (i32, u32, usize) {
    // GL constant values fit in i32.
    #[allow(clippy::cast_possible_wrap)]
    match format {
        TextureFormat::Rgba => (glow::RGBA as i32, glow::RGBA, 4),
        TextureFormat::Rgb => (glow::RGB as i32, glow::RGB, 3),
        // Desktop core profiles dropped single-channel ALPHA; RED is its
        // modern spelling.
        TextureFormat::Alpha => (glow::R8 as i32, glow::RED, 1),
    }
}

fn wrap_mode(wrap: Wrap) -> i32 {
    #[allow(clippy::cast_possible_wrap)]
    match wrap {
        Wrap::Clamp => glow::CLAMP_TO_EDGE as i32,
        Wrap::Repeat => glow::REPEAT as i32,
        Wrap::Mirror => glow::MIRRORED_REPEAT as i32,
    }
}

impl GpuContext for GlowContext {
    fn is_lost(&self) -> bool {
        // Desktop GL contexts do not report loss through the API; the
        // surface layer delivers loss events instead.
        false
    }

    fn supports_vertex_arrays(&self) -> bool {
        self.supports_vertex_arrays
    }

    fn compile_shader(&self, stage: ShaderStage, source: &str) -> Result<ShaderHandle, String> {
        let gl = &self.gl;
        let shader = unsafe { gl.create_shader(stage_kind(stage)) }?;
        unsafe {
            gl.shader_source(shader, source);
            gl.compile_shader(shader);
        }
        if !unsafe { gl.get_shader_compile_status(shader) } {
            let log = unsafe { gl.get_shader_info_log(shader) };
            unsafe { gl.delete_shader(shader) };
            return Err(log);
        }
        let mut tables = self.tables.borrow_mut();
        let id = tables.next();
        tables.shaders.insert(id, shader);
        Ok(ShaderHandle(id))
    }

    fn link_program(
        &self,
        vertex: ShaderHandle,
        fragment: ShaderHandle,
    ) -> Result<ProgramHandle, String> {
        let gl = &self.gl;
        let (vertex, fragment) = {
            let tables = self.tables.borrow();
            let vertex = tables
                .shaders
                .get(&vertex.0)
                .copied()
                .ok_or("unknown vertex shader handle")?;
            let fragment = tables
                .shaders
                .get(&fragment.0)
                .copied()
                .ok_or("unknown fragment shader handle")?;
            (vertex, fragment)
        };
        let program = unsafe { gl.create_program() }?;
        unsafe {
            gl.attach_shader(program, vertex);
            gl.attach_shader(program, fragment);
            gl.link_program(program);
        }
        if !unsafe { gl.get_program_link_status(program) } {
            let log = unsafe { gl.get_program_info_log(program) };
            unsafe { gl.delete_program(program) };
            return Err(log);
        }
        let mut tables = self.tables.borrow_mut();
        let id = tables.next();
        tables.programs.insert(id, program);
        Ok(ProgramHandle(id))
    }

    fn delete_shader(&self, shader: ShaderHandle) {
        if let Some(shader) = self.tables.borrow_mut().shaders.remove(&shader.0) {
            unsafe { self.gl.delete_shader(shader) };
        }
    }

    fn delete_program(&self, program: ProgramHandle) {
        if let Some(program) = self.tables.borrow_mut().programs.remove(&program.0) {
            unsafe { self.gl.delete_program(program) };
        }
    }

    fn use_program(&self, program: Option<ProgramHandle>) {
        let native = program.and_then(|p| self.tables.borrow().programs.get(&p.0).copied());
        unsafe { self.gl.use_program(native) };
    }

    fn attribute_location(&self, program: ProgramHandle, name: &str) -> Option<u32> {
        let native = self.tables.borrow().programs.get(&program.0).copied()?;
        unsafe { self.gl.get_attrib_location(native, name) }
    }

    fn uniform_location(&self, program: ProgramHandle, name: &str) -> Option<UniformLocation> {
        let native = self.tables.borrow().programs.get(&program.0).copied()?;
        let location = unsafe { self.gl.get_uniform_location(native, name) }?;
        let mut tables = self.tables.borrow_mut();
        let id = tables.next();
        tables.uniforms.insert(id, location);
        Some(UniformLocation(id))
    }

    fn create_buffer(&self) -> BufferHandle {
        match unsafe { self.gl.create_buffer() } {
            Ok(buffer) => {
                let mut tables = self.tables.borrow_mut();
                let id = tables.next();
                tables.buffers.insert(id, buffer);
                BufferHandle(id)
            }
            Err(log) => {
                error!(%log, "buffer creation failed; returning dead handle");
                BufferHandle(0)
            }
        }
    }

    fn delete_buffer(&self, buffer: BufferHandle) {
        if let Some(buffer) = self.tables.borrow_mut().buffers.remove(&buffer.0) {
            unsafe { self.gl.delete_buffer(buffer) };
        }
    }

    fn upload_vertex_data(&self, buffer: BufferHandle, data: &[f32]) {
        let Some(native) = self.tables.borrow().buffers.get(&buffer.0).copied() else {
            return;
        };
        let gl = &self.gl;
        unsafe {
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(native));
            gl.buffer_data_u8_slice(
                glow::ARRAY_BUFFER,
                bytemuck::cast_slice(data),
                glow::STATIC_DRAW,
            );
            gl.bind_buffer(glow::ARRAY_BUFFER, None);
        }
    }

    fn bind_attribute(&self, buffer: BufferHandle, location: u32, size: u8) {
        let Some(native) = self.tables.borrow().buffers.get(&buffer.0).copied() else {
            return;
        };
        let gl = &self.gl;
        unsafe {
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(native));
            gl.enable_vertex_attrib_array(location);
            gl.vertex_attrib_pointer_f32(location, i32::from(size), glow::FLOAT, false, 0, 0);
            gl.bind_buffer(glow::ARRAY_BUFFER, None);
        }
    }

    fn create_vertex_array(&self) -> VertexArrayHandle {
        match unsafe { self.gl.create_vertex_array() } {
            Ok(vao) => {
                let mut tables = self.tables.borrow_mut();
                let id = tables.next();
                tables.vertex_arrays.insert(id, vao);
                VertexArrayHandle(id)
            }
            Err(log) => {
                error!(%log, "vertex array creation failed; returning dead handle");
                VertexArrayHandle(0)
            }
        }
    }

    fn delete_vertex_array(&self, vao: VertexArrayHandle) {
        if let Some(vao) = self.tables.borrow_mut().vertex_arrays.remove(&vao.0) {
            unsafe { self.gl.delete_vertex_array(vao) };
        }
    }

    fn bind_vertex_array(&self, vao: Option<VertexArrayHandle>) {
        let native = vao.and_then(|v| self.tables.borrow().vertex_arrays.get(&v.0).copied());
        unsafe { self.gl.bind_vertex_array(native) };
    }

    fn create_texture(&self, params: &TextureParams) -> TextureHandle {
        let gl = &self.gl;
        match unsafe { gl.create_texture() } {
            Ok(texture) => {
                #[allow(clippy::cast_possible_wrap)]
                unsafe {
                    gl.bind_texture(glow::TEXTURE_2D, Some(texture));
                    gl.tex_parameter_i32(
                        glow::TEXTURE_2D,
                        glow::TEXTURE_MIN_FILTER,
                        glow::LINEAR as i32,
                    );
                    gl.tex_parameter_i32(
                        glow::TEXTURE_2D,
                        glow::TEXTURE_MAG_FILTER,
                        glow::LINEAR as i32,
                    );
                    gl.tex_parameter_i32(
                        glow::TEXTURE_2D,
                        glow::TEXTURE_WRAP_S,
                        wrap_mode(params.wrap_s),
                    );
                    gl.tex_parameter_i32(
                        glow::TEXTURE_2D,
                        glow::TEXTURE_WRAP_T,
                        wrap_mode(params.wrap_t),
                    );
                    gl.bind_texture(glow::TEXTURE_2D, None);
                }
                let mut tables = self.tables.borrow_mut();
                let id = tables.next();
                tables.textures.insert(id, (texture, *params));
                TextureHandle(id)
            }
            Err(log) => {
                error!(%log, "texture creation failed; returning dead handle");
                TextureHandle(0)
            }
        }
    }

    fn delete_texture(&self, texture: TextureHandle) {
        if let Some((texture, _)) = self.tables.borrow_mut().textures.remove(&texture.0) {
            unsafe { self.gl.delete_texture(texture) };
        }
    }

    fn upload_texture(
        &self,
        texture: TextureHandle,
        width: u32,
        height: u32,
        pixels: Option<&[u8]>,
        flip_y: bool,
    ) {
        let mut tables = self.tables.borrow_mut();
        let Some(&(native, params)) = tables.textures.get(&texture.0) else {
            return;
        };
        let (internal, format, bytes_per_pixel) = format_info(params.format);
        let row = width as usize * bytes_per_pixel;

        let mut flipped = None;
        let pixels = match pixels {
            Some(data) if flip_y && height > 1 && row > 0 => {
                let mut scratch = std::mem::take(&mut tables.flip_scratch);
                scratch.clear();
                scratch.reserve(data.len());
                for src_row in data.chunks_exact(row).rev() {
                    scratch.extend_from_slice(src_row);
                }
                Some(flipped.insert(scratch).as_slice())
            }
            other => other,
        };

        let gl = &self.gl;
        #[allow(clippy::cast_possible_wrap)]
        unsafe {
            gl.bind_texture(glow::TEXTURE_2D, Some(native));
            gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);
            gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                internal,
                width as i32,
                height as i32,
                0,
                format,
                glow::UNSIGNED_BYTE,
                PixelUnpackData::Slice(pixels),
            );
            gl.bind_texture(glow::TEXTURE_2D, None);
        }

        if let Some(scratch) = flipped {
            tables.flip_scratch = scratch;
        }
    }

    fn bind_texture(&self, unit: u32, texture: Option<TextureHandle>) {
        let native = texture.and_then(|t| {
            self.tables
                .borrow()
                .textures
                .get(&t.0)
                .map(|&(native, _)| native)
        });
        let gl = &self.gl;
        unsafe {
            gl.active_texture(glow::TEXTURE0 + unit);
            gl.bind_texture(glow::TEXTURE_2D, native);
        }
    }

    fn set_uniform_f32(&self, location: &UniformLocation, arity: u8, data: &[f32]) {
        let Some(native) = self.tables.borrow().uniforms.get(&location.0).cloned() else {
            return;
        };
        let gl = &self.gl;
        unsafe {
            match arity {
                2 => gl.uniform_2_f32_slice(Some(&native), data),
                3 => gl.uniform_3_f32_slice(Some(&native), data),
                4 => gl.uniform_4_f32_slice(Some(&native), data),
                _ => gl.uniform_1_f32_slice(Some(&native), data),
            }
        }
    }

    fn set_uniform_i32(&self, location: &UniformLocation, arity: u8, data: &[i32]) {
        let Some(native) = self.tables.borrow().uniforms.get(&location.0).cloned() else {
            return;
        };
        let gl = &self.gl;
        unsafe {
            match arity {
                2 => gl.uniform_2_i32_slice(Some(&native), data),
                3 => gl.uniform_3_i32_slice(Some(&native), data),
                4 => gl.uniform_4_i32_slice(Some(&native), data),
                _ => gl.uniform_1_i32_slice(Some(&native), data),
            }
        }
    }

    fn viewport(&self, width: u32, height: u32) {
        #[allow(clippy::cast_possible_wrap)]
        unsafe {
            self.gl.viewport(0, 0, width as i32, height as i32);
        }
    }

    fn draw_triangles(&self, vertex_count: u32) {
        #[allow(clippy::cast_possible_wrap)]
        unsafe {
            self.gl.draw_arrays(glow::TRIANGLES, 0, vertex_count as i32);
        }
    }
}
