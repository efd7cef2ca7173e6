//! Host abstraction: the narrow GPU, surface, and frame-callback interfaces
//! the engine is written against.
//!
//! The engine itself never issues a raw GL call. It talks to
//! [`GpuContext`] (the GPU API), [`TargetSurface`] (a drawable surface that
//! hands out contexts and delivers lifecycle events), and [`FramePump`] (the
//! host's request/cancel frame-callback primitive). The `glow` backend
//! implements [`GpuContext`] over OpenGL; [`crate::headless`] implements all
//! three without a GPU for tests and headless embeddings.

use std::rc::Rc;

use crate::error::AcquireError;
use crate::types::{TextureFormat, Wrap};

/// A shader stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    /// The vertex stage.
    Vertex,
    /// The fragment stage.
    Fragment,
}

/// Which context-acquisition name to try on a surface.
///
/// Some hosts only expose the GPU context under a legacy-prefixed name. The
/// engine falls back from [`Standard`](ContextApi::Standard) to
/// [`Legacy`](ContextApi::Legacy) until the standard name has ever succeeded,
/// after which the fallback is never attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextApi {
    /// The primary, non-prefixed acquisition name.
    Standard,
    /// The legacy-prefixed acquisition name.
    Legacy,
}

/// Context-creation hints passed to [`TargetSurface::acquire_context`].
///
/// Effects never need 3D depth testing, so everything defaults to off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextOptions {
    /// Keep the backbuffer contents between frames.
    pub preserve_drawing_buffer: bool,
    /// Allocate a depth buffer.
    pub depth: bool,
    /// Allocate a stencil buffer.
    pub stencil: bool,
    /// Enable multisample antialiasing.
    pub antialias: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            preserve_drawing_buffer: false,
            depth: false,
            stencil: false,
            antialias: false,
        }
    }
}

/// A single-fire context lifecycle notification from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextEvent {
    /// The GPU context was invalidated by the host.
    Lost,
    /// The host signalled that a fresh context can be acquired.
    Restored,
    /// The host reported an error while creating a context.
    CreationError,
}

macro_rules! handle_newtype {
    ($(#[$doc:meta] $name:ident),* $(,)?) => {
        $(
            #[$doc]
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct $name(pub u64);
        )*
    };
}

handle_newtype! {
    /// Opaque handle to a linked GPU program.
    ProgramHandle,
    /// Opaque handle to a compiled shader stage.
    ShaderHandle,
    /// Opaque handle to a GPU vertex buffer.
    BufferHandle,
    /// Opaque handle to a GPU texture.
    TextureHandle,
    /// Opaque handle to a vertex-array binding set.
    VertexArrayHandle,
    /// Opaque resolved uniform location.
    UniformLocation,
    /// Identifier for a registered surface lifecycle listener.
    ListenerId,
    /// Identifier for a pending frame-callback request.
    FrameRequest,
}

/// Allocation parameters for one GPU texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureParams {
    /// Pixel format.
    pub format: TextureFormat,
    /// Wrap mode along the horizontal axis.
    pub wrap_s: Wrap,
    /// Wrap mode along the vertical axis.
    pub wrap_t: Wrap,
}

/// The GPU API surface used by the program builder and frame renderer.
///
/// Object-safe and handle-based so that backends can map handles onto their
/// native object types and tests can record every call. All methods take
/// `&self`; backends use interior mutability. Single-threaded by design.
pub trait GpuContext {
    /// Whether the host currently reports this context as lost.
    fn is_lost(&self) -> bool;

    /// Whether vertex-array binding sets are available. When they are not,
    /// attribute bindings are re-issued before every draw call.
    fn supports_vertex_arrays(&self) -> bool;

    /// Compile one shader stage. `Err` carries the raw compiler log.
    fn compile_shader(&self, stage: ShaderStage, source: &str) -> Result<ShaderHandle, String>;

    /// Link a vertex and fragment shader into a program. On failure the
    /// backend releases its own program object before returning the raw
    /// linker log; the caller is responsible for the two shaders.
    fn link_program(
        &self,
        vertex: ShaderHandle,
        fragment: ShaderHandle,
    ) -> Result<ProgramHandle, String>;

    /// Release a compiled shader.
    fn delete_shader(&self, shader: ShaderHandle);

    /// Release a linked program.
    fn delete_program(&self, program: ProgramHandle);

    /// Activate a program for drawing, or deactivate with `None`.
    fn use_program(&self, program: Option<ProgramHandle>);

    /// Resolve an attribute binding location by name.
    fn attribute_location(&self, program: ProgramHandle, name: &str) -> Option<u32>;

    /// Resolve a uniform location by name.
    fn uniform_location(&self, program: ProgramHandle, name: &str) -> Option<UniformLocation>;

    /// Create a vertex buffer.
    fn create_buffer(&self) -> BufferHandle;

    /// Release a vertex buffer.
    fn delete_buffer(&self, buffer: BufferHandle);

    /// Upload static vertex data to a buffer.
    fn upload_vertex_data(&self, buffer: BufferHandle, data: &[f32]);

    /// Point an attribute location at a buffer and enable it.
    fn bind_attribute(&self, buffer: BufferHandle, location: u32, size: u8);

    /// Create a vertex-array binding set. Only called when
    /// [`supports_vertex_arrays`](Self::supports_vertex_arrays) is true.
    fn create_vertex_array(&self) -> VertexArrayHandle;

    /// Release a vertex-array binding set.
    fn delete_vertex_array(&self, vao: VertexArrayHandle);

    /// Bind a vertex-array binding set, or unbind with `None`.
    fn bind_vertex_array(&self, vao: Option<VertexArrayHandle>);

    /// Allocate a texture with the given sampling parameters.
    fn create_texture(&self, params: &TextureParams) -> TextureHandle;

    /// Release a texture.
    fn delete_texture(&self, texture: TextureHandle);

    /// Upload pixel data to a texture, or allocate empty storage when
    /// `pixels` is `None`. `flip_y` requests a vertical flip at upload time
    /// (host coordinate systems disagree on the Y origin).
    fn upload_texture(
        &self,
        texture: TextureHandle,
        width: u32,
        height: u32,
        pixels: Option<&[u8]>,
        flip_y: bool,
    );

    /// Bind a texture to the given texture unit, or unbind with `None`.
    fn bind_texture(&self, unit: u32, texture: Option<TextureHandle>);

    /// Upload a float uniform. `arity` is 1–4 and selects the vector width.
    fn set_uniform_f32(&self, location: &UniformLocation, arity: u8, data: &[f32]);

    /// Upload an integer uniform. `arity` is 1–4 and selects the vector
    /// width.
    fn set_uniform_i32(&self, location: &UniformLocation, arity: u8, data: &[i32]);

    /// Set the viewport to cover `width × height` pixels.
    fn viewport(&self, width: u32, height: u32);

    /// Draw `vertex_count` vertices as independent triangles.
    fn draw_triangles(&self, vertex_count: u32);
}

/// A 2D-drawable rendering surface supplied by the host.
///
/// Hands out GPU contexts, reports and adjusts its pixel dimensions,
/// delivers context lifecycle events, and supports the clone-and-replace
/// recovery step: [`recreate`](Self::recreate) must return an equivalent
/// surface carrying no GPU state, suitable for a clean re-acquisition.
pub trait TargetSurface {
    /// Obtain a GPU context under the given acquisition name.
    fn acquire_context(
        &self,
        api: ContextApi,
        options: &ContextOptions,
    ) -> Result<Rc<dyn GpuContext>, AcquireError>;

    /// Current surface dimensions in pixels.
    fn dimensions(&self) -> (u32, u32);

    /// Resize the surface.
    fn set_dimensions(&self, width: u32, height: u32);

    /// Replace this surface with a fresh clone of itself carrying no GPU
    /// state. Lifecycle listeners registered on the old surface must keep
    /// firing on the clone.
    fn recreate(&self) -> Result<Rc<dyn TargetSurface>, AcquireError>;

    /// Register a context lifecycle listener.
    fn add_listener(&self, listener: Rc<dyn Fn(ContextEvent)>) -> ListenerId;

    /// Remove a previously registered listener. Unknown ids are ignored.
    fn remove_listener(&self, id: ListenerId);
}

/// The host's frame-callback primitive: request a callback once before the
/// next repaint, or cancel a pending request.
///
/// The engine treats this as an opaque scheduling primitive. "Suspension" is
/// represented entirely by waiting for the next frame callback; nothing
/// blocks.
pub trait FramePump {
    /// Schedule `callback` to fire once before the next repaint, passing the
    /// current time in milliseconds.
    fn request(&self, callback: Box<dyn FnOnce(f64)>) -> FrameRequest;

    /// Cancel a pending request. Unknown ids are ignored.
    fn cancel(&self, request: FrameRequest);
}
