//! Software implementations of the host traits, with no GPU behind them.
//!
//! [`HeadlessGpu`] records every compile, upload, binding, and draw so tests
//! (and headless embeddings) can assert on engine behavior: which texture
//! landed on which unit, which uniform values a draw saw, whether a handle
//! was freed twice. [`HeadlessSurface`] hands out contexts, can be scripted
//! to fail acquisition, injects loss/restore events, and implements the
//! clone-and-replace [`recreate`](TargetSurface::recreate) contract by
//! sharing its listener registry and dimensions with the clone while
//! producing a fresh context. [`ManualPump`] queues frame callbacks and
//! fires them on demand.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use crate::context::{
    BufferHandle, ContextApi, ContextEvent, ContextOptions, FramePump, FrameRequest, GpuContext,
    ListenerId, ProgramHandle, ShaderHandle, ShaderStage, TargetSurface, TextureHandle,
    TextureParams, UniformLocation, VertexArrayHandle,
};
use crate::error::AcquireError;

/// A recorded uniform upload value.
#[derive(Debug, Clone, PartialEq)]
pub enum UniformValue {
    /// Float upload.
    Float(Vec<f32>),
    /// Integer upload (went through the transmission buffer).
    Int(Vec<i32>),
}

/// A snapshot of one draw call.
#[derive(Debug, Clone)]
pub struct DrawRecord {
    /// The active program.
    pub program: Option<ProgramHandle>,
    /// Vertices issued.
    pub vertex_count: u32,
    /// Texture-unit bindings at draw time, ordered by unit.
    pub texture_units: Vec<(u32, TextureHandle)>,
    /// Uniform uploads since the previous draw, in upload order.
    pub uniforms: Vec<(UniformLocation, UniformValue)>,
    /// Viewport at draw time.
    pub viewport: (u32, u32),
}

/// A recorded texture upload.
#[derive(Debug, Clone)]
pub struct TextureUpload {
    /// Target texture.
    pub texture: TextureHandle,
    /// Upload width.
    pub width: u32,
    /// Upload height.
    pub height: u32,
    /// Whether pixel data was supplied (as opposed to empty storage).
    pub with_pixels: bool,
    /// Whether a vertical flip was requested.
    pub flip_y: bool,
}

#[derive(Default)]
struct GpuState {
    next_id: u64,
    shaders: HashMap<u64, (ShaderStage, String)>,
    programs: HashMap<u64, (String, String)>,
    live_buffers: HashSet<u64>,
    live_textures: HashSet<u64>,
    live_vaos: HashSet<u64>,
    uniform_locations: HashMap<(u64, String), u64>,
    attribute_locations: HashMap<(u64, String), u32>,
    next_attribute: HashMap<u64, u32>,
    bound_textures: BTreeMap<u32, u64>,
    current_program: Option<u64>,
    pending_uniforms: Vec<(UniformLocation, UniformValue)>,
    texture_uploads: Vec<TextureUpload>,
    draws: Vec<DrawRecord>,
    viewport: (u32, u32),
    double_free: bool,
}

impl GpuState {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// A recording, no-GPU [`GpuContext`].
#[derive(Default)]
pub struct HeadlessGpu {
    state: RefCell<GpuState>,
    fail_compile: Cell<Option<ShaderStage>>,
    fail_link: Cell<bool>,
    lost: Cell<bool>,
    no_vertex_arrays: Cell<bool>,
}

impl HeadlessGpu {
    /// A fresh recording context.
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Script the next compiles of `stage` to fail.
    pub fn fail_compile(&self, stage: ShaderStage) {
        self.fail_compile.set(Some(stage));
    }

    /// Script links to fail.
    pub fn fail_link(&self) {
        self.fail_link.set(true);
    }

    /// Mark the context lost (or recovered).
    pub fn set_lost(&self, lost: bool) {
        self.lost.set(lost);
    }

    /// Disable the vertex-array capability to exercise the per-draw
    /// attribute rebind path.
    pub fn disable_vertex_arrays(&self) {
        self.no_vertex_arrays.set(true);
    }

    /// All recorded draws.
    pub fn draws(&self) -> Vec<DrawRecord> {
        self.state.borrow().draws.clone()
    }

    /// All recorded texture uploads.
    pub fn texture_uploads(&self) -> Vec<TextureUpload> {
        self.state.borrow().texture_uploads.clone()
    }

    /// Sources of the most recently linked program.
    pub fn last_program_sources(&self) -> Option<(String, String)> {
        let state = self.state.borrow();
        let id = state.programs.keys().max()?;
        state.programs.get(id).cloned()
    }

    /// Count of currently live (created, not deleted) GPU objects:
    /// programs, shaders, buffers, textures, vertex arrays.
    pub fn live_objects(&self) -> usize {
        let state = self.state.borrow();
        state.programs.len()
            + state.shaders.len()
            + state.live_buffers.len()
            + state.live_textures.len()
            + state.live_vaos.len()
    }

    /// Whether any handle was deleted more than once (or never existed).
    pub fn double_free_detected(&self) -> bool {
        self.state.borrow().double_free
    }
}

impl GpuContext for HeadlessGpu {
    fn is_lost(&self) -> bool {
        self.lost.get()
    }

    fn supports_vertex_arrays(&self) -> bool {
        !self.no_vertex_arrays.get()
    }

    fn compile_shader(&self, stage: ShaderStage, source: &str) -> Result<ShaderHandle, String> {
        if self.fail_compile.get() == Some(stage) {
            return Err(format!("scripted {stage:?} compile failure"));
        }
        let mut state = self.state.borrow_mut();
        let id = state.next();
        state.shaders.insert(id, (stage, source.to_string()));
        Ok(ShaderHandle(id))
    }

    fn link_program(
        &self,
        vertex: ShaderHandle,
        fragment: ShaderHandle,
    ) -> Result<ProgramHandle, String> {
        if self.fail_link.get() {
            return Err("scripted link failure".into());
        }
        let mut state = self.state.borrow_mut();
        let vertex_src = state
            .shaders
            .get(&vertex.0)
            .map(|(_, src)| src.clone())
            .ok_or("unknown vertex shader")?;
        let fragment_src = state
            .shaders
            .get(&fragment.0)
            .map(|(_, src)| src.clone())
            .ok_or("unknown fragment shader")?;
        let id = state.next();
        state.programs.insert(id, (vertex_src, fragment_src));
        Ok(ProgramHandle(id))
    }

    fn delete_shader(&self, shader: ShaderHandle) {
        let mut state = self.state.borrow_mut();
        if state.shaders.remove(&shader.0).is_none() {
            state.double_free = true;
        }
    }

    fn delete_program(&self, program: ProgramHandle) {
        let mut state = self.state.borrow_mut();
        if state.programs.remove(&program.0).is_none() {
            state.double_free = true;
        }
    }

    fn use_program(&self, program: Option<ProgramHandle>) {
        self.state.borrow_mut().current_program = program.map(|p| p.0);
    }

    fn attribute_location(&self, program: ProgramHandle, name: &str) -> Option<u32> {
        let mut state = self.state.borrow_mut();
        // Resolution mirrors a linker: only names present in the source
        // are active.
        let (vertex_src, _) = state.programs.get(&program.0)?;
        if !vertex_src.contains(name) {
            return None;
        }
        let key = (program.0, name.to_string());
        if let Some(&location) = state.attribute_locations.get(&key) {
            return Some(location);
        }
        let slot = state.next_attribute.entry(program.0).or_insert(0);
        let location = *slot;
        *slot += 1;
        state.attribute_locations.insert(key, location);
        Some(location)
    }

    fn uniform_location(&self, program: ProgramHandle, name: &str) -> Option<UniformLocation> {
        let mut state = self.state.borrow_mut();
        let (vertex_src, fragment_src) = state.programs.get(&program.0)?;
        if !vertex_src.contains(name) && !fragment_src.contains(name) {
            return None;
        }
        let key = (program.0, name.to_string());
        if let Some(&id) = state.uniform_locations.get(&key) {
            return Some(UniformLocation(id));
        }
        let id = state.next();
        state.uniform_locations.insert(key, id);
        Some(UniformLocation(id))
    }

    fn create_buffer(&self) -> BufferHandle {
        let mut state = self.state.borrow_mut();
        let id = state.next();
        state.live_buffers.insert(id);
        BufferHandle(id)
    }

    fn delete_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state.borrow_mut();
        if !state.live_buffers.remove(&buffer.0) {
            state.double_free = true;
        }
    }

    fn upload_vertex_data(&self, _buffer: BufferHandle, _data: &[f32]) {}

    fn bind_attribute(&self, _buffer: BufferHandle, _location: u32, _size: u8) {}

    fn create_vertex_array(&self) -> VertexArrayHandle {
        let mut state = self.state.borrow_mut();
        let id = state.next();
        state.live_vaos.insert(id);
        VertexArrayHandle(id)
    }

    fn delete_vertex_array(&self, vao: VertexArrayHandle) {
        let mut state = self.state.borrow_mut();
        if !state.live_vaos.remove(&vao.0) {
            state.double_free = true;
        }
    }

    fn bind_vertex_array(&self, _vao: Option<VertexArrayHandle>) {}

    fn create_texture(&self, _params: &TextureParams) -> TextureHandle {
        let mut state = self.state.borrow_mut();
        let id = state.next();
        state.live_textures.insert(id);
        TextureHandle(id)
    }

    fn delete_texture(&self, texture: TextureHandle) {
        let mut state = self.state.borrow_mut();
        if !state.live_textures.remove(&texture.0) {
            state.double_free = true;
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
        self.state.borrow_mut().texture_uploads.push(TextureUpload {
            texture,
            width,
            height,
            with_pixels: pixels.is_some(),
            flip_y,
        });
    }

    fn bind_texture(&self, unit: u32, texture: Option<TextureHandle>) {
        let mut state = self.state.borrow_mut();
        match texture {
            Some(texture) => {
                state.bound_textures.insert(unit, texture.0);
            }
            None => {
                state.bound_textures.remove(&unit);
            }
        }
    }

    fn set_uniform_f32(&self, location: &UniformLocation, _arity: u8, data: &[f32]) {
        self.state
            .borrow_mut()
            .pending_uniforms
            .push((*location, UniformValue::Float(data.to_vec())));
    }

    fn set_uniform_i32(&self, location: &UniformLocation, _arity: u8, data: &[i32]) {
        self.state
            .borrow_mut()
            .pending_uniforms
            .push((*location, UniformValue::Int(data.to_vec())));
    }

    fn viewport(&self, width: u32, height: u32) {
        self.state.borrow_mut().viewport = (width, height);
    }

    fn draw_triangles(&self, vertex_count: u32) {
        let mut state = self.state.borrow_mut();
        let record = DrawRecord {
            program: state.current_program.map(ProgramHandle),
            vertex_count,
            texture_units: state
                .bound_textures
                .iter()
                .map(|(&unit, &texture)| (unit, TextureHandle(texture)))
                .collect(),
            uniforms: std::mem::take(&mut state.pending_uniforms),
            viewport: state.viewport,
        };
        state.draws.push(record);
    }
}

struct SurfaceShared {
    gpu: RefCell<Rc<HeadlessGpu>>,
    dimensions: Cell<(u32, u32)>,
    listeners: RefCell<Vec<(ListenerId, Rc<dyn Fn(ContextEvent)>)>>,
    next_listener: Cell<u64>,
    fail_standard: Cell<bool>,
    fail_legacy: Cell<bool>,
    standard_acquires: Cell<u32>,
    legacy_acquires: Cell<u32>,
    recreate_count: Cell<u32>,
    fail_recreates: Cell<u32>,
}

/// A scriptable software [`TargetSurface`].
pub struct HeadlessSurface {
    shared: Rc<SurfaceShared>,
}

impl HeadlessSurface {
    /// A surface with the given dimensions and a fresh context.
    pub fn new(width: u32, height: u32) -> Rc<Self> {
        Rc::new(Self {
            shared: Rc::new(SurfaceShared {
                gpu: RefCell::new(HeadlessGpu::new()),
                dimensions: Cell::new((width, height)),
                listeners: RefCell::new(Vec::new()),
                next_listener: Cell::new(0),
                fail_standard: Cell::new(false),
                fail_legacy: Cell::new(false),
                standard_acquires: Cell::new(0),
                legacy_acquires: Cell::new(0),
                recreate_count: Cell::new(0),
                fail_recreates: Cell::new(0),
            }),
        })
    }

    /// The current context, for inspecting recorded calls.
    pub fn gpu(&self) -> Rc<HeadlessGpu> {
        self.shared.gpu.borrow().clone()
    }

    /// Script acquisition of the standard context name to fail.
    pub fn fail_standard(&self, fail: bool) {
        self.shared.fail_standard.set(fail);
    }

    /// Script acquisition of the legacy-prefixed name to fail.
    pub fn fail_legacy(&self, fail: bool) {
        self.shared.fail_legacy.set(fail);
    }

    /// Script the next `count` recreate calls to fail.
    pub fn fail_recreates(&self, count: u32) {
        self.shared.fail_recreates.set(count);
    }

    /// Number of standard-name acquisition attempts.
    pub fn standard_acquires(&self) -> u32 {
        self.shared.standard_acquires.get()
    }

    /// Number of legacy-name acquisition attempts.
    pub fn legacy_acquires(&self) -> u32 {
        self.shared.legacy_acquires.get()
    }

    /// Number of successful recreates.
    pub fn recreate_count(&self) -> u32 {
        self.shared.recreate_count.get()
    }

    /// Mark the current context lost and fire the loss notification.
    pub fn simulate_loss(&self) {
        self.shared.gpu.borrow().set_lost(true);
        self.fire(ContextEvent::Lost);
    }

    /// Fire the restore notification.
    pub fn simulate_restore(&self) {
        self.fire(ContextEvent::Restored);
    }

    /// Fire a creation-error notification.
    pub fn simulate_creation_error(&self) {
        self.fire(ContextEvent::CreationError);
    }

    fn fire(&self, event: ContextEvent) {
        let listeners: Vec<_> = self
            .shared
            .listeners
            .borrow()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }
}

impl TargetSurface for HeadlessSurface {
    fn acquire_context(
        &self,
        api: ContextApi,
        _options: &ContextOptions,
    ) -> Result<Rc<dyn GpuContext>, AcquireError> {
        let (counter, fail) = match api {
            ContextApi::Standard => (&self.shared.standard_acquires, &self.shared.fail_standard),
            ContextApi::Legacy => (&self.shared.legacy_acquires, &self.shared.fail_legacy),
        };
        counter.set(counter.get() + 1);
        if fail.get() {
            return Err(AcquireError::Unsupported);
        }
        Ok(self.shared.gpu.borrow().clone())
    }

    fn dimensions(&self) -> (u32, u32) {
        self.shared.dimensions.get()
    }

    fn set_dimensions(&self, width: u32, height: u32) {
        self.shared.dimensions.set((width, height));
    }

    fn recreate(&self) -> Result<Rc<dyn TargetSurface>, AcquireError> {
        let pending_failures = self.shared.fail_recreates.get();
        if pending_failures > 0 {
            self.shared.fail_recreates.set(pending_failures - 1);
            return Err(AcquireError::CreationFailed("scripted recreate failure".into()));
        }
        // A clone of the surface carrying no GPU state: listeners and
        // dimensions are shared, the context is fresh.
        *self.shared.gpu.borrow_mut() = HeadlessGpu::new();
        self.shared
            .recreate_count
            .set(self.shared.recreate_count.get() + 1);
        Ok(Rc::new(Self {
            shared: self.shared.clone(),
        }))
    }

    fn add_listener(&self, listener: Rc<dyn Fn(ContextEvent)>) -> ListenerId {
        let id = ListenerId(self.shared.next_listener.get());
        self.shared.next_listener.set(id.0 + 1);
        self.shared.listeners.borrow_mut().push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.shared
            .listeners
            .borrow_mut()
            .retain(|(listener_id, _)| *listener_id != id);
    }
}

type QueuedFrame = (FrameRequest, Box<dyn FnOnce(f64)>);

/// A [`FramePump`] whose frames fire when the test says so.
#[derive(Default)]
pub struct ManualPump {
    queue: RefCell<Vec<QueuedFrame>>,
    next: Cell<u64>,
}

impl ManualPump {
    /// A pump with an empty queue.
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Number of pending frame requests.
    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Fire every currently queued callback once with the given time.
    /// Callbacks re-requesting a frame land in the next batch.
    pub fn fire(&self, time: f64) {
        let batch: Vec<_> = self.queue.borrow_mut().drain(..).collect();
        for (_, callback) in batch {
            callback(time);
        }
    }
}

impl FramePump for ManualPump {
    fn request(&self, callback: Box<dyn FnOnce(f64)>) -> FrameRequest {
        let id = FrameRequest(self.next.get());
        self.next.set(id.0 + 1);
        self.queue.borrow_mut().push((id, callback));
        id
    }

    fn cancel(&self, request: FrameRequest) {
        self.queue.borrow_mut().retain(|(id, _)| *id != request);
    }
}
