//! The effect data model: shader fragments, resource specs, descriptors,
//! media handles, and quad-grid geometry.
//!
//! Resource `data` cells are shared by reference (`Rc`) between the authoring
//! [`EffectDescriptor`] and the compiled program's uniform table, so mutating
//! a value through an [`EffectHandle`] is visible on the very next draw with
//! no synchronization needed (the engine is single-threaded).

use std::cell::RefCell;
use std::rc::Rc;

/// The transmission type of a uniform value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniformType {
    /// Uploaded through an integer-typed transmission buffer.
    Int,
    /// Uploaded as floats.
    Float,
}

/// A named, typed uniform backed by a shared, mutable data cell.
///
/// The index position in the merged uniform array is the only way the owning
/// effect's accessors reach the live data, so the merge clones the `Rc` and
/// never the data. Arity (vector width, 1–4) is the data length.
#[derive(Debug, Clone)]
pub struct UniformSpec {
    /// GLSL uniform name. Authors must namespace names (e.g. `u_<effect>`)
    /// to avoid collisions; two effects using the same name with different
    /// types is undefined behavior and is deliberately not validated.
    pub name: String,
    /// Transmission type.
    pub ty: UniformType,
    /// Live value, fixed-length, mutated in place between frames.
    pub data: Rc<RefCell<Vec<f32>>>,
}

impl UniformSpec {
    /// A float uniform with the given initial value.
    pub fn float(name: impl Into<String>, data: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            ty: UniformType::Float,
            data: Rc::new(RefCell::new(data)),
        }
    }

    /// An integer uniform with the given initial value.
    pub fn int(name: impl Into<String>, data: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            ty: UniformType::Int,
            data: Rc::new(RefCell::new(data)),
        }
    }

    /// Overwrite the live value in place. Extra input values are ignored;
    /// the stored length never changes.
    pub fn set(&self, values: &[f32]) {
        let mut data = self.data.borrow_mut();
        for (slot, value) in data.iter_mut().zip(values.iter()) {
            *slot = *value;
        }
    }

    /// Vector width for upload, clamped to the 1–4 GLSL scalar/vector range.
    pub fn arity(&self) -> u8 {
        let len = self.data.borrow().len();
        u8::try_from(len.clamp(1, 4)).unwrap_or(4)
    }
}

/// Pixel format of an effect texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    /// Four channels.
    Rgba,
    /// Three channels.
    Rgb,
    /// Single channel.
    Alpha,
}

/// Texture wrap mode per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrap {
    /// Clamp to edge.
    Clamp,
    /// Repeat.
    Repeat,
    /// Mirrored repeat.
    Mirror,
}

/// Owned pixel data for an effect texture.
#[derive(Debug, Clone)]
pub struct TexturePixels {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Raw pixel bytes in the spec's [`TextureFormat`].
    pub pixels: Vec<u8>,
}

/// An effect-owned auxiliary texture.
///
/// With `data` present the pixels are uploaded at creation; without, empty
/// storage is allocated sized to the current target dimensions. `update`
/// marks dynamic media that must be re-uploaded every draw.
#[derive(Debug, Clone)]
pub struct TextureSpec {
    /// Pixel format.
    pub format: TextureFormat,
    /// Shared pixel data, if any.
    pub data: Option<Rc<RefCell<TexturePixels>>>,
    /// Re-upload the current `data` on every draw call.
    pub update: bool,
    /// Wrap mode along (s, t).
    pub wrap: (Wrap, Wrap),
}

impl Default for TextureSpec {
    fn default() -> Self {
        Self {
            format: TextureFormat::Rgba,
            data: None,
            update: false,
            wrap: (Wrap::Clamp, Wrap::Clamp),
        }
    }
}

/// Definition of one vertex attribute: either full data or a reference to
/// another attribute whose data/size it borrows.
#[derive(Clone)]
pub enum AttributeDef {
    /// Per-vertex float data and the component count per vertex.
    Data {
        /// Static vertex data, uploaded once at program build.
        data: Rc<Vec<f32>>,
        /// Components per vertex (1–4).
        size: u8,
    },
    /// Resolve to the named attribute's data/size after the full merge,
    /// keeping this entry's own name. An unresolved target is a fatal
    /// construction error.
    Extends(String),
}

/// A named vertex attribute spec.
#[derive(Clone)]
pub struct AttributeSpec {
    /// GLSL attribute name.
    pub name: String,
    /// Data or extension target.
    pub def: AttributeDef,
}

impl AttributeSpec {
    /// A full attribute spec.
    pub fn with_data(name: impl Into<String>, data: Vec<f32>, size: u8) -> Self {
        Self {
            name: name.into(),
            def: AttributeDef::Data {
                data: Rc::new(data),
                size,
            },
        }
    }

    /// An attribute that borrows another attribute's data and size.
    pub fn extending(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            def: AttributeDef::Extends(target.into()),
        }
    }
}

/// An attribute after `extends` resolution, ready for buffer upload.
#[derive(Debug, Clone)]
pub struct ResolvedAttribute {
    /// GLSL attribute name.
    pub name: String,
    /// Static vertex data.
    pub data: Rc<Vec<f32>>,
    /// Components per vertex.
    pub size: u8,
}

/// Per-stage bag of shader source pieces contributed by one effect.
///
/// Declaration lists are ordered `(name, glsl_type)` pairs merged with
/// last-write-wins semantics on name collision. Text blocks are appended in
/// descriptor order with newline separators, never replaced, so synthesis is
/// not commutative: reordering effects changes rendered output whenever
/// effects read or write shared variables such as `sourceCoord`.
#[derive(Clone, Default)]
pub struct ShaderFragment {
    /// `uniform` declarations.
    pub uniform_decls: Vec<(String, String)>,
    /// `attribute` declarations (vertex stage only).
    pub attribute_decls: Vec<(String, String)>,
    /// `varying` declarations; names and types must match across stages.
    pub varying_decls: Vec<(String, String)>,
    /// Free GLSL text emitted before `main`.
    pub constant: String,
    /// Free GLSL text emitted inside `main`.
    pub main: String,
    /// Fragment stage only: text injected before the base color read, used
    /// to mutate the sampling coordinate `sourceCoord`.
    pub source: String,
}

/// One self-contained visual effect: shader fragments plus resource
/// requirements.
#[derive(Clone, Default)]
pub struct EffectDescriptor {
    /// Vertex stage contribution.
    pub vertex: ShaderFragment,
    /// Fragment stage contribution.
    pub fragment: ShaderFragment,
    /// Vertex attributes.
    pub attributes: Vec<AttributeSpec>,
    /// Uniforms, appended to the merged table in order.
    pub uniforms: Vec<UniformSpec>,
    /// Auxiliary textures, bound to consecutive units starting at 1.
    pub textures: Vec<TextureSpec>,
}

impl EffectDescriptor {
    /// An accessor handle over this effect's live resource cells.
    ///
    /// The handle shares the underlying `Rc` cells, so it stays valid and
    /// index-stable after the descriptor is merged into a program.
    pub fn handle(&self) -> EffectHandle {
        EffectHandle {
            uniforms: self.uniforms.clone(),
            textures: self.textures.clone(),
        }
    }
}

/// Mutable accessors into one effect's resource cells.
///
/// Indices are the effect's own authoring-time `uniforms`/`textures`
/// positions; the binding is fixed when the descriptor is authored and
/// remains stable after merge.
#[derive(Clone)]
pub struct EffectHandle {
    /// Shared uniform cells, in authoring order.
    pub uniforms: Vec<UniformSpec>,
    /// Shared texture specs, in authoring order.
    pub textures: Vec<TextureSpec>,
}

impl EffectHandle {
    /// Overwrite the uniform at `index` with `values`. Out-of-range indices
    /// are ignored.
    pub fn set_uniform(&self, index: usize, values: &[f32]) {
        if let Some(uniform) = self.uniforms.get(index) {
            uniform.set(values);
        }
    }

    /// The shared pixel cell of the texture at `index`, if it has one.
    pub fn texture_pixels(&self, index: usize) -> Option<Rc<RefCell<TexturePixels>>> {
        self.textures.get(index).and_then(|t| t.data.clone())
    }
}

/// Subdivision of the rendered quad into a grid of cells.
///
/// Each cell is two independent triangles (6 vertices, duplicated across
/// shared edges, no index buffer), so one program draws
/// `6 × x_segments × y_segments` vertices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    /// Horizontal subdivisions.
    pub x_segments: u32,
    /// Vertical subdivisions.
    pub y_segments: u32,
}

impl Default for Plane {
    fn default() -> Self {
        Self {
            x_segments: 1,
            y_segments: 1,
        }
    }
}

impl Plane {
    /// A grid with the given subdivisions (minimum 1 × 1).
    pub fn new(x_segments: u32, y_segments: u32) -> Self {
        Self {
            x_segments: x_segments.max(1),
            y_segments: y_segments.max(1),
        }
    }

    /// Vertices issued per draw call.
    pub fn vertex_count(self) -> u32 {
        6 * self.x_segments * self.y_segments
    }
}

/// Generate the grid's (x, y) pairs over `[min, max]²`, two triangles per
/// cell in row-major cell order.
fn quad_grid(plane: Plane, min: f32, max: f32) -> Vec<f32> {
    let (nx, ny) = (plane.x_segments, plane.y_segments);
    let span = max - min;
    #[allow(clippy::cast_precision_loss)] // segment counts are tiny
    let step = |i: u32, n: u32| min + span * (i as f32) / (n as f32);

    let mut coords = Vec::with_capacity(plane.vertex_count() as usize * 2);
    for cy in 0..ny {
        for cx in 0..nx {
            let (x0, x1) = (step(cx, nx), step(cx + 1, nx));
            let (y0, y1) = (step(cy, ny), step(cy + 1, ny));
            coords.extend_from_slice(&[
                x0, y0, x1, y0, x0, y1, // lower-left triangle
                x0, y1, x1, y0, x1, y1, // upper-right triangle
            ]);
        }
    }
    coords
}

/// Clip-space positions for the full-viewport quad grid.
pub(crate) fn plane_positions(plane: Plane) -> Vec<f32> {
    quad_grid(plane, -1.0, 1.0)
}

/// Texture coordinates matching [`plane_positions`].
pub(crate) fn plane_tex_coords(plane: Plane) -> Vec<f32> {
    quad_grid(plane, 0.0, 1.0)
}

/// One frame of live source media, re-uploaded to the GPU every draw.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// RGBA pixel bytes.
    pub pixels: Vec<u8>,
}

/// A shared, mutable media handle. The host overwrites the frame contents
/// between draws; the renderer reads whatever is current.
pub type MediaHandle = Rc<RefCell<MediaFrame>>;

/// Argument to [`Instance::set_source`](crate::Instance::set_source): a raw
/// media handle, or a handle with explicit target dimensions. The target
/// surface is resized only when explicit dimensions are given.
pub enum SourceInput {
    /// Media only; the surface keeps its current dimensions.
    Media(MediaHandle),
    /// Media plus an explicit surface resize.
    Sized {
        /// The media handle.
        media: MediaHandle,
        /// New surface width in pixels.
        width: u32,
        /// New surface height in pixels.
        height: u32,
    },
}

impl From<MediaHandle> for SourceInput {
    fn from(media: MediaHandle) -> Self {
        SourceInput::Media(media)
    }
}

/// Pixel dimensions of the render target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// The output of program synthesis: merged two-stage shader source plus the
/// flat, order-preserving resource tables.
#[derive(Debug)]
pub struct MergedProgramData {
    /// Complete vertex stage source.
    pub vertex_source: String,
    /// Complete fragment stage source.
    pub fragment_source: String,
    /// Attributes after name-dedup and `extends` resolution.
    pub attributes: Vec<ResolvedAttribute>,
    /// All effects' uniforms in order, `Rc`-shared with the descriptors.
    pub uniforms: Vec<UniformSpec>,
    /// All effects' textures in order.
    pub textures: Vec<TextureSpec>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn plane_vertex_count_scales_with_segments() {
        assert_eq!(Plane::default().vertex_count(), 6);
        assert_eq!(Plane::new(2, 3).vertex_count(), 36);
    }

    #[test]
    fn plane_new_clamps_zero_segments() {
        assert_eq!(Plane::new(0, 0), Plane::default());
    }

    #[test]
    fn unit_quad_covers_clip_space() {
        let coords = plane_positions(Plane::default());
        assert_eq!(coords.len(), 12);
        // Two triangles spanning [-1, 1]².
        assert_eq!(&coords[..6], &[-1.0, -1.0, 1.0, -1.0, -1.0, 1.0]);
        assert_eq!(&coords[6..], &[-1.0, 1.0, 1.0, -1.0, 1.0, 1.0]);
    }

    #[test]
    fn grid_vertices_are_duplicated_across_cells() {
        let plane = Plane::new(2, 2);
        let coords = plane_positions(plane);
        assert_eq!(coords.len(), plane.vertex_count() as usize * 2);
        // The shared interior corner (0, 0) appears once per surrounding cell.
        let count = coords
            .chunks(2)
            .filter(|c| c[0].abs() < f32::EPSILON && c[1].abs() < f32::EPSILON)
            .count();
        assert!(count >= 4, "interior corner duplicated {count} times");
    }

    #[test]
    fn tex_coords_span_unit_square() {
        let coords = plane_tex_coords(Plane::new(3, 1));
        assert!(coords.iter().all(|&c| (0.0..=1.0).contains(&c)));
        assert!(coords.contains(&1.0) && coords.contains(&0.0));
    }

    #[test]
    fn uniform_set_preserves_length() {
        let u = UniformSpec::float("u_test", vec![0.0, 0.0]);
        u.set(&[1.0, 2.0, 3.0]);
        assert_eq!(*u.data.borrow(), vec![1.0, 2.0]);
        u.set(&[5.0]);
        assert_eq!(*u.data.borrow(), vec![5.0, 2.0]);
    }

    #[test]
    fn uniform_arity_clamped() {
        assert_eq!(UniformSpec::float("u", vec![0.0; 3]).arity(), 3);
        assert_eq!(UniformSpec::float("u", vec![]).arity(), 1);
        assert_eq!(UniformSpec::float("u", vec![0.0; 9]).arity(), 4);
    }

    #[test]
    fn handle_mutation_is_visible_through_clone() {
        let mut effect = EffectDescriptor::default();
        effect
            .uniforms
            .push(UniformSpec::float("u_amount", vec![0.5]));
        let handle = effect.handle();
        handle.set_uniform(0, &[0.9]);
        assert_eq!(*effect.uniforms[0].data.borrow(), vec![0.9]);
        // Out-of-range writes are ignored.
        handle.set_uniform(3, &[1.0]);
    }
}
