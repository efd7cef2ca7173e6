//! A composable-effects rendering engine over OpenGL via [glow].
//!
//! Effects are plain data: an [`EffectDescriptor`] contributes shader
//! fragments, uniforms, attributes, and textures. An [`Engine`] merges an
//! ordered list of descriptors into exactly one two-stage GPU program per
//! target, draws a screen-aligned quad grid through it each frame, and keeps
//! the whole thing alive across context loss.
//!
//! # Features
//!
//! - **Descriptor merging**: declarations merge last-write-wins by name,
//!   main-body snippets concatenate in order, so later effects observe and
//!   transform earlier effects' output.
//! - **Index-stable handles**: [`EffectHandle`] addresses uniforms and
//!   textures by the positions they held in the descriptor, valid for the
//!   instance's whole lifetime including across context restoration.
//! - **Media mode**: a base media source is re-uploaded every frame to
//!   texture unit 0 and sampled as `u_source`; `no_source` drops the whole
//!   path for purely procedural output.
//! - **Context-loss recovery**: loss suspends drawing without destroying
//!   authoring state; restoration rebuilds the program on a fresh context
//!   and resumes playback. Two failed restorations permanently disable
//!   context creation for the owning [`Engine`].
//! - **Shared scheduling**: a [`Ticker`] batches any number of instances
//!   under one host frame callback, holding only non-owning references.
//!
//! # Backends
//!
//! The engine is written against the host traits in [`context`]:
//! [`GpuContext`], [`TargetSurface`], and [`FramePump`]. The default `glow`
//! feature provides [`GlowContext`] over OpenGL; [`headless`] provides
//! recording software implementations of all three, usable for tests and
//! GPU-less embeddings.
//!
//! [glow]: https://docs.rs/glow

pub mod context;
mod error;
pub mod headless;
mod instance;
mod program;
mod render;
mod shaders;
mod ticker;
mod types;

#[cfg(feature = "glow")]
mod glow_backend;

pub use context::{
    ContextApi, ContextEvent, ContextOptions, FramePump, GpuContext, ShaderStage, TargetSurface,
};
pub use error::{AcquireError, Error, ShaderError};
pub use instance::{BeforeDraw, CreateOptions, Engine, FrameDecision, Instance};
pub use shaders::synthesize;
pub use ticker::Ticker;
pub use types::{
    AttributeDef, AttributeSpec, Dimensions, EffectDescriptor, EffectHandle, MediaFrame,
    MediaHandle, MergedProgramData, Plane, ResolvedAttribute, ShaderFragment, SourceInput,
    TextureFormat, TexturePixels, TextureSpec, UniformSpec, UniformType, Wrap,
};

#[cfg(feature = "glow")]
pub use glow_backend::GlowContext;
