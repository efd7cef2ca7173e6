//! Error taxonomy.
//!
//! Construction and compilation errors are reported synchronously at
//! `create`/`init` time. Context loss is not represented here at all: it is a
//! recoverable mode handled inside the instance state machine, observable
//! only through optional lifecycle hooks.

use crate::context::ShaderStage;

/// Errors surfaced to the caller by [`Engine::create`](crate::Engine::create)
/// and the instance lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An attribute spec extends a named attribute that does not exist after
    /// the full descriptor merge.
    #[error("could not find attribute to extend: {name}")]
    UnresolvedAttributeExtend {
        /// The `extends` target that failed to resolve.
        name: String,
    },

    /// No rendering context could be obtained from the target surface.
    #[error("could not acquire a rendering context")]
    ContextAcquisition(#[from] AcquireError),

    /// Context creation has been permanently disabled after repeated
    /// restoration failures. Every subsequent `init` fails fast with this
    /// variant so callers can stop retrying.
    #[error("context creation is permanently disabled after repeated failures")]
    ContextCreationDisabled,

    /// Shader compilation or program linking failed.
    #[error(transparent)]
    Shader(#[from] ShaderError),
}

/// A typed compilation or link failure, carrying the raw driver log.
///
/// Fatal for the `init` attempt that produced it, but not for the process:
/// the caller may retry with corrected descriptors. There is no automatic
/// re-synthesis.
#[derive(Debug, thiserror::Error)]
pub enum ShaderError {
    /// One shader stage failed to compile.
    #[error("{stage:?} shader failed to compile: {log}")]
    Compile {
        /// The stage that failed.
        stage: ShaderStage,
        /// The raw compiler log.
        log: String,
        /// The full offending GLSL, attached for debuggability.
        shader_source: String,
    },

    /// The two stages compiled but the program failed to link.
    #[error("program failed to link: {log}")]
    Link {
        /// The raw linker log.
        log: String,
    },
}

/// Failure to obtain a rendering context from a target surface.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AcquireError {
    /// The surface does not support the requested context API name.
    #[error("context API not supported by this surface")]
    Unsupported,

    /// The host reported a context creation failure.
    #[error("context creation failed: {0}")]
    CreationFailed(String),
}
