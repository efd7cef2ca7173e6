//! The instance controller: owns one render target's lifecycle from
//! acquisition through teardown, including transparent context-loss
//! recovery.
//!
//! States run `Uninitialized → Ready → Playing ⇄ Paused`, with an orthogonal
//! lost flag overlaying any of them. Loss is a recoverable mode, not an
//! error: GPU resources are torn down while media, dimensions, and the live
//! effect parameter cells are retained, and a restore notification rebuilds
//! everything and replays the retained source. Two consecutive restoration
//! failures latch a permanent refusal — repeated context-creation failure
//! usually means an unrecoverable host condition, and retrying forever would
//! spin.
//!
//! The one-time latches (legacy-name fallback, permanent denial) live in
//! [`Engine`], an explicit state object shared by reference with every
//! instance it creates, so tests can construct a fresh policy at will.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::context::{
    ContextApi, ContextEvent, ContextOptions, FramePump, FrameRequest, GpuContext, ListenerId,
    TargetSurface,
};
use crate::error::{AcquireError, Error};
use crate::ticker::Ticker;
use crate::types::{Dimensions, EffectDescriptor, EffectHandle, Plane, SourceInput};
use crate::{program, render, shaders};

/// Verdict returned by a `before_draw` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecision {
    /// Draw this frame.
    Draw,
    /// Veto the draw for this frame only.
    Skip,
}

/// Per-frame veto callback, invoked with the frame time before each draw.
pub type BeforeDraw = Box<dyn FnMut(f64) -> FrameDecision>;

/// Process-wide context policy latches.
#[derive(Default)]
pub(crate) struct ContextPolicy {
    /// Once the standard acquisition name has succeeded anywhere, the
    /// legacy-prefixed fallback is never attempted again.
    standard_seen: bool,
    /// Permanent fail-fast refusal after repeated restoration failures.
    creation_disabled: bool,
}

/// The engine entry point: creates instances and carries the context policy
/// shared across all of them.
pub struct Engine {
    policy: Rc<RefCell<ContextPolicy>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// An engine with a fresh context policy.
    pub fn new() -> Self {
        Self {
            policy: Rc::new(RefCell::new(ContextPolicy::default())),
        }
    }

    /// Whether context creation has been permanently disabled.
    pub fn creation_disabled(&self) -> bool {
        self.policy.borrow().creation_disabled
    }

    /// Create and initialize an instance rendering `effects` onto `surface`.
    ///
    /// Acquires a context, synthesizes and compiles the merged program, and
    /// registers for context lifecycle events. The instance starts paused.
    ///
    /// # Errors
    ///
    /// [`Error::ContextCreationDisabled`] once the permanent-denial latch is
    /// set, [`Error::ContextAcquisition`] when no context can be obtained,
    /// [`Error::UnresolvedAttributeExtend`] for a bad descriptor merge, and
    /// [`Error::Shader`] for compile/link failures (the caller may retry
    /// with corrected descriptors).
    pub fn create(
        &self,
        surface: Rc<dyn TargetSurface>,
        effects: Vec<EffectDescriptor>,
        options: CreateOptions,
    ) -> Result<Instance, Error> {
        if self.creation_disabled() {
            return Err(Error::ContextCreationDisabled);
        }
        let state = Rc::new(RefCell::new(InstanceState {
            surface,
            gpu: None,
            policy: self.policy.clone(),
            effects,
            plane: options.plane,
            no_source: options.no_source,
            context_options: options.context,
            compiled: None,
            media: None,
            dimensions: Dimensions::default(),
            playing: false,
            lost: false,
            destroyed: false,
            resume_on_restore: false,
            ticker: options.ticker,
            pump: options.pump,
            pending: None,
            before_draw: None,
            listener: None,
            restore_failures: 0,
            on_lifecycle: options.on_lifecycle,
        }));
        init(&state)?;
        debug!("instance initialized");
        Ok(Instance { state })
    }
}

/// Configuration for [`Engine::create`], with documented defaults.
#[derive(Default)]
pub struct CreateOptions {
    /// Quad-grid subdivision (default 1 × 1).
    pub plane: Plane,
    /// Render without a base media texture.
    pub no_source: bool,
    /// Context-creation hints.
    pub context: ContextOptions,
    /// Shared frame scheduler; when set, `play` registers for batched
    /// dispatch instead of self-scheduling.
    pub ticker: Option<Ticker>,
    /// Frame pump for self-scheduling when no ticker is supplied. With
    /// neither, the host drives frames itself via [`Instance::draw`].
    pub pump: Option<Rc<dyn FramePump>>,
    /// Optional lifecycle notification hook (loss, restore, creation
    /// errors). Recovery itself needs no caller action.
    pub on_lifecycle: Option<Rc<dyn Fn(ContextEvent)>>,
}

impl CreateOptions {
    /// Set the quad-grid subdivision.
    #[must_use]
    pub fn plane(mut self, plane: Plane) -> Self {
        self.plane = plane;
        self
    }

    /// Render without a base media texture.
    #[must_use]
    pub fn no_source(mut self) -> Self {
        self.no_source = true;
        self
    }

    /// Use a shared frame scheduler.
    #[must_use]
    pub fn ticker(mut self, ticker: &Ticker) -> Self {
        self.ticker = Some(ticker.clone());
        self
    }

    /// Self-schedule through the given frame pump.
    #[must_use]
    pub fn pump(mut self, pump: Rc<dyn FramePump>) -> Self {
        self.pump = Some(pump);
        self
    }

    /// Receive context lifecycle notifications.
    #[must_use]
    pub fn on_lifecycle(mut self, hook: Rc<dyn Fn(ContextEvent)>) -> Self {
        self.on_lifecycle = Some(hook);
        self
    }
}

pub(crate) struct InstanceState {
    surface: Rc<dyn TargetSurface>,
    gpu: Option<Rc<dyn GpuContext>>,
    policy: Rc<RefCell<ContextPolicy>>,
    effects: Vec<EffectDescriptor>,
    plane: Plane,
    no_source: bool,
    context_options: ContextOptions,
    compiled: Option<program::CompiledProgram>,
    media: Option<crate::types::MediaHandle>,
    dimensions: Dimensions,
    playing: bool,
    lost: bool,
    destroyed: bool,
    resume_on_restore: bool,
    ticker: Option<Ticker>,
    pump: Option<Rc<dyn FramePump>>,
    pending: Option<FrameRequest>,
    before_draw: Option<BeforeDraw>,
    listener: Option<ListenerId>,
    restore_failures: u8,
    on_lifecycle: Option<Rc<dyn Fn(ContextEvent)>>,
}

/// One render target: a compiled effect program, its context, and its
/// play/pause/lost state. Created by [`Engine::create`]; destroyed
/// explicitly.
pub struct Instance {
    state: Rc<RefCell<InstanceState>>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance").finish_non_exhaustive()
    }
}

impl Instance {
    /// Swap the source media, optionally resizing the target surface (only
    /// when explicit dimensions are given). Re-allocates effect textures for
    /// the current dimensions. A no-op if the instance is destroyed or the
    /// context is lost and recovery fails.
    pub fn set_source(&self, input: impl Into<SourceInput>) {
        apply_source(&self.state, input.into());
    }

    /// Transition to Playing. With a shared ticker the instance registers
    /// for batched dispatch; with a pump it self-schedules; with neither the
    /// host calls [`draw`](Self::draw) itself. A supplied `before_draw`
    /// callback replaces any previous one and may veto individual frames.
    pub fn play(&self, before_draw: Option<BeforeDraw>) {
        play_inner(&self.state, before_draw);
    }

    /// Transition to Paused, deregistering from whichever scheduling path is
    /// active. Idempotent.
    pub fn stop(&self) {
        stop_inner(&self.state);
    }

    /// Full teardown: stop, release every GPU resource, detach host
    /// listeners. Safe to call twice.
    pub fn destroy(&self) {
        destroy_inner(&self.state, false);
        debug!("instance destroyed");
    }

    /// Draw one frame now. Honors the Playing state and the `before_draw`
    /// veto; intended for hosts that drive frames without a pump or ticker.
    pub fn draw(&self, time: f64) {
        draw_instance(&self.state, time);
    }

    /// Force context restoration now instead of waiting for the host's
    /// restore notification.
    ///
    /// # Errors
    ///
    /// Propagates the `init` failure of the attempt; two accumulated
    /// failures latch permanent denial.
    pub fn restore(&self) -> Result<(), Error> {
        restore(&self.state)
    }

    /// Whether the instance is in the Playing state.
    pub fn is_playing(&self) -> bool {
        self.state.borrow().playing
    }

    /// Whether the context is currently lost.
    pub fn is_lost(&self) -> bool {
        self.state.borrow().lost
    }

    /// Current target dimensions.
    pub fn dimensions(&self) -> Dimensions {
        self.state.borrow().dimensions
    }

    /// Accessor handle for the effect at `index` in the descriptor list.
    pub fn effect_handle(&self, index: usize) -> Option<EffectHandle> {
        self.state
            .borrow()
            .effects
            .get(index)
            .map(EffectDescriptor::handle)
    }
}

/// Acquire a context, falling back to the legacy-prefixed name only while
/// the standard name has never succeeded.
fn acquire(
    surface: &dyn TargetSurface,
    policy: &Rc<RefCell<ContextPolicy>>,
    options: &ContextOptions,
) -> Result<Rc<dyn GpuContext>, Error> {
    match surface.acquire_context(ContextApi::Standard, options) {
        Ok(gpu) => {
            policy.borrow_mut().standard_seen = true;
            Ok(gpu)
        }
        Err(primary) => {
            if policy.borrow().standard_seen {
                Err(primary.into())
            } else {
                debug!("standard context unavailable; trying legacy-prefixed name");
                surface
                    .acquire_context(ContextApi::Legacy, options)
                    .map_err(|_| primary.into())
            }
        }
    }
}

/// Acquire a context and build the compiled program for the current effect
/// list. Used both at creation and when re-initializing after restore.
pub(crate) fn init(state_rc: &Rc<RefCell<InstanceState>>) -> Result<(), Error> {
    let (mut surface, policy, context_options, effects, plane, no_source) = {
        let s = state_rc.borrow();
        (
            s.surface.clone(),
            s.policy.clone(),
            s.context_options,
            s.effects.clone(),
            s.plane,
            s.no_source,
        )
    };
    if policy.borrow().creation_disabled {
        return Err(Error::ContextCreationDisabled);
    }

    let mut gpu = acquire(surface.as_ref(), &policy, &context_options)?;
    if gpu.is_lost() {
        // Already lost at acquisition: one silent recovery attempt.
        debug!("context reported lost at acquisition; retrying on a fresh surface");
        surface = surface.recreate()?;
        state_rc.borrow_mut().surface = surface.clone();
        gpu = acquire(surface.as_ref(), &policy, &context_options)?;
        if gpu.is_lost() {
            return Err(Error::ContextAcquisition(AcquireError::CreationFailed(
                "context still lost after recovery attempt".into(),
            )));
        }
    }

    let (width, height) = surface.dimensions();
    let dimensions = Dimensions { width, height };
    let merged = shaders::synthesize(&effects, plane, no_source)?;
    let compiled = program::build(&gpu, &merged, plane.vertex_count(), dimensions, no_source)?;

    {
        let mut s = state_rc.borrow_mut();
        s.gpu = Some(gpu);
        s.compiled = Some(compiled);
        s.dimensions = dimensions;
    }
    register_listener(state_rc);
    Ok(())
}

fn register_listener(state_rc: &Rc<RefCell<InstanceState>>) {
    let surface = {
        let s = state_rc.borrow();
        if s.listener.is_some() {
            return;
        }
        s.surface.clone()
    };
    let weak = Rc::downgrade(state_rc);
    let id = surface.add_listener(Rc::new(move |event| {
        let Some(state_rc) = weak.upgrade() else {
            return;
        };
        match event {
            ContextEvent::Lost => handle_context_loss(&state_rc),
            ContextEvent::Restored => {
                if let Err(err) = restore(&state_rc) {
                    warn!(error = %err, "context restoration failed");
                }
            }
            ContextEvent::CreationError => {
                warn!("host reported a context creation error");
                notify(&state_rc, ContextEvent::CreationError);
            }
        }
    }));
    state_rc.borrow_mut().listener = Some(id);
}

fn notify(state_rc: &Rc<RefCell<InstanceState>>, event: ContextEvent) {
    let hook = state_rc.borrow().on_lifecycle.clone();
    if let Some(hook) = hook {
        hook(event);
    }
}

fn play_inner(state_rc: &Rc<RefCell<InstanceState>>, before_draw: Option<BeforeDraw>) {
    {
        let mut s = state_rc.borrow_mut();
        if s.destroyed || s.compiled.is_none() {
            return;
        }
        if let Some(callback) = before_draw {
            s.before_draw = Some(callback);
        }
        if s.playing {
            return;
        }
        s.playing = true;
    }
    debug!("playing");
    let ticker = state_rc.borrow().ticker.clone();
    if let Some(ticker) = ticker {
        ticker.add(state_rc);
    } else if state_rc.borrow().pump.is_some() {
        schedule_self(state_rc);
    }
}

fn stop_inner(state_rc: &Rc<RefCell<InstanceState>>) {
    let (ticker, pump, pending, was_playing) = {
        let mut s = state_rc.borrow_mut();
        let was_playing = s.playing;
        s.playing = false;
        // An explicit stop while lost also retracts the pending resume.
        s.resume_on_restore = false;
        (s.ticker.clone(), s.pump.clone(), s.pending.take(), was_playing)
    };
    if let Some(ticker) = ticker {
        ticker.remove(state_rc);
    }
    // A self-scheduled pending frame request is cancelled synchronously.
    if let (Some(pump), Some(request)) = (pump, pending) {
        pump.cancel(request);
    }
    if was_playing {
        debug!("stopped");
    }
}

fn schedule_self(state_rc: &Rc<RefCell<InstanceState>>) {
    let Some(pump) = state_rc.borrow().pump.clone() else {
        return;
    };
    let weak = Rc::downgrade(state_rc);
    let request = pump.request(Box::new(move |time| {
        let Some(state_rc) = weak.upgrade() else {
            return;
        };
        state_rc.borrow_mut().pending = None;
        draw_instance(&state_rc, time);
        if state_rc.borrow().playing {
            schedule_self(&state_rc);
        }
    }));
    state_rc.borrow_mut().pending = Some(request);
}

/// Draw one frame for a playing instance, honoring the `before_draw` veto.
pub(crate) fn draw_instance(state_rc: &Rc<RefCell<InstanceState>>, time: f64) {
    // The veto callback runs user code: take it out so it is invoked
    // without the state borrow held.
    let callback = {
        let mut s = state_rc.borrow_mut();
        if s.destroyed || s.lost || !s.playing || s.compiled.is_none() {
            return;
        }
        s.before_draw.take()
    };
    let mut skip = false;
    let callback = callback.map(|mut callback| {
        skip = callback(time) == FrameDecision::Skip;
        callback
    });

    let mut s = state_rc.borrow_mut();
    if let Some(callback) = callback {
        if s.before_draw.is_none() {
            s.before_draw = Some(callback);
        }
    }
    // Re-check: the callback may have stopped or destroyed the instance.
    if skip || s.destroyed || s.lost || !s.playing {
        return;
    }
    let (Some(gpu), Some(compiled)) = (&s.gpu, &s.compiled) else {
        return;
    };
    render::draw(gpu, s.media.as_ref(), compiled, s.dimensions);
}

fn apply_source(state_rc: &Rc<RefCell<InstanceState>>, input: SourceInput) {
    if state_rc.borrow().destroyed {
        return;
    }
    // Silent no-op when the context is lost and cannot be recovered.
    if state_rc.borrow().lost && restore(state_rc).is_err() {
        return;
    }

    let (media, explicit) = match input {
        SourceInput::Media(media) => (media, None),
        SourceInput::Sized {
            media,
            width,
            height,
        } => (media, Some((width, height))),
    };

    let mut s = state_rc.borrow_mut();
    if s.destroyed || s.compiled.is_none() {
        return;
    }
    let (width, height) = match explicit {
        Some((width, height)) => {
            s.surface.set_dimensions(width, height);
            (width, height)
        }
        None => s.surface.dimensions(),
    };
    s.dimensions = Dimensions { width, height };
    if let (Some(gpu), Some(compiled)) = (&s.gpu, &s.compiled) {
        program::resize_textures(gpu, compiled, s.dimensions);
    }
    s.media = Some(media);
    debug!(width, height, "source set");
}

fn destroy_inner(state_rc: &Rc<RefCell<InstanceState>>, keep_state: bool) {
    stop_inner(state_rc);
    let (gpu, compiled) = {
        let mut s = state_rc.borrow_mut();
        (s.gpu.take(), s.compiled.take())
    };
    if let (Some(gpu), Some(compiled)) = (gpu, compiled) {
        program::destroy(&gpu, compiled);
    }
    if !keep_state {
        let (listener, surface) = {
            let mut s = state_rc.borrow_mut();
            s.media = None;
            s.destroyed = true;
            s.before_draw = None;
            (s.listener.take(), s.surface.clone())
        };
        if let Some(id) = listener {
            surface.remove_listener(id);
        }
    }
}

/// Loss notification: retain media and dimensions, tear down GPU resources,
/// and wait for the restore notification.
fn handle_context_loss(state_rc: &Rc<RefCell<InstanceState>>) {
    {
        let s = state_rc.borrow();
        // Nothing to do once the engine has permanently given up.
        if s.destroyed || s.lost || s.policy.borrow().creation_disabled {
            return;
        }
    }
    debug!("context lost; retaining state and releasing GPU resources");
    let was_playing = state_rc.borrow().playing;
    state_rc.borrow_mut().lost = true;
    destroy_inner(state_rc, true);
    // Latched after the internal stop, which clears it.
    state_rc.borrow_mut().resume_on_restore = was_playing;
    notify(state_rc, ContextEvent::Lost);
}

/// Restore notification (or on-demand forced restoration): rebuild on a
/// fresh surface and replay the retained source.
pub(crate) fn restore(state_rc: &Rc<RefCell<InstanceState>>) -> Result<(), Error> {
    {
        let s = state_rc.borrow();
        if s.destroyed || !s.lost {
            return Ok(());
        }
        if s.policy.borrow().creation_disabled {
            return Err(Error::ContextCreationDisabled);
        }
    }

    match try_restore(state_rc) {
        Ok(()) => {
            let (media, dimensions, resume) = {
                let mut s = state_rc.borrow_mut();
                s.lost = false;
                s.restore_failures = 0;
                let resume = s.resume_on_restore;
                s.resume_on_restore = false;
                (s.media.clone(), s.dimensions, resume)
            };
            if let Some(media) = media {
                apply_source(
                    state_rc,
                    SourceInput::Sized {
                        media,
                        width: dimensions.width,
                        height: dimensions.height,
                    },
                );
            }
            notify(state_rc, ContextEvent::Restored);
            if resume {
                play_inner(state_rc, None);
            }
            debug!("context restored");
            Ok(())
        }
        Err(err) => {
            let failures = {
                let mut s = state_rc.borrow_mut();
                s.restore_failures += 1;
                s.restore_failures
            };
            if failures >= 2 {
                warn!("context restoration failed twice; disabling context creation");
                state_rc
                    .borrow()
                    .policy
                    .borrow_mut()
                    .creation_disabled = true;
            }
            Err(err)
        }
    }
}

/// One restoration attempt: clone-and-replace the surface, then re-init.
///
/// The lifecycle listener moves to the fresh surface on success. On failure
/// the instance re-subscribes where it stands, so a later host restore
/// notification still reaches it.
fn try_restore(state_rc: &Rc<RefCell<InstanceState>>) -> Result<(), Error> {
    let result = (|| {
        {
            let mut s = state_rc.borrow_mut();
            if let Some(id) = s.listener.take() {
                s.surface.remove_listener(id);
            }
            let fresh = s.surface.recreate()?;
            s.surface = fresh;
            s.gpu = None;
        }
        init(state_rc)
    })();
    if result.is_err() {
        register_listener(state_rc);
    }
    result
}
