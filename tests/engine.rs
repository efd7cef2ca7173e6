//! End-to-end engine behavior over the recording headless backend: program
//! lifecycle, scheduling, parameter transmission, and context-loss recovery.

#![allow(clippy::unwrap_used)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use quadfx::headless::{HeadlessSurface, ManualPump, UniformValue};
use quadfx::{
    CreateOptions, EffectDescriptor, Engine, Error, FrameDecision, MediaFrame, MediaHandle, Plane,
    ShaderError, ShaderFragment, ShaderStage, SourceInput, TargetSurface, TextureSpec, Ticker,
    UniformSpec,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn media(width: u32, height: u32) -> MediaHandle {
    Rc::new(RefCell::new(MediaFrame {
        width,
        height,
        pixels: vec![0; (width * height * 4) as usize],
    }))
}

/// A brightness-style effect: one float uniform scaling the color.
fn amount_effect(name: &str, initial: f32) -> EffectDescriptor {
    EffectDescriptor {
        fragment: ShaderFragment {
            uniform_decls: vec![(name.to_string(), "float".to_string())],
            main: format!("color *= {name};"),
            ..ShaderFragment::default()
        },
        uniforms: vec![UniformSpec::float(name, vec![initial])],
        ..EffectDescriptor::default()
    }
}

#[test]
fn create_and_draw_passthrough() {
    let surface = HeadlessSurface::new(320, 240);
    let engine = Engine::new();
    let instance = engine
        .create(surface.clone(), vec![], CreateOptions::default())
        .unwrap();

    instance.play(None);
    instance.draw(0.0);

    let draws = surface.gpu().draws();
    assert_eq!(draws.len(), 1);
    assert_eq!(draws[0].vertex_count, 6);
    assert_eq!(draws[0].viewport, (320, 240));
    assert!(draws[0].program.is_some());

    let (vertex, fragment) = surface.gpu().last_program_sources().unwrap();
    assert!(vertex.contains("a_position"));
    assert!(fragment.contains("u_source"));
}

#[test]
fn subdivided_plane_issues_more_vertices() {
    let surface = HeadlessSurface::new(64, 64);
    let engine = Engine::new();
    let instance = engine
        .create(
            surface.clone(),
            vec![],
            CreateOptions::default().plane(Plane::new(10, 5)),
        )
        .unwrap();

    instance.play(None);
    instance.draw(0.0);
    assert_eq!(surface.gpu().draws()[0].vertex_count, 300);
}

#[test]
fn draw_requires_playing_state() {
    let surface = HeadlessSurface::new(64, 64);
    let engine = Engine::new();
    let instance = engine
        .create(surface.clone(), vec![], CreateOptions::default())
        .unwrap();

    instance.draw(0.0);
    assert!(surface.gpu().draws().is_empty());

    instance.play(None);
    instance.draw(1.0);
    instance.stop();
    instance.draw(2.0);
    assert_eq!(surface.gpu().draws().len(), 1);
}

#[test]
fn source_sampler_transmits_as_integer_zero() {
    let surface = HeadlessSurface::new(64, 64);
    let engine = Engine::new();
    let instance = engine
        .create(surface.clone(), vec![], CreateOptions::default())
        .unwrap();

    instance.play(None);
    instance.draw(0.0);

    let draws = surface.gpu().draws();
    assert!(
        draws[0]
            .uniforms
            .iter()
            .any(|(_, value)| *value == UniformValue::Int(vec![0])),
        "u_source must upload through the integer path"
    );
}

#[test]
fn handle_mutation_reaches_the_next_draw() {
    let surface = HeadlessSurface::new(64, 64);
    let engine = Engine::new();
    let instance = engine
        .create(
            surface.clone(),
            vec![amount_effect("u_one", 0.25), amount_effect("u_two", 0.5)],
            CreateOptions::default(),
        )
        .unwrap();

    // Second effect's handle addresses its own uniform 0 regardless of the
    // merged table position.
    let handle = instance.effect_handle(1).unwrap();
    handle.set_uniform(0, &[0.9]);

    instance.play(None);
    instance.draw(0.0);

    let draws = surface.gpu().draws();
    let floats: Vec<_> = draws[0]
        .uniforms
        .iter()
        .filter_map(|(_, value)| match value {
            UniformValue::Float(data) => Some(data.clone()),
            UniformValue::Int(_) => None,
        })
        .collect();
    assert!(floats.contains(&vec![0.25]));
    assert!(floats.contains(&vec![0.9]));
}

#[test]
fn effect_textures_bind_consecutive_units_from_one() {
    let with_texture = |main: &str| EffectDescriptor {
        fragment: ShaderFragment {
            main: main.to_string(),
            ..ShaderFragment::default()
        },
        textures: vec![TextureSpec::default()],
        ..EffectDescriptor::default()
    };

    let surface = HeadlessSurface::new(64, 64);
    let engine = Engine::new();
    let instance = engine
        .create(
            surface.clone(),
            vec![with_texture("color.r = 0.0;"), with_texture("color.g = 0.0;")],
            CreateOptions::default(),
        )
        .unwrap();

    instance.play(None);
    instance.draw(0.0);

    let draws = surface.gpu().draws();
    let units: Vec<u32> = draws[0].texture_units.iter().map(|(unit, _)| *unit).collect();
    assert_eq!(units, [0, 1, 2]);
}

#[test]
fn unresolved_attribute_extend_fails_creation() {
    let effect = EffectDescriptor {
        attributes: vec![quadfx::AttributeSpec::extending("a_speed", "a_missing")],
        ..EffectDescriptor::default()
    };

    let engine = Engine::new();
    let err = engine
        .create(HeadlessSurface::new(64, 64), vec![effect], CreateOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::UnresolvedAttributeExtend { name } if name == "a_missing"
    ));
}

#[test]
fn compile_failure_reports_stage_and_source() {
    let surface = HeadlessSurface::new(64, 64);
    surface.gpu().fail_compile(ShaderStage::Fragment);

    let engine = Engine::new();
    let err = engine
        .create(surface.clone(), vec![], CreateOptions::default())
        .unwrap_err();
    match err {
        Error::Shader(ShaderError::Compile {
            stage,
            shader_source,
            ..
        }) => {
            assert_eq!(stage, ShaderStage::Fragment);
            assert!(shader_source.contains("gl_FragColor"));
        }
        other => panic!("unexpected error: {other}"),
    }
    // The already-compiled vertex shader must not leak.
    assert_eq!(surface.gpu().live_objects(), 0);
    assert!(!surface.gpu().double_free_detected());
}

#[test]
fn link_failure_releases_both_shaders() {
    let surface = HeadlessSurface::new(64, 64);
    surface.gpu().fail_link();

    let engine = Engine::new();
    let err = engine
        .create(surface.clone(), vec![], CreateOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::Shader(ShaderError::Link { .. })));
    assert_eq!(surface.gpu().live_objects(), 0);
}

#[test]
fn destroy_releases_everything_and_is_idempotent() {
    let surface = HeadlessSurface::new(64, 64);
    let engine = Engine::new();
    let instance = engine
        .create(
            surface.clone(),
            vec![amount_effect("u_amount", 1.0)],
            CreateOptions::default(),
        )
        .unwrap();

    instance.play(None);
    instance.draw(0.0);
    instance.destroy();
    instance.destroy();

    let gpu = surface.gpu();
    assert_eq!(gpu.live_objects(), 0);
    assert!(!gpu.double_free_detected());
    assert!(!instance.is_playing());

    // A destroyed instance ignores everything.
    instance.play(None);
    instance.draw(1.0);
    instance.set_source(media(8, 8));
    assert_eq!(gpu.draws().len(), 1);
}

#[test]
fn set_source_with_dimensions_resizes_target() {
    let surface = HeadlessSurface::new(64, 64);
    let engine = Engine::new();
    let instance = engine
        .create(surface.clone(), vec![], CreateOptions::default())
        .unwrap();

    instance.set_source(SourceInput::Sized {
        media: media(640, 480),
        width: 640,
        height: 480,
    });
    assert_eq!(surface.dimensions(), (640, 480));
    assert_eq!(instance.dimensions().width, 640);

    instance.play(None);
    instance.draw(0.0);
    assert_eq!(surface.gpu().draws()[0].viewport, (640, 480));
}

#[test]
fn live_media_reuploads_flipped_every_draw() {
    let surface = HeadlessSurface::new(64, 64);
    let engine = Engine::new();
    let instance = engine
        .create(surface.clone(), vec![], CreateOptions::default())
        .unwrap();

    instance.set_source(media(64, 64));
    instance.play(None);
    instance.draw(0.0);
    instance.draw(1.0);

    let flipped = surface
        .gpu()
        .texture_uploads()
        .iter()
        .filter(|upload| upload.flip_y && upload.with_pixels)
        .count();
    assert_eq!(flipped, 2);
}

#[test]
fn no_source_mode_binds_no_media_texture() {
    let surface = HeadlessSurface::new(64, 64);
    let engine = Engine::new();
    let instance = engine
        .create(surface.clone(), vec![], CreateOptions::default().no_source())
        .unwrap();

    instance.play(None);
    instance.draw(0.0);
    assert!(surface.gpu().draws()[0].texture_units.is_empty());
}

#[test]
fn draws_happen_without_vertex_array_support() {
    let surface = HeadlessSurface::new(64, 64);
    surface.gpu().disable_vertex_arrays();
    let engine = Engine::new();
    let instance = engine
        .create(surface.clone(), vec![], CreateOptions::default())
        .unwrap();

    instance.play(None);
    instance.draw(0.0);
    assert_eq!(surface.gpu().draws().len(), 1);

    instance.destroy();
    assert_eq!(surface.gpu().live_objects(), 0);
}

#[test]
fn before_draw_vetoes_individual_frames() {
    let surface = HeadlessSurface::new(64, 64);
    let engine = Engine::new();
    let instance = engine
        .create(surface.clone(), vec![], CreateOptions::default())
        .unwrap();

    let calls = Rc::new(Cell::new(0u32));
    let seen = calls.clone();
    instance.play(Some(Box::new(move |_time| {
        seen.set(seen.get() + 1);
        if seen.get() == 1 {
            FrameDecision::Skip
        } else {
            FrameDecision::Draw
        }
    })));

    instance.draw(0.0);
    instance.draw(16.0);
    assert_eq!(calls.get(), 2);
    assert_eq!(surface.gpu().draws().len(), 1);
}

#[test]
fn self_scheduling_pump_loops_until_stop() {
    let surface = HeadlessSurface::new(64, 64);
    let pump = ManualPump::new();
    let engine = Engine::new();
    let instance = engine
        .create(
            surface.clone(),
            vec![],
            CreateOptions::default().pump(pump.clone()),
        )
        .unwrap();

    instance.play(None);
    assert_eq!(pump.pending(), 1);

    pump.fire(0.0);
    pump.fire(16.0);
    assert_eq!(surface.gpu().draws().len(), 2);
    assert_eq!(pump.pending(), 1, "the loop re-arms itself");

    // Stopping cancels the pending request synchronously.
    instance.stop();
    assert_eq!(pump.pending(), 0);
    pump.fire(32.0);
    assert_eq!(surface.gpu().draws().len(), 2);
}

#[test]
fn ticker_batches_instances_in_insertion_order() {
    let surface = HeadlessSurface::new(64, 64);
    let pump = ManualPump::new();
    let ticker = Ticker::new(pump.clone());
    let engine = Engine::new();

    let make = || {
        engine
            .create(
                surface.clone(),
                vec![],
                CreateOptions::default().ticker(&ticker),
            )
            .unwrap()
    };
    let first = make();
    let second = make();
    let third = make();

    first.play(None);
    second.play(None);
    third.play(None);
    assert_eq!(ticker.len(), 3);
    assert_eq!(pump.pending(), 1, "one shared frame request for all three");

    pump.fire(0.0);
    let programs: Vec<u64> = surface
        .gpu()
        .draws()
        .iter()
        .map(|d| d.program.unwrap().0)
        .collect();
    assert_eq!(programs.len(), 3);
    // Creation order is insertion order; handles increase monotonically.
    assert!(programs[0] < programs[1] && programs[1] < programs[2]);

    second.stop();
    assert_eq!(ticker.len(), 2);
    pump.fire(16.0);
    let draws = surface.gpu().draws();
    assert_eq!(draws.len(), 5);
    assert_eq!(draws[3].program.unwrap().0, programs[0]);
    assert_eq!(draws[4].program.unwrap().0, programs[2]);

    first.stop();
    third.stop();
    assert!(ticker.is_empty());
    assert_eq!(pump.pending(), 0, "empty registry stops the loop");
}

#[test]
fn dropped_instances_fall_out_of_the_ticker() {
    let surface = HeadlessSurface::new(64, 64);
    let pump = ManualPump::new();
    let ticker = Ticker::new(pump.clone());
    let engine = Engine::new();

    let keeper = engine
        .create(
            surface.clone(),
            vec![],
            CreateOptions::default().ticker(&ticker),
        )
        .unwrap();
    keeper.play(None);
    {
        let transient = engine
            .create(
                surface.clone(),
                vec![],
                CreateOptions::default().ticker(&ticker),
            )
            .unwrap();
        transient.play(None);
        assert_eq!(ticker.len(), 2);
    }

    // The dropped instance is skipped and pruned on the next tick.
    pump.fire(0.0);
    assert_eq!(surface.gpu().draws().len(), 1);
    assert_eq!(ticker.len(), 1);
}

#[test]
fn legacy_fallback_stops_after_standard_succeeds_once() {
    let engine = Engine::new();

    let prefixed_only = HeadlessSurface::new(64, 64);
    prefixed_only.fail_standard(true);
    engine
        .create(prefixed_only.clone(), vec![], CreateOptions::default())
        .unwrap();
    assert_eq!(prefixed_only.standard_acquires(), 1);
    assert_eq!(prefixed_only.legacy_acquires(), 1);

    let modern = HeadlessSurface::new(64, 64);
    engine
        .create(modern.clone(), vec![], CreateOptions::default())
        .unwrap();
    assert_eq!(modern.legacy_acquires(), 0);

    // Standard has now succeeded within this engine, so the fallback is
    // never attempted again, even where it would have worked.
    let broken = HeadlessSurface::new(64, 64);
    broken.fail_standard(true);
    let err = engine
        .create(broken.clone(), vec![], CreateOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::ContextAcquisition(_)));
    assert_eq!(broken.legacy_acquires(), 0);
}

#[test]
fn context_loss_suspends_and_restore_resumes() {
    init_logging();
    let surface = HeadlessSurface::new(64, 64);
    let engine = Engine::new();
    let instance = engine
        .create(
            surface.clone(),
            vec![amount_effect("u_amount", 0.5)],
            CreateOptions::default(),
        )
        .unwrap();

    let handle = instance.effect_handle(0).unwrap();
    instance.set_source(media(64, 64));
    instance.play(None);
    instance.draw(0.0);

    let old_gpu = surface.gpu();
    surface.simulate_loss();
    assert!(instance.is_lost());
    assert!(!instance.is_playing());
    // Loss released every GPU resource without destroying authoring state.
    assert_eq!(old_gpu.live_objects(), 0);
    assert!(!old_gpu.double_free_detected());
    instance.draw(1.0);
    assert_eq!(old_gpu.draws().len(), 1);

    // Parameter edits while lost must survive into the rebuilt program.
    handle.set_uniform(0, &[0.75]);

    surface.simulate_restore();
    assert!(!instance.is_lost());
    assert!(instance.is_playing(), "playback resumes after restoration");
    assert_eq!(surface.recreate_count(), 1);

    let new_gpu = surface.gpu();
    assert!(!Rc::ptr_eq(&old_gpu, &new_gpu));
    instance.draw(2.0);
    let draws = new_gpu.draws();
    assert_eq!(draws.len(), 1);
    assert!(draws[0]
        .uniforms
        .iter()
        .any(|(_, value)| *value == UniformValue::Float(vec![0.75])));
    // The retained media replays onto the fresh source texture.
    assert!(new_gpu
        .texture_uploads()
        .iter()
        .any(|upload| upload.flip_y && upload.with_pixels));
}

#[test]
fn loss_and_restore_survive_a_second_round() {
    let surface = HeadlessSurface::new(64, 64);
    let engine = Engine::new();
    let instance = engine
        .create(surface.clone(), vec![], CreateOptions::default())
        .unwrap();

    instance.play(None);
    surface.simulate_loss();
    surface.simulate_restore();
    surface.simulate_loss();
    assert!(instance.is_lost());
    surface.simulate_restore();
    assert!(!instance.is_lost());
    assert!(instance.is_playing());

    instance.draw(0.0);
    assert_eq!(surface.gpu().draws().len(), 1);
}

#[test]
fn host_restore_still_arrives_after_a_failed_attempt() {
    let surface = HeadlessSurface::new(64, 64);
    let engine = Engine::new();
    let instance = engine
        .create(surface.clone(), vec![], CreateOptions::default())
        .unwrap();

    instance.play(None);
    surface.simulate_loss();
    surface.fail_recreates(1);

    // The scripted failure burns the first attempt; the instance must stay
    // subscribed to host notifications.
    surface.simulate_restore();
    assert!(instance.is_lost());
    assert!(!engine.creation_disabled());

    surface.simulate_restore();
    assert!(!instance.is_lost());
    assert!(instance.is_playing());
    instance.draw(0.0);
    assert_eq!(surface.gpu().draws().len(), 1);
}

#[test]
fn set_source_while_lost_recovers_first() {
    let surface = HeadlessSurface::new(64, 64);
    let engine = Engine::new();
    let instance = engine
        .create(surface.clone(), vec![], CreateOptions::default())
        .unwrap();

    instance.play(None);
    surface.simulate_loss();

    instance.set_source(media(64, 64));
    assert!(!instance.is_lost(), "setting a source forces recovery");
    assert!(instance.is_playing());
    instance.draw(0.0);
    assert_eq!(surface.gpu().draws().len(), 1);
}

#[test]
fn set_source_while_unrecoverable_is_a_silent_noop() {
    let surface = HeadlessSurface::new(64, 64);
    let engine = Engine::new();
    let instance = engine
        .create(surface.clone(), vec![], CreateOptions::default())
        .unwrap();

    surface.simulate_loss();
    surface.fail_recreates(1);

    instance.set_source(media(64, 64));
    assert!(instance.is_lost());

    instance.play(None);
    instance.draw(0.0);
    assert!(surface.gpu().draws().is_empty());
}

#[test]
fn stop_while_lost_cancels_the_pending_resume() {
    let surface = HeadlessSurface::new(64, 64);
    let engine = Engine::new();
    let instance = engine
        .create(surface.clone(), vec![], CreateOptions::default())
        .unwrap();

    instance.play(None);
    surface.simulate_loss();
    instance.stop();

    surface.simulate_restore();
    assert!(!instance.is_lost());
    assert!(
        !instance.is_playing(),
        "an explicit stop outlives the loss episode"
    );
}

#[test]
fn two_failed_restorations_disable_creation_permanently() {
    init_logging();
    let surface = HeadlessSurface::new(64, 64);
    let engine = Engine::new();
    let instance = engine
        .create(surface.clone(), vec![], CreateOptions::default())
        .unwrap();

    surface.simulate_loss();
    surface.fail_recreates(2);

    assert!(instance.restore().is_err());
    assert!(!engine.creation_disabled(), "one failure is not fatal");
    assert!(instance.restore().is_err());
    assert!(engine.creation_disabled());

    // The latch fails fast everywhere in this engine.
    assert!(matches!(
        instance.restore(),
        Err(Error::ContextCreationDisabled)
    ));
    let err = engine
        .create(HeadlessSurface::new(64, 64), vec![], CreateOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::ContextCreationDisabled));

    // A fresh engine carries a fresh policy.
    assert!(Engine::new()
        .create(HeadlessSurface::new(64, 64), vec![], CreateOptions::default())
        .is_ok());
}

#[test]
fn lifecycle_hook_observes_loss_and_restoration() {
    let events = Rc::new(RefCell::new(Vec::new()));
    let log = events.clone();

    let surface = HeadlessSurface::new(64, 64);
    let engine = Engine::new();
    let _instance = engine
        .create(
            surface.clone(),
            vec![],
            CreateOptions::default().on_lifecycle(Rc::new(move |event| {
                log.borrow_mut().push(event);
            })),
        )
        .unwrap();

    surface.simulate_loss();
    surface.simulate_restore();
    surface.simulate_creation_error();

    use quadfx::ContextEvent;
    assert_eq!(
        *events.borrow(),
        [
            ContextEvent::Lost,
            ContextEvent::Restored,
            ContextEvent::CreationError
        ]
    );
}
