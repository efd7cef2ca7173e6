//! The program synthesizer: merges an ordered list of effect descriptors
//! into one coherent two-stage GLSL program plus flat resource tables.
//!
//! Synthesis is textual and strictly ordered. Free-text blocks (`constant`,
//! `main`, `source`) are appended in descriptor order with newline
//! separators; declaration maps are shallow-merged with last-write-wins on
//! name collision; attribute lists are deduplicated by name only, with later
//! entries overwriting earlier ones field-by-field and `extends` entries
//! resolving against the fully merged list. Uniform and texture tables are
//! appended with no deduplication at all — index stability matters more than
//! compactness, because the owning effect reaches its live data only through
//! its merged index.
//!
//! Sources target GLSL ES 1.0 (`attribute`/`varying`, `texture2D`,
//! `gl_FragColor`), accepted by GL 2.1+ and GLES 2 drivers alike.

use crate::error::Error;
use crate::types::{
    plane_positions, plane_tex_coords, AttributeDef, AttributeSpec, EffectDescriptor,
    MergedProgramData, Plane, ResolvedAttribute, UniformSpec,
};

/// Luminance coefficients available to every effect fragment.
const LUM_COEFF: &str = "const vec3 lumcoeff = vec3(0.2125, 0.7154, 0.0721);";

/// Accumulated source pieces for one shader stage.
#[derive(Default)]
struct StageAcc {
    uniform: Vec<(String, String)>,
    attribute: Vec<(String, String)>,
    varying: Vec<(String, String)>,
    constant: String,
    main: String,
    source: String,
}

/// Merge declarations with last-write-wins on name collision, preserving
/// first-seen order.
fn merge_decls(into: &mut Vec<(String, String)>, from: &[(String, String)]) {
    for (name, ty) in from {
        if let Some(slot) = into.iter_mut().find(|(n, _)| n == name) {
            slot.1.clone_from(ty);
        } else {
            into.push((name.clone(), ty.clone()));
        }
    }
}

/// Append a text block with a newline separator. Empty blocks contribute
/// nothing.
fn append_block(into: &mut String, text: &str) {
    if text.is_empty() {
        return;
    }
    if !into.is_empty() {
        into.push('\n');
    }
    into.push_str(text);
}

/// Serialize a declaration list into `<qualifier> <type> <name>;` lines.
fn serialize_decls(qualifier: &str, decls: &[(String, String)]) -> String {
    decls
        .iter()
        .map(|(name, ty)| format!("{qualifier} {ty} {name};\n"))
        .collect()
}

/// Merge one attribute spec into the working list: overwrite the definition
/// of an existing entry with the same name, otherwise append.
fn merge_attribute(into: &mut Vec<AttributeSpec>, spec: &AttributeSpec) {
    if let Some(slot) = into.iter_mut().find(|a| a.name == spec.name) {
        slot.def = spec.def.clone();
    } else {
        into.push(spec.clone());
    }
}

/// Resolve `extends` entries against the fully merged attribute list.
///
/// The extending entry keeps its own name but takes the target's data and
/// size. The target must itself be a full spec.
fn resolve_attributes(specs: &[AttributeSpec]) -> Result<Vec<ResolvedAttribute>, Error> {
    specs
        .iter()
        .map(|spec| {
            let (data, size) = match &spec.def {
                AttributeDef::Data { data, size } => (data.clone(), *size),
                AttributeDef::Extends(target) => {
                    let found = specs.iter().find_map(|other| match (&other.name, &other.def) {
                        (name, AttributeDef::Data { data, size }) if name == target => {
                            Some((data.clone(), *size))
                        }
                        _ => None,
                    });
                    found.ok_or_else(|| Error::UnresolvedAttributeExtend {
                        name: target.clone(),
                    })?
                }
            };
            Ok(ResolvedAttribute {
                name: spec.name.clone(),
                data,
                size,
            })
        })
        .collect()
}

fn vertex_source(acc: &StageAcc, media: bool) -> String {
    let uniforms = serialize_decls("uniform", &acc.uniform);
    let attributes = serialize_decls("attribute", &acc.attribute);
    let varyings = serialize_decls("varying", &acc.varying);
    let StageAcc { constant, main, .. } = acc;
    if media {
        format!(
            "precision highp float;
{uniforms}attribute vec2 a_texCoord;
attribute vec2 a_position;
{attributes}varying vec2 v_texCoord;
{varyings}
{LUM_COEFF}
{constant}
void main() {{
    v_texCoord = a_texCoord;
{main}
    gl_Position = vec4(a_position, 0.0, 1.0);
}}
"
        )
    } else {
        format!(
            "precision highp float;
{uniforms}attribute vec2 a_position;
{attributes}{varyings}
{LUM_COEFF}
{constant}
void main() {{
{main}
    gl_Position = vec4(a_position, 0.0, 1.0);
}}
"
        )
    }
}

fn fragment_source(acc: &StageAcc, media: bool) -> String {
    let uniforms = serialize_decls("uniform", &acc.uniform);
    let varyings = serialize_decls("varying", &acc.varying);
    let StageAcc {
        constant,
        main,
        source,
        ..
    } = acc;
    if media {
        format!(
            "precision highp float;
varying vec2 v_texCoord;
{varyings}uniform sampler2D u_source;
{uniforms}
{LUM_COEFF}
{constant}
void main() {{
    vec2 sourceCoord = v_texCoord;
{source}
    vec4 pixel = texture2D(u_source, sourceCoord);
    vec3 color = pixel.rgb;
    float alpha = pixel.a;
{main}
    gl_FragColor = vec4(color, 1.0) * alpha;
}}
"
        )
    } else {
        format!(
            "precision highp float;
{varyings}{uniforms}
{LUM_COEFF}
{constant}
void main() {{
    vec3 color = vec3(0.0);
    float alpha = 1.0;
{main}
    gl_FragColor = vec4(color, 1.0) * alpha;
}}
"
        )
    }
}

/// Merge an ordered effect list into [`MergedProgramData`].
///
/// `no_source` selects the plain-quad templates (no base media texture). An
/// empty effect list, or effects with empty `main` bodies, still yields a
/// valid passthrough program — the zero-effect baseline.
///
/// # Errors
///
/// [`Error::UnresolvedAttributeExtend`] when an attribute's `extends` target
/// does not exist after the full merge.
pub fn synthesize(
    effects: &[EffectDescriptor],
    plane: Plane,
    no_source: bool,
) -> Result<MergedProgramData, Error> {
    let mut vertex = StageAcc::default();
    let mut fragment = StageAcc::default();
    let mut attributes = vec![AttributeSpec {
        name: "a_position".into(),
        def: AttributeDef::Data {
            data: plane_positions(plane).into(),
            size: 2,
        },
    }];
    let mut uniforms: Vec<UniformSpec> = Vec::new();
    let mut textures = Vec::new();

    if !no_source {
        attributes.push(AttributeSpec {
            name: "a_texCoord".into(),
            def: AttributeDef::Data {
                data: plane_tex_coords(plane).into(),
                size: 2,
            },
        });
        // The base media sampler always reads texture unit 0.
        uniforms.push(UniformSpec::int("u_source", vec![0.0]));
    }

    for effect in effects {
        merge_decls(&mut vertex.uniform, &effect.vertex.uniform_decls);
        merge_decls(&mut vertex.attribute, &effect.vertex.attribute_decls);
        merge_decls(&mut vertex.varying, &effect.vertex.varying_decls);
        append_block(&mut vertex.constant, &effect.vertex.constant);
        append_block(&mut vertex.main, &effect.vertex.main);

        merge_decls(&mut fragment.uniform, &effect.fragment.uniform_decls);
        merge_decls(&mut fragment.varying, &effect.fragment.varying_decls);
        append_block(&mut fragment.constant, &effect.fragment.constant);
        append_block(&mut fragment.main, &effect.fragment.main);
        append_block(&mut fragment.source, &effect.fragment.source);

        for attribute in &effect.attributes {
            merge_attribute(&mut attributes, attribute);
        }
        uniforms.extend(effect.uniforms.iter().cloned());
        textures.extend(effect.textures.iter().cloned());
    }

    let attributes = resolve_attributes(&attributes)?;

    Ok(MergedProgramData {
        vertex_source: vertex_source(&vertex, !no_source),
        fragment_source: fragment_source(&fragment, !no_source),
        attributes,
        uniforms,
        textures,
    })
}
