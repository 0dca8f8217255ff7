//! Shader compilation and program linking.
//!
//! Sources are Vulkan-flavoured GLSL 450. naga parses and validates each
//! stage, linking checks that every fragment input is fed by a vertex output
//! and emits WGSL for the wgpu backend.

use crate::error::EffectError;
use naga::front::glsl::{Frontend, Options};
use naga::valid::{Capabilities, ModuleInfo, ValidationFlags, Validator};

/// Vertex shader shared by every program: passes the quad through untouched.
pub const QUAD_VERTEX_SHADER: &str = r#"#version 450
layout(location = 0) in vec2 a_position;
layout(location = 1) in vec2 a_tex_coord;
layout(location = 0) out vec2 v_tex_coord;

void main() {
    gl_Position = vec4(a_position, 0.0, 1.0);
    v_tex_coord = a_tex_coord;
}
"#;

/// Programmable pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    pub fn name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Fragment => "fragment",
        }
    }

    fn to_naga(self) -> naga::ShaderStage {
        match self {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Fragment => naga::ShaderStage::Fragment,
        }
    }
}

/// A parsed and validated shader stage.
pub struct CompiledShader {
    stage: ShaderStage,
    module: naga::Module,
    info: ModuleInfo,
}

impl CompiledShader {
    fn entry_point(&self) -> Option<&naga::EntryPoint> {
        self.module.entry_points.first()
    }

    fn to_wgsl(&self) -> Result<String, EffectError> {
        naga::back::wgsl::write_string(&self.module, &self.info, naga::back::wgsl::WriterFlags::empty())
            .map_err(|e| EffectError::ProgramLink {
                log: format!("WGSL generation error in {} stage: {:?}", self.stage.name(), e),
            })
    }
}

/// A vertex/fragment pair ready to be turned into a pipeline.
#[derive(Debug, Clone)]
pub struct LinkedProgram {
    pub vertex_wgsl: String,
    pub vertex_entry: String,
    pub fragment_wgsl: String,
    pub fragment_entry: String,
}

/// Parses and validates one shader stage. The error carries the compiler log.
pub fn compile_shader(stage: ShaderStage, source: &str) -> Result<CompiledShader, EffectError> {
    let mut frontend = Frontend::default();
    let options = Options::from(stage.to_naga());
    let module = frontend.parse(&options, source).map_err(|e| EffectError::ShaderCompile {
        stage: stage.name(),
        log: format!("{:?}", e),
    })?;

    let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
    let info = validator.validate(&module).map_err(|e| EffectError::ShaderCompile {
        stage: stage.name(),
        log: format!("validation error: {:?}", e),
    })?;

    Ok(CompiledShader { stage, module, info })
}

/// Links a vertex and a fragment stage.
pub fn link_program(vertex: &CompiledShader, fragment: &CompiledShader) -> Result<LinkedProgram, EffectError> {
    if vertex.stage != ShaderStage::Vertex || fragment.stage != ShaderStage::Fragment {
        return Err(EffectError::ProgramLink {
            log: format!(
                "expected vertex + fragment stages, got {} + {}",
                vertex.stage.name(),
                fragment.stage.name()
            ),
        });
    }

    let (Some(vs_entry), Some(fs_entry)) = (vertex.entry_point(), fragment.entry_point()) else {
        return Err(EffectError::ProgramLink {
            log: "missing entry point".to_string(),
        });
    };

    let mut produced = Vec::new();
    if let Some(result) = &vs_entry.function.result {
        collect_locations(&vertex.module, result.binding.as_ref(), result.ty, &mut produced);
    }
    let mut consumed = Vec::new();
    for arg in &fs_entry.function.arguments {
        collect_locations(&fragment.module, arg.binding.as_ref(), arg.ty, &mut consumed);
    }
    if let Some(missing) = consumed.iter().find(|loc| !produced.contains(loc)) {
        return Err(EffectError::ProgramLink {
            log: format!("fragment input at location {} has no matching vertex output", missing),
        });
    }

    Ok(LinkedProgram {
        vertex_wgsl: vertex.to_wgsl()?,
        vertex_entry: vs_entry.name.clone(),
        fragment_wgsl: fragment.to_wgsl()?,
        fragment_entry: fs_entry.name.clone(),
    })
}

/// Collects `@location` indices of an entry point argument or result,
/// descending into IO structs.
fn collect_locations(
    module: &naga::Module,
    binding: Option<&naga::Binding>,
    ty: naga::Handle<naga::Type>,
    out: &mut Vec<u32>,
) {
    match binding {
        Some(naga::Binding::Location { location, .. }) => out.push(*location),
        Some(_) => {}
        None => {
            if let naga::TypeInner::Struct { members, .. } = &module.types[ty].inner {
                for member in members {
                    collect_locations(module, member.binding.as_ref(), member.ty, out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSTHROUGH: &str = r#"#version 450
layout(location = 0) in vec2 v_tex_coord;
layout(location = 0) out vec4 frag_color;
layout(set = 0, binding = 0) uniform texture2D u_image;
layout(set = 0, binding = 1) uniform sampler u_sampler;

void main() {
    frag_color = texture(sampler2D(u_image, u_sampler), v_tex_coord);
}
"#;

    #[test]
    fn compiles_and_links_quad_program() {
        let vs = compile_shader(ShaderStage::Vertex, QUAD_VERTEX_SHADER).unwrap();
        let fs = compile_shader(ShaderStage::Fragment, PASSTHROUGH).unwrap();
        let program = link_program(&vs, &fs).unwrap();
        assert!(program.fragment_wgsl.contains("@fragment"));
        assert!(program.vertex_wgsl.contains("@vertex"));
    }

    #[test]
    fn compile_error_carries_log() {
        let err = compile_shader(ShaderStage::Fragment, "#version 450\nvoid main() { oops }").err().unwrap();
        match err {
            EffectError::ShaderCompile { stage, log } => {
                assert_eq!(stage, "fragment");
                assert!(!log.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn link_rejects_swapped_stages() {
        let vs = compile_shader(ShaderStage::Vertex, QUAD_VERTEX_SHADER).unwrap();
        let other_vs = compile_shader(ShaderStage::Vertex, QUAD_VERTEX_SHADER).unwrap();
        assert!(matches!(link_program(&vs, &other_vs), Err(EffectError::ProgramLink { .. })));
    }

    #[test]
    fn link_rejects_unfed_fragment_input() {
        let fs_src = r#"#version 450
layout(location = 3) in vec2 v_other;
layout(location = 0) out vec4 frag_color;

void main() {
    frag_color = vec4(v_other, 0.0, 1.0);
}
"#;
        let vs = compile_shader(ShaderStage::Vertex, QUAD_VERTEX_SHADER).unwrap();
        let fs = compile_shader(ShaderStage::Fragment, fs_src).unwrap();
        let err = link_program(&vs, &fs).err().unwrap();
        assert!(err.to_string().contains("location 3"));
    }
}
