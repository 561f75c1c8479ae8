//! Shader programs.
//!
//! A program is one GLSL source in the single-file dialect described in
//! [`preprocess`]. Compilation splits it into stages, compiles each stage to
//! SPIR-V with naga, reflects the resources every stage declares and merges
//! them into one [`DescriptorTable`] plus per-set layout descriptions.
//!
//! # Example
//!
//! ```no_run
//! use lumen_rhi::shader::compile_program;
//!
//! let source = "
//! layout(location = 0) out vec4 o_Color;
//! void vertex() { gl_Position = vec4(0.0, 0.0, 0.0, 1.0); }
//! void fragment() { o_Color = vec4(1.0); }
//! ";
//! let program = compile_program("solid", source, &[] as &[&str]).unwrap();
//! assert_eq!(program.stages.len(), 2);
//! ```

pub mod cache;
pub mod preprocess;
pub(crate) mod reflect;
pub mod resolver;

use std::collections::BTreeMap;
use std::fmt;

use naga::back::spv;
use naga::front::glsl;
use naga::valid::{Capabilities, ValidationFlags, Validator};
use thiserror::Error;

pub use cache::{ShaderCache, ShaderProgram};
pub use preprocess::EntryPoints;
pub use resolver::{
    FileResolver, MemoryResolver, ResolvedSource, ShaderResolver, resolve_with_includes,
};

use crate::descriptor::{
    DescriptorTable, LayoutBinding, MAX_SETS, NamedDescriptor, SetLayoutDesc, StageMask,
};
use crate::hash::{NameHash, name_hash, program_key};
use crate::pipeline::VertexFormat;
use preprocess::PREAMBLE_LINES;
use reflect::ReflectedBinding;

/// Shader stage type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    /// Vertex shader stage - processes each vertex
    Vertex,
    /// Fragment (pixel) shader stage - processes each fragment
    Fragment,
    /// Compute shader stage - general-purpose GPU computation
    Compute,
}

impl ShaderStage {
    /// Returns a human-readable name for the shader stage.
    pub fn name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Fragment => "fragment",
            ShaderStage::Compute => "compute",
        }
    }

    /// Name of the function that marks this stage in a source.
    #[inline]
    pub fn entry_name(self) -> &'static str {
        self.name()
    }

    #[inline]
    pub fn mask(self) -> StageMask {
        match self {
            ShaderStage::Vertex => StageMask::VERTEX,
            ShaderStage::Fragment => StageMask::FRAGMENT,
            ShaderStage::Compute => StageMask::COMPUTE,
        }
    }

    fn to_naga(self) -> naga::ShaderStage {
        match self {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Fragment => naga::ShaderStage::Fragment,
            ShaderStage::Compute => naga::ShaderStage::Compute,
        }
    }
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One compiler message, with the line number of the author's source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: u32,
    pub column: u32,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

/// Errors produced while resolving or compiling a shader program.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShaderError {
    #[error("Shader not found: {0}")]
    NotFound(String),

    #[error("Include '{include}' from {from} could not be resolved")]
    MissingInclude { include: String, from: String },

    #[error("Include cycle through {0}")]
    IncludeCycle(String),

    #[error("No suitable entrypoint combination found.")]
    NoEntryPoints,

    #[error("Shader source is empty")]
    EmptySource,

    #[error("{stage} stage failed to compile ({} errors)", diagnostics.len())]
    Compile {
        stage: ShaderStage,
        diagnostics: Vec<Diagnostic>,
    },

    #[error("{stage} stage failed validation: {message}")]
    Validation { stage: ShaderStage, message: String },

    #[error("{stage} stage could not be written as SPIR-V: {message}")]
    Spirv { stage: ShaderStage, message: String },

    #[error("Binding '{name}' at set {set} binding {binding} is out of range")]
    BindingOutOfRange { name: String, set: u32, binding: u32 },

    #[error("Set {set} binding {binding} is declared with different kinds across stages")]
    BindingConflict { set: u32, binding: u32 },

    #[error("Uniform names '{first}' and '{second}' share hash {hash:#010x}")]
    HashCollision {
        first: String,
        second: String,
        hash: NameHash,
    },
}

impl ShaderError {
    /// Per-line diagnostics, if this is a compile error.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            ShaderError::Compile { diagnostics, .. } => diagnostics,
            _ => &[],
        }
    }
}

/// Whether a program draws or dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    Graphics,
    Compute,
}

/// SPIR-V for one stage; the entry point is always `main`.
#[derive(Debug, Clone)]
pub struct CompiledStage {
    pub stage: ShaderStage,
    pub spirv: Vec<u32>,
}

/// Everything a device needs to build pipelines for a program.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    /// Name the program was requested under.
    pub name: String,
    /// Identity of source plus defines.
    pub key: u64,
    pub kind: ProgramKind,
    pub stages: Vec<CompiledStage>,
    pub table: DescriptorTable,
    /// Layout per set index, `0..=max used set`. Unused sets are empty.
    pub set_layouts: Vec<SetLayoutDesc>,
    /// Byte size of every uniform block, by `(set, binding)`.
    pub block_sizes: BTreeMap<(u32, u32), u32>,
    pub vertex_inputs: Vec<(u32, VertexFormat)>,
    /// True when any binding is a storage buffer or storage image.
    pub writes_storage: bool,
}

impl CompiledProgram {
    pub fn stage(&self, stage: ShaderStage) -> Option<&CompiledStage> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

/// Compiles a program using [`name_hash`] for the descriptor table.
///
/// # Errors
///
/// Returns an error if the source has no valid entry-point combination,
/// fails to compile or validate, declares out-of-range or conflicting
/// bindings, or declares two names with the same hash.
pub fn compile_program<S: AsRef<str>>(
    name: &str,
    source: &str,
    defines: &[S],
) -> Result<CompiledProgram, ShaderError> {
    compile_program_with(name, source, defines, name_hash)
}

/// Compiles a program with a caller-supplied name hash.
pub fn compile_program_with<S: AsRef<str>>(
    name: &str,
    source: &str,
    defines: &[S],
    hasher: impl Fn(&str) -> NameHash,
) -> Result<CompiledProgram, ShaderError> {
    if source.trim().is_empty() {
        return Err(ShaderError::EmptySource);
    }

    let entries = preprocess::detect_entry_points(source)?;
    let define_map = parse_defines(defines);

    let mut stages = Vec::new();
    let mut bindings: BTreeMap<(u32, u32), ReflectedBinding> = BTreeMap::new();
    let mut vertex_inputs = Vec::new();

    for &stage in entries.stages() {
        let text = preprocess::stage_source(source, stage, entries);
        let module = parse_stage(&text, stage, &define_map)?;

        let info = Validator::new(ValidationFlags::all(), Capabilities::all())
            .validate(&module)
            .map_err(|e| ShaderError::Validation {
                stage,
                message: e.emit_to_string(&text),
            })?;

        let mut options = spv::Options::default();
        options
            .flags
            .remove(spv::WriterFlags::ADJUST_COORDINATE_SPACE);
        let pipeline_options = spv::PipelineOptions {
            shader_stage: stage.to_naga(),
            entry_point: "main".into(),
        };
        let spirv = spv::write_vec(&module, &info, &options, Some(&pipeline_options)).map_err(
            |e| ShaderError::Spirv {
                stage,
                message: e.to_string(),
            },
        )?;

        for binding in reflect::reflect_bindings(&module, stage.mask())? {
            merge_binding(&mut bindings, binding)?;
        }
        if stage == ShaderStage::Vertex {
            vertex_inputs = reflect::reflect_vertex_inputs(&module);
        }

        stages.push(CompiledStage { stage, spirv });
    }

    let named: Vec<NamedDescriptor> = bindings.values().flat_map(|b| b.descriptors()).collect();
    let table = DescriptorTable::build_with(named, hasher)?;

    let set_count = bindings
        .keys()
        .map(|(set, _)| *set as usize + 1)
        .max()
        .unwrap_or(0)
        .min(MAX_SETS);
    let mut set_layouts = vec![SetLayoutDesc::default(); set_count];
    let mut block_sizes = BTreeMap::new();
    for (&(set, binding), reflected) in &bindings {
        set_layouts[set as usize].bindings.push(LayoutBinding {
            binding,
            kind: reflected.kind,
            stages: reflected.stages,
        });
        if reflected.size > 0 {
            block_sizes.insert((set, binding), reflected.size);
        }
    }

    let kind = match entries {
        EntryPoints::Graphics => ProgramKind::Graphics,
        EntryPoints::Compute => ProgramKind::Compute,
    };

    Ok(CompiledProgram {
        name: name.to_string(),
        key: program_key(source, defines),
        kind,
        stages,
        table,
        set_layouts,
        block_sizes,
        vertex_inputs,
        writes_storage: bindings.values().any(|b| b.kind.is_writable()),
    })
}

/// `NAME` defines to `1`, `NAME=VALUE` splits on the first `=`.
fn parse_defines<S: AsRef<str>>(defines: &[S]) -> Vec<(String, String)> {
    defines
        .iter()
        .map(|define| match define.as_ref().split_once('=') {
            Some((name, value)) => (name.trim().to_string(), value.trim().to_string()),
            None => (define.as_ref().trim().to_string(), "1".to_string()),
        })
        .collect()
}

fn parse_stage(
    text: &str,
    stage: ShaderStage,
    defines: &[(String, String)],
) -> Result<naga::Module, ShaderError> {
    let mut options = glsl::Options::from(stage.to_naga());
    for (name, value) in defines {
        options.defines.insert(name.clone(), value.clone());
    }

    glsl::Frontend::default()
        .parse(&options, text)
        .map_err(|errors| ShaderError::Compile {
            stage,
            diagnostics: errors
                .errors
                .iter()
                .map(|error| {
                    let location = error.meta.location(text);
                    Diagnostic {
                        line: location.line_number.saturating_sub(PREAMBLE_LINES),
                        column: location.line_position,
                        message: error.kind.to_string(),
                    }
                })
                .collect(),
        })
}

fn merge_binding(
    bindings: &mut BTreeMap<(u32, u32), ReflectedBinding>,
    binding: ReflectedBinding,
) -> Result<(), ShaderError> {
    let key = (binding.set, binding.binding);
    match bindings.get_mut(&key) {
        None => {
            bindings.insert(key, binding);
        }
        Some(existing) => {
            if existing.kind != binding.kind {
                return Err(ShaderError::BindingConflict {
                    set: key.0,
                    binding: key.1,
                });
            }
            existing.stages = existing.stages | binding.stages;
            existing.size = existing.size.max(binding.size);
            for name in binding.names {
                if !existing.names.contains(&name) {
                    existing.names.push(name);
                }
            }
            for member in binding.members {
                if !existing.members.iter().any(|m| m.0 == member.0) {
                    existing.members.push(member);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorKind;

    const TEXTURED: &str = "\
layout(location = 0) attribute vec2 a_Position;
layout(location = 0) varying vec2 v_Uv;
layout(location = 0) out vec4 o_Color;

layout(set = 0, binding = 0) uniform Globals {
    vec4 u_Tint;
    float u_Scale;
};
layout(set = 0, binding = 1) uniform texture2D u_Texture;
layout(set = 0, binding = 2) uniform sampler u_Sampler;

void vertex() {
    v_Uv = a_Position * 0.5 + 0.5;
    gl_Position = vec4(a_Position * u_Scale, 0.0, 1.0);
}

void fragment() {
    o_Color = texture(sampler2D(u_Texture, u_Sampler), v_Uv) * u_Tint;
}
";

    const DOUBLE: &str = "\
layout(local_size_x = 64) in;
layout(set = 0, binding = 0) buffer Data {
    float values[];
};

void compute() {
    values[gl_GlobalInvocationID.x] *= 2.0;
}
";

    #[test]
    fn test_compile_graphics_program() {
        let program = compile_program("textured", TEXTURED, &[] as &[&str]).unwrap();
        assert_eq!(program.kind, ProgramKind::Graphics);
        assert!(program.stage(ShaderStage::Vertex).is_some());
        assert!(program.stage(ShaderStage::Fragment).is_some());
        assert!(!program.writes_storage);

        let scale = program.table.find_name("u_Scale").unwrap();
        assert_eq!((scale.set, scale.binding), (0, 0));
        assert_eq!(scale.offset, 16);
        assert_eq!(scale.size, 4);

        let texture = program.table.find_name("u_Texture").unwrap();
        assert_eq!(texture.kind, DescriptorKind::SampledTexture);
        assert_eq!(texture.binding, 1);

        assert_eq!(program.set_layouts.len(), 1);
        let layout = &program.set_layouts[0];
        assert_eq!(layout.bindings.len(), 3);
        assert_eq!(layout.binding(2).unwrap().kind, DescriptorKind::Sampler);
        assert!(program.block_sizes.contains_key(&(0, 0)));

        assert_eq!(program.vertex_inputs, vec![(0, VertexFormat::Float2)]);
    }

    #[test]
    fn test_compile_compute_program() {
        let program = compile_program("double", DOUBLE, &[] as &[&str]).unwrap();
        assert_eq!(program.kind, ProgramKind::Compute);
        assert_eq!(program.stages.len(), 1);
        assert!(program.writes_storage);
        assert_eq!(
            program.set_layouts[0].binding(0).unwrap().kind,
            DescriptorKind::StorageBuffer
        );
    }

    #[test]
    fn test_defines_change_the_key() {
        let plain = compile_program("double", DOUBLE, &[] as &[&str]).unwrap();
        let defined = compile_program("double", DOUBLE, &["FAST"]).unwrap();
        assert_ne!(plain.key, defined.key);
    }

    #[test]
    fn test_missing_entry_points() {
        let err = compile_program("nothing", "float helper() { return 1.0; }\n", &[] as &[&str])
            .unwrap_err();
        assert_eq!(err, ShaderError::NoEntryPoints);
        assert_eq!(err.to_string(), "No suitable entrypoint combination found.");
    }

    #[test]
    fn test_empty_source() {
        let err = compile_program("empty", "  \n", &[] as &[&str]).unwrap_err();
        assert_eq!(err, ShaderError::EmptySource);
    }

    #[test]
    fn test_compile_error_reports_stage() {
        let source = "\
void vertex() {
    gl_Position = not_declared;
}
void fragment() {}
";
        let err = compile_program("broken", source, &[] as &[&str]).unwrap_err();
        match &err {
            ShaderError::Compile { stage, diagnostics } => {
                assert_eq!(*stage, ShaderStage::Vertex);
                assert!(!diagnostics.is_empty());
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!err.diagnostics().is_empty());
    }

    #[test]
    fn test_colliding_uniform_names_are_rejected() {
        let source = "\
layout(set = 0, binding = 0) buffer Params {
    float costarring;
    float liquid;
};
void compute() {
    costarring = liquid;
}
";
        let err = compile_program("collide", source, &[] as &[&str]).unwrap_err();
        match err {
            ShaderError::HashCollision {
                first,
                second,
                hash,
            } => {
                assert_eq!(hash, 0x5e4daa9d);
                let mut names = [first, second];
                names.sort();
                assert_eq!(names, ["costarring".to_string(), "liquid".to_string()]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_binding_out_of_range() {
        let source = "\
layout(set = 0, binding = 16) buffer Data { float values[]; };
void compute() { values[0] = 1.0; }
";
        let err = compile_program("range", source, &[] as &[&str]).unwrap_err();
        assert!(matches!(
            err,
            ShaderError::BindingOutOfRange { binding: 16, .. }
        ));
    }

    #[test]
    fn test_parse_defines() {
        let parsed = parse_defines(&["FAST", "RADIUS = 4"]);
        assert_eq!(
            parsed,
            vec![
                ("FAST".to_string(), "1".to_string()),
                ("RADIUS".to_string(), "4".to_string()),
            ]
        );
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(ShaderStage::Vertex.entry_name(), "vertex");
        assert_eq!(ShaderStage::Compute.to_string(), "compute");
        assert!(ShaderStage::Fragment.mask().contains(StageMask::FRAGMENT));
    }
}
