//! Content-addressed, reference-counted shader programs.
//!
//! Programs are keyed by [`program_key`] over the resolved source and the
//! define list, so asking for the same shader with the same defines twice
//! returns the same handle with one more use. Descriptor-set layouts and
//! pipeline layouts are deduplicated by structure across every program in
//! the cache and live until the cache is destroyed.

use std::collections::{BTreeMap, HashMap};

use slotmap::SlotMap;
use tracing::{debug, info};

use super::{
    CompiledProgram, ProgramKind, ShaderResolver, ShaderStage, compile_program,
    resolve_with_includes,
};
use crate::backend::{GpuBackend, RawPipelineLayout, RawSetLayout, RawShaderModule};
use crate::descriptor::{DescriptorTable, SetLayoutDesc};
use crate::error::RhiResult;
use crate::handle::ShaderHandle;
use crate::hash::program_key;
use crate::pipeline::VertexFormat;

/// A compiled program with its GPU modules and layouts.
#[derive(Debug)]
pub struct ShaderProgram {
    pub name: String,
    /// Where the resolver found the source, for diagnostics.
    pub qualified_name: String,
    pub defines: Vec<String>,
    pub key: u64,
    pub kind: ProgramKind,
    pub modules: Vec<(ShaderStage, RawShaderModule)>,
    pub table: DescriptorTable,
    /// Structural layout per set index.
    pub set_descs: Vec<SetLayoutDesc>,
    /// GPU layout per set index, shared with other programs.
    pub set_layouts: Vec<RawSetLayout>,
    pub pipeline_layout: RawPipelineLayout,
    pub block_sizes: BTreeMap<(u32, u32), u32>,
    pub vertex_inputs: Vec<(u32, VertexFormat)>,
    pub writes_storage: bool,
    uses: u32,
}

impl ShaderProgram {
    pub fn module(&self, stage: ShaderStage) -> Option<RawShaderModule> {
        self.modules
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, module)| *module)
    }

    #[inline]
    pub fn uses(&self) -> u32 {
        self.uses
    }

    /// Byte size of the uniform block at `(set, binding)`.
    pub fn block_size(&self, set: u32, binding: u32) -> Option<u32> {
        self.block_sizes.get(&(set, binding)).copied()
    }
}

/// Shader programs plus the layout objects they share.
#[derive(Debug, Default)]
pub struct ShaderCache {
    programs: SlotMap<ShaderHandle, ShaderProgram>,
    by_key: HashMap<u64, ShaderHandle>,
    set_layouts: HashMap<SetLayoutDesc, RawSetLayout>,
    pipeline_layouts: HashMap<Vec<RawSetLayout>, RawPipelineLayout>,
}

impl ShaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves `name`, compiling it unless a program with the same source
    /// and defines is already cached, and takes one use of the result.
    ///
    /// # Errors
    ///
    /// [`RhiError::Shader`](crate::RhiError::Shader) if the source cannot be
    /// resolved or compiled; any other variant is a native failure while
    /// creating modules or layouts.
    pub fn acquire(
        &mut self,
        backend: &mut dyn GpuBackend,
        resolver: &dyn ShaderResolver,
        name: &str,
        defines: &[String],
    ) -> RhiResult<ShaderHandle> {
        let resolved = resolve_with_includes(resolver, name)?;
        let key = program_key(&resolved.source, defines);

        if let Some(&handle) = self.by_key.get(&key) {
            let program = &mut self.programs[handle];
            program.uses += 1;
            debug!("Shader '{}' cache hit ({} uses)", name, program.uses);
            return Ok(handle);
        }

        let compiled = compile_program(&resolved.qualified_name, &resolved.source, defines)?;
        let handle = self.insert(backend, name, &resolved.qualified_name, defines, compiled)?;
        info!(
            "Compiled shader '{}' from {} ({} descriptors)",
            name,
            resolved.qualified_name,
            self.programs[handle].table.len()
        );
        Ok(handle)
    }

    /// Key the cache would use for `name` with `defines` as the resolver
    /// currently sees it.
    pub fn current_key(
        resolver: &dyn ShaderResolver,
        name: &str,
        defines: &[String],
    ) -> RhiResult<u64> {
        let resolved = resolve_with_includes(resolver, name)?;
        Ok(program_key(&resolved.source, defines))
    }

    fn insert(
        &mut self,
        backend: &mut dyn GpuBackend,
        name: &str,
        qualified_name: &str,
        defines: &[String],
        compiled: CompiledProgram,
    ) -> RhiResult<ShaderHandle> {
        let mut modules = Vec::with_capacity(compiled.stages.len());
        for stage in &compiled.stages {
            match backend.create_shader_module(stage.stage, &stage.spirv) {
                Ok(module) => modules.push((stage.stage, module)),
                Err(err) => {
                    for (_, module) in modules {
                        backend.destroy_shader_module(module);
                    }
                    return Err(err);
                }
            }
        }

        let mut set_layouts = Vec::with_capacity(compiled.set_layouts.len());
        for desc in &compiled.set_layouts {
            set_layouts.push(self.set_layout(backend, desc)?);
        }
        let pipeline_layout = self.pipeline_layout(backend, &set_layouts)?;

        let handle = self.programs.insert(ShaderProgram {
            name: name.to_string(),
            qualified_name: qualified_name.to_string(),
            defines: defines.to_vec(),
            key: compiled.key,
            kind: compiled.kind,
            modules,
            table: compiled.table,
            set_descs: compiled.set_layouts,
            set_layouts,
            pipeline_layout,
            block_sizes: compiled.block_sizes,
            vertex_inputs: compiled.vertex_inputs,
            writes_storage: compiled.writes_storage,
            uses: 1,
        });
        self.by_key.insert(compiled.key, handle);
        Ok(handle)
    }

    fn set_layout(
        &mut self,
        backend: &mut dyn GpuBackend,
        desc: &SetLayoutDesc,
    ) -> RhiResult<RawSetLayout> {
        if let Some(&layout) = self.set_layouts.get(desc) {
            return Ok(layout);
        }
        let layout = backend.create_set_layout(desc)?;
        self.set_layouts.insert(desc.clone(), layout);
        Ok(layout)
    }

    fn pipeline_layout(
        &mut self,
        backend: &mut dyn GpuBackend,
        sets: &[RawSetLayout],
    ) -> RhiResult<RawPipelineLayout> {
        if let Some(&layout) = self.pipeline_layouts.get(sets) {
            return Ok(layout);
        }
        let layout = backend.create_pipeline_layout(sets)?;
        self.pipeline_layouts.insert(sets.to_vec(), layout);
        Ok(layout)
    }

    /// Drops one use. At zero the program's modules are destroyed and the
    /// handle becomes invalid. Returns true if that happened.
    pub fn release(&mut self, backend: &mut dyn GpuBackend, handle: ShaderHandle) -> bool {
        let program = self
            .programs
            .get_mut(handle)
            .unwrap_or_else(|| panic!("release of a destroyed shader"));
        program.uses -= 1;
        if program.uses > 0 {
            return false;
        }

        if let Some(program) = self.programs.remove(handle) {
            self.by_key.remove(&program.key);
            for (_, module) in program.modules {
                backend.destroy_shader_module(module);
            }
            debug!("Released shader '{}'", program.name);
        }
        true
    }

    /// Looks up a live program. Panics on a destroyed handle.
    pub fn get(&self, handle: ShaderHandle) -> &ShaderProgram {
        self.programs
            .get(handle)
            .unwrap_or_else(|| panic!("shader handle {:?} was destroyed", handle))
    }

    pub fn contains(&self, handle: ShaderHandle) -> bool {
        self.programs.contains_key(handle)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn set_layout_count(&self) -> usize {
        self.set_layouts.len()
    }

    pub fn pipeline_layout_count(&self) -> usize {
        self.pipeline_layouts.len()
    }

    /// Destroys every module and layout regardless of use counts.
    pub fn destroy_all(&mut self, backend: &mut dyn GpuBackend) {
        for (_, program) in self.programs.drain() {
            for (_, module) in program.modules {
                backend.destroy_shader_module(module);
            }
        }
        self.by_key.clear();
        for (_, layout) in self.pipeline_layouts.drain() {
            backend.destroy_pipeline_layout(layout);
        }
        for (_, layout) in self.set_layouts.drain() {
            backend.destroy_set_layout(layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::error::RhiError;
    use crate::shader::{MemoryResolver, ShaderError};

    const DOUBLE: &str = "\
layout(local_size_x = 64) in;
layout(set = 0, binding = 0) buffer Data { float values[]; };
void compute() { values[gl_GlobalInvocationID.x] *= 2.0; }
";

    const TRIPLE: &str = "\
layout(local_size_x = 64) in;
layout(set = 0, binding = 0) buffer Data { float values[]; };
void compute() { values[gl_GlobalInvocationID.x] *= 3.0; }
";

    fn fixture() -> (HeadlessBackend, MemoryResolver) {
        let resolver = MemoryResolver::new()
            .with("double", DOUBLE)
            .with("triple", TRIPLE)
            .with("empty", "float f() { return 0.0; }\n");
        (HeadlessBackend::new(), resolver)
    }

    #[test]
    fn test_same_source_and_defines_share_a_program() {
        let (mut backend, resolver) = fixture();
        let probe = backend.probe();
        let mut cache = ShaderCache::new();

        let first = cache.acquire(&mut backend, &resolver, "double", &[]).unwrap();
        let second = cache.acquire(&mut backend, &resolver, "double", &[]).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.get(first).uses(), 2);
        assert_eq!(probe.stats().shader_modules_created, 1);

        let defined = cache
            .acquire(&mut backend, &resolver, "double", &["FAST".to_string()])
            .unwrap();
        assert_ne!(first, defined);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_release_destroys_modules_at_zero() {
        let (mut backend, resolver) = fixture();
        let probe = backend.probe();
        let mut cache = ShaderCache::new();

        let handle = cache.acquire(&mut backend, &resolver, "double", &[]).unwrap();
        cache.acquire(&mut backend, &resolver, "double", &[]).unwrap();
        assert_eq!(probe.stats().live_shader_modules, 1);

        assert!(!cache.release(&mut backend, handle));
        assert_eq!(probe.stats().live_shader_modules, 1);
        assert!(cache.contains(handle));

        assert!(cache.release(&mut backend, handle));
        assert_eq!(probe.stats().live_shader_modules, 0);
        assert!(!cache.contains(handle));
    }

    #[test]
    fn test_layouts_are_shared_across_programs() {
        let (mut backend, resolver) = fixture();
        let mut cache = ShaderCache::new();

        let double = cache.acquire(&mut backend, &resolver, "double", &[]).unwrap();
        let triple = cache.acquire(&mut backend, &resolver, "triple", &[]).unwrap();
        assert_ne!(double, triple);
        assert_eq!(cache.set_layout_count(), 1);
        assert_eq!(cache.pipeline_layout_count(), 1);
        assert_eq!(
            cache.get(double).pipeline_layout,
            cache.get(triple).pipeline_layout
        );
    }

    #[test]
    fn test_compile_failure_is_a_shader_error() {
        let (mut backend, resolver) = fixture();
        let mut cache = ShaderCache::new();

        let err = cache
            .acquire(&mut backend, &resolver, "empty", &[])
            .unwrap_err();
        assert!(matches!(err, RhiError::Shader(ShaderError::NoEntryPoints)));

        let err = cache
            .acquire(&mut backend, &resolver, "missing", &[])
            .unwrap_err();
        assert!(matches!(err, RhiError::Shader(ShaderError::NotFound(_))));
        assert!(cache.is_empty());
    }
}
