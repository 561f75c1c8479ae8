//! Shader source resolution.
//!
//! The device never touches the file system directly; it asks a
//! [`ShaderResolver`] for source text by name. `#include "name"` lines are
//! expanded through the same resolver.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use super::ShaderError;

/// Source text returned by a resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub source: String,
    /// Fully qualified name for diagnostics, e.g. the file path.
    pub qualified_name: String,
}

/// Looks up shader source by name.
pub trait ShaderResolver {
    /// Returns `None` if no source exists under `name`.
    fn resolve(&self, name: &str) -> Option<ResolvedSource>;
}

/// Reads `<root>/<name>.<extension>`.
#[derive(Debug, Clone)]
pub struct FileResolver {
    root: PathBuf,
    extension: String,
}

impl FileResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: "glsl".to_string(),
        }
    }

    /// Resolver rooted at `LUMEN_SHADER_ROOT`, falling back to `./shaders`.
    pub fn from_env() -> Self {
        Self::new(lumen_core::default_shader_root())
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ShaderResolver for FileResolver {
    fn resolve(&self, name: &str) -> Option<ResolvedSource> {
        let path = self.root.join(format!("{}.{}", name, self.extension));
        match std::fs::read_to_string(&path) {
            Ok(source) => Some(ResolvedSource {
                source,
                qualified_name: path.display().to_string(),
            }),
            Err(e) => {
                debug!("Shader `{}` not readable at {}: {}", name, path.display(), e);
                None
            }
        }
    }
}

/// In-memory sources. Clones share the same map, so a caller can keep a
/// handle and edit sources after giving the resolver to a device.
#[derive(Debug, Clone, Default)]
pub struct MemoryResolver {
    sources: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.insert(name, source);
        self
    }

    pub fn insert(&self, name: impl Into<String>, source: impl Into<String>) {
        self.sources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.into(), source.into());
    }

    pub fn remove(&self, name: &str) {
        self.sources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name);
    }
}

impl ShaderResolver for MemoryResolver {
    fn resolve(&self, name: &str) -> Option<ResolvedSource> {
        let sources = self
            .sources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sources.get(name).map(|source| ResolvedSource {
            source: source.clone(),
            qualified_name: format!("memory:{}", name),
        })
    }
}

/// Resolves `name` and recursively splices every `#include` into it.
pub fn resolve_with_includes(
    resolver: &dyn ShaderResolver,
    name: &str,
) -> Result<ResolvedSource, ShaderError> {
    let root = resolver
        .resolve(name)
        .ok_or_else(|| ShaderError::NotFound(name.to_string()))?;

    let mut stack = vec![name.to_string()];
    let source = expand(resolver, &root.source, &mut stack)?;

    Ok(ResolvedSource {
        source,
        qualified_name: root.qualified_name,
    })
}

fn expand(
    resolver: &dyn ShaderResolver,
    source: &str,
    stack: &mut Vec<String>,
) -> Result<String, ShaderError> {
    let mut out = String::with_capacity(source.len());

    for line in source.lines() {
        let Some(include) = parse_include(line) else {
            out.push_str(line);
            out.push('\n');
            continue;
        };

        if stack.iter().any(|open| open == include) {
            return Err(ShaderError::IncludeCycle(include.to_string()));
        }

        let from = stack.last().cloned().unwrap_or_default();
        let resolved = resolver
            .resolve(include)
            .ok_or_else(|| ShaderError::MissingInclude {
                include: include.to_string(),
                from,
            })?;
        trace!("Expanding include `{}`", include);

        stack.push(include.to_string());
        let expanded = expand(resolver, &resolved.source, stack)?;
        stack.pop();

        out.push_str(&expanded);
    }

    Ok(out)
}

/// Returns the include target of an `#include "name"` or `#include <name>`
/// line, without a trailing `.glsl`.
fn parse_include(line: &str) -> Option<&str> {
    let rest = line.trim().strip_prefix("#include")?.trim();
    let inner = rest
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .or_else(|| rest.strip_prefix('<').and_then(|r| r.strip_suffix('>')))?;
    Some(inner.strip_suffix(".glsl").unwrap_or(inner))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_include() {
        assert_eq!(parse_include("#include \"common\""), Some("common"));
        assert_eq!(parse_include("  #include <lib/noise.glsl>"), Some("lib/noise"));
        assert_eq!(parse_include("#include common"), None);
        assert_eq!(parse_include("// #include \"x\""), None);
    }

    #[test]
    fn test_nested_includes_are_expanded() {
        let resolver = MemoryResolver::new()
            .with("main", "#include \"a\"\nvoid main() {}\n")
            .with("a", "#include \"b\"\nfloat a;\n")
            .with("b", "float b;\n");

        let resolved = resolve_with_includes(&resolver, "main").unwrap();
        assert_eq!(resolved.source, "float b;\nfloat a;\nvoid main() {}\n");
        assert_eq!(resolved.qualified_name, "memory:main");
    }

    #[test]
    fn test_include_cycle_is_an_error() {
        let resolver = MemoryResolver::new()
            .with("a", "#include \"b\"\n")
            .with("b", "#include \"a\"\n");

        let err = resolve_with_includes(&resolver, "a").unwrap_err();
        assert!(matches!(err, ShaderError::IncludeCycle(name) if name == "a"));
    }

    #[test]
    fn test_missing_include() {
        let resolver = MemoryResolver::new().with("a", "#include \"nope\"\n");
        let err = resolve_with_includes(&resolver, "a").unwrap_err();
        assert!(matches!(err, ShaderError::MissingInclude { include, from } if include == "nope" && from == "a"));
    }

    #[test]
    fn test_missing_root() {
        let err = resolve_with_includes(&MemoryResolver::new(), "ghost").unwrap_err();
        assert!(matches!(err, ShaderError::NotFound(name) if name == "ghost"));
    }

    #[test]
    fn test_file_resolver_reads_from_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blit.glsl"), "void compute() {}\n").unwrap();

        let resolver = FileResolver::new(dir.path());
        let resolved = resolver.resolve("blit").unwrap();
        assert_eq!(resolved.source, "void compute() {}\n");
        assert!(resolved.qualified_name.ends_with("blit.glsl"));
        assert!(resolver.resolve("missing").is_none());
    }

    #[test]
    fn test_memory_resolver_clones_share_sources() {
        let resolver = MemoryResolver::new();
        let handle = resolver.clone();
        handle.insert("late", "x");
        assert_eq!(resolver.resolve("late").unwrap().source, "x");
        handle.remove("late");
        assert!(resolver.resolve("late").is_none());
    }
}
