//! Single-file shader dialect.
//!
//! One source holds every stage. Stages are marked by the functions
//! `void vertex()`, `void fragment()` and `void compute()`, and interface
//! variables use stage-neutral qualifiers:
//!
//! | qualifier   | vertex stage | fragment stage |
//! |-------------|--------------|----------------|
//! | `attribute` | `in`         | removed        |
//! | `varying`   | `out`        | `in`           |
//! | `out`       | removed      | `out`          |
//!
//! Removed lines and functions are blanked rather than deleted so compiler
//! diagnostics keep the author's line numbers.

use super::{ShaderError, ShaderStage};

/// Lines prepended before the author's first line.
pub(crate) const PREAMBLE_LINES: u32 = 1;

/// Which stages a source provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoints {
    Graphics,
    Compute,
}

impl EntryPoints {
    pub fn stages(self) -> &'static [ShaderStage] {
        match self {
            EntryPoints::Graphics => &[ShaderStage::Vertex, ShaderStage::Fragment],
            EntryPoints::Compute => &[ShaderStage::Compute],
        }
    }
}

/// Detects the entry-point combination. Vertex with fragment, or compute
/// alone; anything else is rejected.
pub fn detect_entry_points(source: &str) -> Result<EntryPoints, ShaderError> {
    let has = |stage: ShaderStage| find_function(source, stage.entry_name()).is_some();
    match (
        has(ShaderStage::Vertex),
        has(ShaderStage::Fragment),
        has(ShaderStage::Compute),
    ) {
        (true, true, false) => Ok(EntryPoints::Graphics),
        (false, false, true) => Ok(EntryPoints::Compute),
        _ => Err(ShaderError::NoEntryPoints),
    }
}

/// Produces the GLSL compiled for `stage`.
pub fn stage_source(source: &str, stage: ShaderStage, entries: EntryPoints) -> String {
    let mut body = rewrite_qualifiers(source, stage);
    for other in entries.stages() {
        if *other != stage {
            body = blank_function(&body, other.entry_name());
        }
    }

    format!(
        "#version 450\n{}\nvoid main() {{ {}(); }}\n",
        body,
        stage.entry_name()
    )
}

/// Byte offset of the line declaring `void <name>(`.
fn find_function(source: &str, name: &str) -> Option<usize> {
    let mut offset = 0;
    for line in source.split_inclusive('\n') {
        if declares_function(line, name) {
            return Some(offset);
        }
        offset += line.len();
    }
    None
}

fn declares_function(line: &str, name: &str) -> bool {
    let Some(rest) = line.trim_start().strip_prefix("void") else {
        return false;
    };
    if !rest.starts_with(char::is_whitespace) {
        return false;
    }
    rest.trim_start()
        .strip_prefix(name)
        .is_some_and(|after| after.trim_start().starts_with('('))
}

/// Replaces `void <name>(...) { ... }` with as many blank lines as it spanned.
fn blank_function(source: &str, name: &str) -> String {
    let Some(start) = find_function(source, name) else {
        return source.to_string();
    };
    let Some(open) = source[start..].find('{').map(|i| start + i) else {
        return source.to_string();
    };

    let mut depth = 0usize;
    let mut end = None;
    for (i, c) in source[open..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(open + i + 1);
                    break;
                }
            }
            _ => {}
        }
    }
    // Unbalanced braces are left for the compiler to report.
    let Some(end) = end else {
        return source.to_string();
    };

    let newlines = source[start..end].matches('\n').count();
    let mut out = String::with_capacity(source.len());
    out.push_str(&source[..start]);
    out.extend(std::iter::repeat_n('\n', newlines));
    out.push_str(&source[end..]);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Qualifier {
    Attribute,
    Varying,
    Out,
}

enum Rewrite {
    Keep,
    Replace(&'static str),
    Drop,
}

fn rewrite_for(stage: ShaderStage, qualifier: Qualifier) -> Rewrite {
    match (stage, qualifier) {
        (ShaderStage::Vertex, Qualifier::Attribute) => Rewrite::Replace("in"),
        (ShaderStage::Vertex, Qualifier::Varying) => Rewrite::Replace("out"),
        (ShaderStage::Vertex, Qualifier::Out) => Rewrite::Drop,
        (ShaderStage::Fragment, Qualifier::Attribute) => Rewrite::Drop,
        (ShaderStage::Fragment, Qualifier::Varying) => Rewrite::Replace("in"),
        (ShaderStage::Fragment, Qualifier::Out) => Rewrite::Keep,
        (ShaderStage::Compute, _) => Rewrite::Keep,
    }
}

/// Applies the qualifier table to global-scope declarations and blanks any
/// `#version` line.
fn rewrite_qualifiers(source: &str, stage: ShaderStage) -> String {
    let mut out = String::with_capacity(source.len());
    let mut depth = (0i32, 0i32);

    for line in source.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("#version") {
            out.push('\n');
            continue;
        }

        let rewritten = if depth == (0, 0) {
            match interface_qualifier(line) {
                Some((at, qualifier)) => {
                    let len = match qualifier {
                        Qualifier::Attribute => "attribute".len(),
                        Qualifier::Varying => "varying".len(),
                        Qualifier::Out => "out".len(),
                    };
                    match rewrite_for(stage, qualifier) {
                        Rewrite::Keep => Some(line.to_string()),
                        Rewrite::Replace(with) => {
                            Some(format!("{}{}{}", &line[..at], with, &line[at + len..]))
                        }
                        Rewrite::Drop => None,
                    }
                }
                None => Some(line.to_string()),
            }
        } else {
            Some(line.to_string())
        };

        if let Some(rewritten) = rewritten {
            out.push_str(&rewritten);
        }
        out.push('\n');

        let (braces, parens) = scope_delta(line);
        depth.0 += braces;
        depth.1 += parens;
    }

    out
}

/// Net change in brace and parenthesis depth on a line, ignoring `//`
/// comments.
fn scope_delta(line: &str) -> (i32, i32) {
    let code = line.split("//").next().unwrap_or(line);
    code.chars().fold((0, 0), |(braces, parens), c| match c {
        '{' => (braces + 1, parens),
        '}' => (braces - 1, parens),
        '(' => (braces, parens + 1),
        ')' => (braces, parens - 1),
        _ => (braces, parens),
    })
}

/// Finds a leading interface qualifier, skipping an optional `layout(...)`
/// and interpolation qualifiers. Returns its byte offset in `line`.
fn interface_qualifier(line: &str) -> Option<(usize, Qualifier)> {
    let mut pos = line.len() - line.trim_start().len();

    if line[pos..].starts_with("layout") {
        let open = pos + line[pos..].find('(')?;
        let close = open + line[open..].find(')')?;
        pos = close + 1;
    }

    loop {
        pos += line[pos..].len() - line[pos..].trim_start().len();
        let word_len = line[pos..]
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(line.len() - pos);
        let word = &line[pos..pos + word_len];

        match word {
            "flat" | "smooth" | "noperspective" => pos += word_len,
            "attribute" => return Some((pos, Qualifier::Attribute)),
            "varying" => return Some((pos, Qualifier::Varying)),
            "out" => return Some((pos, Qualifier::Out)),
            _ => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "\
layout(location = 0) attribute vec3 a_Position;
layout(location = 0) varying vec2 v_Uv;
layout(location = 0) out vec4 o_Color;

void vertex() {
    v_Uv = a_Position.xy;
    gl_Position = vec4(a_Position, 1.0);
}

void fragment() {
    o_Color = vec4(v_Uv, 0.0, 1.0);
}
";

    #[test]
    fn test_detect_graphics() {
        assert_eq!(detect_entry_points(SOURCE).unwrap(), EntryPoints::Graphics);
    }

    #[test]
    fn test_detect_compute() {
        let source = "layout(local_size_x = 8) in;\nvoid compute() {}\n";
        assert_eq!(detect_entry_points(source).unwrap(), EntryPoints::Compute);
    }

    #[test]
    fn test_detect_rejects_bad_combinations() {
        for source in [
            "void main() {}",
            "void vertex() {}",
            "void fragment() {}",
            "void vertex() {}\nvoid fragment() {}\nvoid compute() {}",
            "void vertex_helper() {}\nvoid fragment() {}",
        ] {
            assert!(matches!(
                detect_entry_points(source),
                Err(ShaderError::NoEntryPoints)
            ));
        }
    }

    #[test]
    fn test_vertex_stage_rewrite() {
        let out = stage_source(SOURCE, ShaderStage::Vertex, EntryPoints::Graphics);
        assert!(out.starts_with("#version 450\n"));
        assert!(out.contains("layout(location = 0) in vec3 a_Position;"));
        assert!(out.contains("layout(location = 0) out vec2 v_Uv;"));
        assert!(!out.contains("o_Color"));
        assert!(!out.contains("void fragment()"));
        assert!(out.contains("void vertex()"));
        assert!(out.trim_end().ends_with("void main() { vertex(); }"));
    }

    #[test]
    fn test_fragment_stage_rewrite() {
        let out = stage_source(SOURCE, ShaderStage::Fragment, EntryPoints::Graphics);
        assert!(!out.contains("a_Position;"));
        assert!(out.contains("layout(location = 0) in vec2 v_Uv;"));
        assert!(out.contains("layout(location = 0) out vec4 o_Color;"));
        assert!(!out.contains("void vertex()"));
        assert!(out.trim_end().ends_with("void main() { fragment(); }"));
    }

    #[test]
    fn test_line_numbers_are_preserved() {
        let out = stage_source(SOURCE, ShaderStage::Fragment, EntryPoints::Graphics);
        let lines: Vec<&str> = out.lines().collect();
        // Source line 11 (1-based) is the body of fragment().
        let line = lines[(11 + PREAMBLE_LINES - 1) as usize];
        assert_eq!(line.trim(), "o_Color = vec4(v_Uv, 0.0, 1.0);");
    }

    #[test]
    fn test_nested_braces_are_matched() {
        let source = "void vertex() {\n    if (true) { x(); }\n}\nvoid fragment() {}\n";
        let out = blank_function(source, "vertex");
        assert_eq!(out, "\n\n\nvoid fragment() {}\n");
    }

    #[test]
    fn test_qualifiers_inside_functions_are_untouched() {
        let source = "void helper(\n    out float x) {\n}\nvoid vertex() {\n    varying_count = 1;\n}\n";
        let out = rewrite_qualifiers(source, ShaderStage::Vertex);
        assert!(out.contains("    out float x) {"));
        assert!(out.contains("    varying_count = 1;"));
    }

    #[test]
    fn test_interpolation_qualifier_is_skipped() {
        let (at, qualifier) = interface_qualifier("layout(location = 1) flat varying int v_Id;").unwrap();
        assert_eq!(qualifier, Qualifier::Varying);
        assert_eq!(at, "layout(location = 1) flat ".len());
    }

    #[test]
    fn test_version_line_is_blanked() {
        let out = rewrite_qualifiers("#version 460\nfloat x;\n", ShaderStage::Compute);
        assert_eq!(out, "\nfloat x;\n");
    }
}
