//! OXC-based `TypeScript`/`JavaScript`/JSX transpilation with a compile cache.
//!
//! Pipeline for one file:
//! 1. Parse with OXC (flavor from the file extension: `.js`, `.mjs`, `.cjs`,
//!    `.ts`, `.mts`, `.jsx`, `.tsx`)
//! 2. Strip `TypeScript` types and lower JSX via `oxc_transformer`
//!    (classic runtime, `h` / `Fragment` pragmas)
//! 3. Generate JS with `oxc_codegen`
//! 4. Post-process ESM → CJS so the sandbox can run it as a plain function body
//!
//! Results are cached per path and invalidated when the file's modification
//! time or size changes, or explicitly via [`SourceTranspiler::invalidate`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use dashmap::DashMap;
use oxc::codegen::Codegen;
use oxc::parser::Parser;
use oxc::semantic::SemanticBuilder;
use oxc::span::SourceType;
use oxc::transformer::{JsxRuntime, TransformOptions, Transformer};
use tracing::{debug, warn};

use crate::error::{ExtensionError, ExtensionResult};

/// JSX factory the classic runtime calls.
pub const JSX_PRAGMA: &str = "h";
/// JSX fragment the classic runtime references.
pub const JSX_PRAGMA_FRAG: &str = "Fragment";

/// Output of a compile request.
#[derive(Debug, Clone)]
pub struct Compiled {
    /// Executable CJS-style `JavaScript`.
    pub code: Arc<str>,
    /// BLAKE3 hash of the original source, hex encoded.
    pub source_hash: String,
    /// Whether the result came from the cache.
    pub from_cache: bool,
}

/// Change detector for a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

impl Fingerprint {
    fn of(metadata: &std::fs::Metadata) -> Self {
        Self {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    fingerprint: Fingerprint,
    code: Arc<str>,
    source_hash: String,
}

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Compiles served from the cache.
    pub hits: u64,
    /// Compiles that ran the full pipeline.
    pub misses: u64,
    /// Entries currently cached.
    pub entries: usize,
}

/// Transpiles extension entry files, caching by path and fingerprint.
#[derive(Debug, Default)]
pub struct SourceTranspiler {
    cache: DashMap<PathBuf, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SourceTranspiler {
    /// Create a transpiler with an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile the file at `path`, reusing the cached output when the file
    /// is unchanged.
    ///
    /// # Errors
    ///
    /// - [`ExtensionError::EntryNotFound`] if the file does not exist
    /// - [`ExtensionError::CompileError`] if parsing or transformation fails
    /// - [`ExtensionError::Io`] for other read failures
    pub fn compile(&self, path: &Path) -> ExtensionResult<Compiled> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExtensionError::EntryNotFound(path.to_path_buf())
            } else {
                ExtensionError::Io(e)
            }
        })?;
        if !metadata.is_file() {
            return Err(ExtensionError::EntryNotFound(path.to_path_buf()));
        }
        let fingerprint = Fingerprint::of(&metadata);

        if let Some(entry) = self.cache.get(path)
            && entry.fingerprint == fingerprint
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(path = %path.display(), "Compile cache hit");
            return Ok(Compiled {
                code: Arc::clone(&entry.code),
                source_hash: entry.source_hash.clone(),
                from_cache: true,
            });
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let source = std::fs::read_to_string(path)?;
        let source_hash = blake3::hash(source.as_bytes()).to_hex().to_string();
        let code: Arc<str> = transpile(&source, path)?.into();
        debug!(
            path = %path.display(),
            source_bytes = source.len(),
            output_bytes = code.len(),
            "Compiled extension source"
        );

        self.cache.insert(
            path.to_path_buf(),
            CacheEntry {
                fingerprint,
                code: Arc::clone(&code),
                source_hash: source_hash.clone(),
            },
        );
        Ok(Compiled {
            code,
            source_hash,
            from_cache: false,
        })
    }

    /// Drop the cached output for `path`. Returns whether an entry existed.
    pub fn invalidate(&self, path: &Path) -> bool {
        self.cache.remove(path).is_some()
    }

    /// Drop every cached entry under `dir`.
    pub fn invalidate_dir(&self, dir: &Path) -> usize {
        let before = self.cache.len();
        self.cache.retain(|path, _| !path.starts_with(dir));
        before.saturating_sub(self.cache.len())
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Current cache counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.len(),
        }
    }
}

/// Transpile a JS/TS/JSX source string to CJS-compatible `JavaScript`.
///
/// `path` determines the source flavor and appears in error messages.
///
/// # Errors
///
/// Returns [`ExtensionError::CompileError`] if parsing or transformation fails.
pub fn transpile(source: &str, path: &Path) -> ExtensionResult<String> {
    let compile_error = |stage: &str, errors: Vec<String>| ExtensionError::CompileError {
        path: path.to_path_buf(),
        message: format!("{stage} errors:\n{}", errors.join("\n")),
    };

    let allocator = oxc_allocator::Allocator::default();
    let source_type = SourceType::from_path(path).unwrap_or_else(|_| SourceType::mjs());

    // 1. Parse
    let parse_ret = Parser::new(&allocator, source, source_type).parse();
    if parse_ret.panicked || !parse_ret.errors.is_empty() {
        let errors = parse_ret.errors.iter().map(|e| format!("{e}")).collect();
        return Err(compile_error("parse", errors));
    }
    let mut program = parse_ret.program;

    let imports = runtime_imports(&program);
    if !imports.is_empty() {
        warn!(
            path = %path.display(),
            modules = ?imports,
            "Extension imports modules; require() is unavailable in the sandbox"
        );
    }

    // 2. Semantic analysis + transform
    let scoping = SemanticBuilder::new()
        .with_excess_capacity(2.0)
        .build(&program)
        .semantic
        .into_scoping();

    let mut options = TransformOptions::default();
    options.jsx.runtime = JsxRuntime::Classic;
    options.jsx.pragma = Some(JSX_PRAGMA.to_owned());
    options.jsx.pragma_frag = Some(JSX_PRAGMA_FRAG.to_owned());

    let transform_ret =
        Transformer::new(&allocator, path, &options).build_with_scoping(scoping, &mut program);
    if !transform_ret.errors.is_empty() {
        let errors = transform_ret.errors.iter().map(|e| format!("{e}")).collect();
        return Err(compile_error("transform", errors));
    }

    // 3. Codegen, 4. ESM → CJS
    let js = Codegen::new().build(&program).code;
    Ok(esm_to_cjs(&js))
}

/// Module names of non-type import declarations.
fn runtime_imports(program: &oxc::ast::ast::Program) -> Vec<String> {
    program
        .body
        .iter()
        .filter_map(|stmt| match stmt {
            oxc::ast::ast::Statement::ImportDeclaration(decl) if !decl.import_kind.is_type() => {
                Some(decl.source.value.as_str().to_owned())
            },
            _ => None,
        })
        .collect()
}

/// Rewrite the ESM import/export forms codegen emits into CJS.
///
/// **Imports** become `require()` calls, which fail at runtime inside the
/// sandbox with a descriptive message.
///
/// **Exports:**
/// - `export default X` → `module.exports = X`
/// - `export [async] function name(` → declaration + `module.exports.name = name;`
/// - `export const|let|var name =` → declaration + `module.exports.name = name;`
/// - `export class Name` → declaration + `module.exports.Name = Name;`
/// - `export { a, b as c }` → `module.exports.a = a; module.exports.c = b;`
fn esm_to_cjs(js: &str) -> String {
    let mut output_lines = Vec::new();
    let mut deferred_exports: Vec<String> = Vec::new();

    for line in js.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with("import ") {
            if trimmed.contains(" from ")
                && let Some(converted) = convert_import_to_require(trimmed)
            {
                output_lines.push(converted);
                continue;
            }
            // Side-effect import: `import "mod";`
            if let Some(module) = trimmed
                .strip_prefix("import ")
                .map(|m| m.trim().trim_end_matches(';').trim())
                .filter(|m| m.starts_with(['"', '\'']))
            {
                output_lines.push(format!("require({module});"));
                continue;
            }
        }

        if let Some(rest) = trimmed.strip_prefix("export default ") {
            output_lines.push(format!("module.exports = {rest}"));
            continue;
        }

        if let Some((keyword, rest)) = strip_function_export(trimmed) {
            if let Some(paren_idx) = rest.find('(') {
                let name = rest[..paren_idx].trim().trim_start_matches('*').trim();
                deferred_exports.push(format!("module.exports.{name} = {name};"));
            }
            output_lines.push(format!("{keyword} {rest}"));
            continue;
        }

        if let Some((keyword, rest)) = strip_binding_export(trimmed) {
            if let Some(eq_idx) = rest.find('=') {
                let name = rest[..eq_idx].split(':').next().unwrap_or_default().trim();
                if !name.starts_with(['{', '[']) {
                    deferred_exports.push(format!("module.exports.{name} = {name};"));
                }
            }
            output_lines.push(format!("{keyword} {rest}"));
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("export {") {
            if let Some(brace_end) = rest.find('}') {
                for spec in rest[..brace_end].split(',') {
                    let spec = spec.trim();
                    if spec.is_empty() {
                        continue;
                    }
                    match spec.split_once(" as ") {
                        Some((local, exported)) => deferred_exports.push(format!(
                            "module.exports.{} = {};",
                            exported.trim(),
                            local.trim()
                        )),
                        None => deferred_exports.push(format!("module.exports.{spec} = {spec};")),
                    }
                }
            }
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("export class ") {
            if let Some(name_end) = rest.find([' ', '{']) {
                let name = rest[..name_end].trim();
                deferred_exports.push(format!("module.exports.{name} = {name};"));
            }
            output_lines.push(format!("class {rest}"));
            continue;
        }

        output_lines.push(line.to_string());
    }

    if !deferred_exports.is_empty() {
        output_lines.push(String::new());
        output_lines.extend(deferred_exports);
    }

    output_lines.join("\n")
}

fn strip_function_export(line: &str) -> Option<(&'static str, &str)> {
    line.strip_prefix("export async function ")
        .map(|rest| ("async function", rest))
        .or_else(|| {
            line.strip_prefix("export function ")
                .map(|rest| ("function", rest))
        })
}

fn strip_binding_export(line: &str) -> Option<(&'static str, &str)> {
    ["const", "let", "var"].into_iter().find_map(|keyword| {
        line.strip_prefix("export ")
            .and_then(|rest| rest.strip_prefix(keyword))
            .and_then(|rest| rest.strip_prefix(' '))
            .map(|rest| (keyword, rest))
    })
}

/// Convert an ESM import statement to a CJS `require()` call.
///
/// Returns `None` if the line doesn't match a recognized import pattern.
fn convert_import_to_require(line: &str) -> Option<String> {
    let (specifier_part, module_part) = line.split_once(" from ")?;

    let module = module_part
        .trim()
        .trim_end_matches(';')
        .trim()
        .trim_matches('"')
        .trim_matches('\'');

    let specifier = specifier_part.strip_prefix("import ")?.trim();

    if let Some(name) = specifier.strip_prefix("* as ") {
        let name = name.trim();
        return Some(format!("const {name} = require(\"{module}\");"));
    }

    if specifier.starts_with('{') && specifier.ends_with('}') {
        let destructure = specifier.replace(" as ", ": ");
        return Some(format!("const {destructure} = require(\"{module}\");"));
    }

    if !specifier.contains('{') {
        let name = specifier.trim();
        return Some(format!("const {name} = require(\"{module}\");"));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_str(source: &str, file: &str) -> String {
        transpile(source, Path::new(file)).unwrap()
    }

    #[test]
    fn test_plain_js_passthrough() {
        let result = compile_str("const x = 42;\nconsole.log(x);\n", "index.js");
        assert!(result.contains("const x = 42"));
        assert!(result.contains("console.log(x)"));
    }

    #[test]
    fn test_ts_strips_types() {
        let source = r#"
interface Product { id: number; name: string }
export async function init(utils: any): Promise<void> {
    const p: Product = { id: 1, name: "x" };
    utils.log(p.name as string);
}
"#;
        let result = compile_str(source, "index.ts");
        assert!(!result.contains("interface Product"));
        assert!(!result.contains(": Product"));
        assert!(result.contains("async function init(utils)"), "got: {result}");
        assert!(result.contains("module.exports.init = init;"), "got: {result}");
    }

    #[test]
    fn test_jsx_uses_classic_pragma() {
        let source = "const view = <div class=\"x\">hi</div>;\n";
        let result = compile_str(source, "view.jsx");
        assert!(result.contains("h(\"div\""), "got: {result}");
    }

    #[test]
    fn test_imports_become_require() {
        let source = "import { a } from \"lib\";\nconsole.log(a);\n";
        let result = compile_str(source, "index.js");
        assert!(result.contains("require(\"lib\")"), "got: {result}");
    }

    #[test]
    fn test_syntax_error_is_compile_error() {
        let err = transpile("function (", Path::new("broken.js")).unwrap_err();
        assert!(matches!(err, ExtensionError::CompileError { .. }));
        assert!(err.to_string().contains("broken.js"));
    }

    #[test]
    fn test_esm_to_cjs_export_default() {
        let output = esm_to_cjs("export default function activate(ctx) {\n  return ctx;\n}\n");
        assert!(output.contains("module.exports = function activate(ctx)"));
    }

    #[test]
    fn test_esm_to_cjs_export_const_and_list() {
        let output = esm_to_cjs("export const VERSION = \"1\";\nconst a = 1;\nexport { a as b };\n");
        assert!(output.contains("const VERSION = \"1\""));
        assert!(output.contains("module.exports.VERSION = VERSION;"));
        assert!(output.contains("module.exports.b = a;"));
        assert!(!output.contains("export"));
    }

    #[test]
    fn test_esm_to_cjs_export_let_not_confused_with_letter() {
        let output = esm_to_cjs("export letter = 1;\n");
        assert!(!output.contains("module.exports.ter"));
    }

    #[test]
    fn test_convert_import_renames() {
        assert_eq!(
            convert_import_to_require(r#"import { join as j, dirname } from "node:path";"#)
                .as_deref(),
            Some(r#"const { join: j, dirname } = require("node:path");"#)
        );
        assert!(convert_import_to_require("const x = 42;").is_none());
    }

    #[test]
    fn test_cache_hit_and_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("index.js");
        std::fs::write(&file, "module.exports.init = () => 1;\n").unwrap();
        let transpiler = SourceTranspiler::new();

        let first = transpiler.compile(&file).unwrap();
        assert!(!first.from_cache);
        let second = transpiler.compile(&file).unwrap();
        assert!(second.from_cache);
        assert_eq!(first.source_hash, second.source_hash);

        assert!(transpiler.invalidate(&file));
        assert!(!transpiler.compile(&file).unwrap().from_cache);

        let stats = transpiler.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_cache_miss_on_edit() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("index.js");
        std::fs::write(&file, "module.exports.v = 1;\n").unwrap();
        let transpiler = SourceTranspiler::new();
        transpiler.compile(&file).unwrap();

        std::fs::write(&file, "module.exports.v = 22;\n").unwrap();
        let edited = transpiler.compile(&file).unwrap();
        assert!(!edited.from_cache);
        assert!(edited.code.contains("22"));
    }

    #[test]
    fn test_missing_file() {
        let transpiler = SourceTranspiler::new();
        assert!(matches!(
            transpiler.compile(Path::new("/nonexistent/index.js")),
            Err(ExtensionError::EntryNotFound(_))
        ));
    }

    #[test]
    fn test_invalidate_dir_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.js", "b.js"] {
            std::fs::write(dir.path().join(name), "1;\n").unwrap();
        }
        let transpiler = SourceTranspiler::new();
        transpiler.compile(&dir.path().join("a.js")).unwrap();
        transpiler.compile(&dir.path().join("b.js")).unwrap();
        assert_eq!(transpiler.invalidate_dir(dir.path()), 2);
        transpiler.compile(&dir.path().join("a.js")).unwrap();
        transpiler.clear();
        assert_eq!(transpiler.stats().entries, 0);
    }
}
