use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rhai::{Dynamic, Engine, EvalAltResult, Module, ModuleResolver, Position, Scope};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SandboxError;
use crate::exports::Exports;
use crate::unit::SourceUnit;

/// Namespace under which a module's exports are reachable during [`Sandbox::call`].
/// 呼叫匯出函式時，模組所掛載的命名空間。
const EXPORTS_NAMESPACE: &str = "exports";

/// Extension appended to import requests that name no extension.
/// 匯入請求未帶副檔名時補上的預設副檔名。
pub const DEFAULT_EXTENSION: &str = "rhai";

/// Resource limits applied to every engine the sandbox creates.
/// 沙箱建立的每個引擎都會套用的資源限制。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLimits {
    /// Operation budget per evaluation (0 = unlimited).
    #[serde(default)]
    pub max_operations: u64,
    #[serde(default = "default_call_depth")]
    pub max_call_depth: usize,
    #[serde(default = "default_expr_depth")]
    pub max_expr_depth: usize,
    #[serde(default = "default_function_expr_depth")]
    pub max_function_expr_depth: usize,
    /// Longest string a script may build (0 = unlimited).
    #[serde(default)]
    pub max_string_size: usize,
}

fn default_call_depth() -> usize {
    64
}

fn default_expr_depth() -> usize {
    64
}

fn default_function_expr_depth() -> usize {
    32
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_operations: 0,
            max_call_depth: default_call_depth(),
            max_expr_depth: default_expr_depth(),
            max_function_expr_depth: default_function_expr_depth(),
            max_string_size: 0,
        }
    }
}

impl SandboxLimits {
    pub fn sanitize(&mut self) {
        if self.max_call_depth == 0 {
            self.max_call_depth = default_call_depth();
        }
        if self.max_expr_depth == 0 {
            self.max_expr_depth = default_expr_depth();
        }
        if self.max_function_expr_depth == 0 {
            self.max_function_expr_depth = default_function_expr_depth();
        }
    }
}

/// Loads modules requested by `import` statements once the sandbox has
/// resolved the requested name.
/// 於沙箱解析匯入名稱後，負責實際載入模組。
///
/// Relative names (`./x`, `../x`) arrive as absolute, normalized paths;
/// every other name arrives unchanged.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, request: &Path) -> Result<Exports, SandboxError>;
}

/// Bindings made available to a module's `import` statements.
/// 提供給模組 `import` 敘述使用的綁定。
#[derive(Clone)]
pub struct ImportContext {
    overrides: BTreeMap<String, Exports>,
    loader: Arc<dyn ModuleLoader>,
}

impl ImportContext {
    pub fn new(loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            overrides: BTreeMap::new(),
            loader,
        }
    }

    /// Context that loads straight from disk without any caching.
    pub fn direct(sandbox: &Sandbox) -> Self {
        Self::new(Arc::new(DirectLoader::new(sandbox.clone())))
    }

    /// Serves `exports` for `import "<name>"` instead of loading anything.
    /// 對 `import "<name>"` 直接提供 `exports`，不進行任何載入。
    pub fn with_override(mut self, name: impl Into<String>, exports: Exports) -> Self {
        self.overrides.insert(name.into(), exports);
        self
    }
}

impl fmt::Debug for ImportContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportContext")
            .field("overrides", &self.overrides.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Outcome of invoking an exported function.
/// 呼叫匯出函式後的結果。
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub value: Dynamic,
    /// Lines printed by the function.
    /// 函式輸出的訊息。
    pub output: Vec<String>,
}

/// Runs scripts in isolated engines. Each run gets a fresh engine, so no
/// binding survives from one module to the next or reaches the host.
/// 在隔離的引擎中執行腳本；每次執行都使用新的引擎，綁定不會外洩。
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    limits: SandboxLimits,
}

impl Sandbox {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    /// Parses `text` as the contents of `path`.
    /// 將 `text` 當作 `path` 的內容進行解析。
    pub fn compile(&self, text: &str, path: &Path) -> Result<SourceUnit, SandboxError> {
        let engine = self.engine(path, &OutputSink::default());
        let mut ast = engine.compile(text).map_err(|err| SandboxError::Compile {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        ast.set_source(path.to_string_lossy().into_owned());
        Ok(SourceUnit::new(ast, path.to_path_buf()))
    }

    /// Evaluates `unit` as if it were the file at `logical_path` and returns
    /// its exports. Relative imports resolve against `logical_path`'s
    /// directory whether or not that file exists.
    /// 以 `logical_path` 的身分執行 `unit` 並回傳其匯出；相對匯入一律以該路徑所在目錄解析。
    pub fn run(
        &self,
        unit: &SourceUnit,
        logical_path: &Path,
        imports: &ImportContext,
    ) -> Result<Exports, SandboxError> {
        let sink = OutputSink::default();
        let mut engine = self.engine(logical_path, &sink);
        engine.set_module_resolver(ScopedResolver {
            base_dir: parent_dir(logical_path),
            overrides: imports.overrides.clone(),
            loader: Arc::clone(&imports.loader),
        });

        let mut ast = unit.ast().clone();
        ast.set_source(logical_path.to_string_lossy().into_owned());
        let module = Module::eval_ast_as_new(Scope::new(), &ast, &engine).map_err(|err| {
            SandboxError::Execution {
                path: logical_path.to_path_buf(),
                reason: err.to_string(),
            }
        })?;
        debug!(
            target: "verlay::sandbox",
            module = %logical_path.display(),
            origin = %unit.origin().display(),
            "module evaluated"
        );
        Ok(Exports::new(module, logical_path, sink.take()))
    }

    /// Compiles and runs `text` in one step.
    pub fn run_source(
        &self,
        text: &str,
        logical_path: &Path,
        imports: &ImportContext,
    ) -> Result<Exports, SandboxError> {
        let unit = self.compile(text, logical_path)?;
        self.run(&unit, logical_path, imports)
    }

    /// Invokes `function` exported by `exports` with `args`. Imports inside
    /// the function body resolve through `imports`, relative to the module's
    /// path. Errors raised by the function, including explicit `throw`s,
    /// surface as [`SandboxError::Call`].
    /// 以 `args` 呼叫 `exports` 匯出的 `function`；函式內的匯入經由 `imports` 解析，
    /// 函式丟出的錯誤會以 [`SandboxError::Call`] 回報。
    pub fn call(
        &self,
        exports: &Exports,
        function: &str,
        args: Vec<Dynamic>,
        imports: &ImportContext,
    ) -> Result<CallOutcome, SandboxError> {
        if !is_identifier(function) {
            return Err(SandboxError::InvalidFunctionName(function.to_string()));
        }

        let sink = OutputSink::default();
        let mut engine = self.engine(exports.origin(), &sink);
        engine.set_module_resolver(ScopedResolver {
            base_dir: parent_dir(exports.origin()),
            overrides: imports.overrides.clone(),
            loader: Arc::clone(&imports.loader),
        });
        engine.register_static_module(EXPORTS_NAMESPACE, Arc::clone(exports.module()));

        let mut scope = Scope::new();
        let mut params = Vec::with_capacity(args.len());
        for (index, arg) in args.into_iter().enumerate() {
            let name = format!("arg{index}");
            scope.push_dynamic(name.as_str(), arg);
            params.push(name);
        }
        let script = format!("{EXPORTS_NAMESPACE}::{function}({})", params.join(", "));

        let value = engine
            .eval_with_scope::<Dynamic>(&mut scope, &script)
            .map_err(|err| SandboxError::Call {
                path: exports.origin().to_path_buf(),
                function: function.to_string(),
                reason: err.to_string(),
            })?;
        Ok(CallOutcome {
            value,
            output: sink.take(),
        })
    }

    fn engine(&self, module_path: &Path, sink: &OutputSink) -> Engine {
        let mut engine = Engine::new();
        engine.set_max_operations(self.limits.max_operations);
        engine.set_max_call_levels(self.limits.max_call_depth);
        engine.set_max_expr_depths(
            self.limits.max_expr_depth,
            self.limits.max_function_expr_depth,
        );
        engine.set_max_string_size(self.limits.max_string_size);

        let module = module_path.display().to_string();
        let lines = sink.clone();
        engine.on_print(move |text| {
            debug!(target: "verlay::sandbox", module = %module, "{text}");
            lines.push(text.to_string());
        });
        let module = module_path.display().to_string();
        let lines = sink.clone();
        engine.on_debug(move |text, _source, pos| {
            debug!(target: "verlay::sandbox", module = %module, %pos, "{text}");
            lines.push(text.to_string());
        });
        engine
    }
}

/// Default loader: reads the requested script from disk and runs it.
/// 預設載入器：自磁碟讀取腳本並執行。
#[derive(Debug, Clone)]
pub struct DirectLoader {
    sandbox: Sandbox,
    extension: String,
}

impl DirectLoader {
    pub fn new(sandbox: Sandbox) -> Self {
        Self {
            sandbox,
            extension: DEFAULT_EXTENSION.to_string(),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }
}

impl ModuleLoader for DirectLoader {
    fn load(&self, request: &Path) -> Result<Exports, SandboxError> {
        let path = if request.extension().is_some() {
            request.to_path_buf()
        } else {
            request.with_extension(&self.extension)
        };
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(SandboxError::ModuleNotFound(path));
            }
            Err(source) => return Err(SandboxError::Read { path, source }),
        };
        let imports = ImportContext::new(Arc::new(self.clone()));
        self.sandbox.run_source(&text, &path, &imports)
    }
}

/// Maps an import name to the request handed to a [`ModuleLoader`].
/// 將匯入名稱轉換為交給 [`ModuleLoader`] 的請求。
pub fn resolve_request(base_dir: &Path, name: &str) -> PathBuf {
    if is_relative_name(name) {
        normalize_path(&base_dir.join(name))
    } else {
        PathBuf::from(name)
    }
}

/// Lexically removes `.` and `..` components without touching the filesystem.
/// 以字面方式移除 `.` 與 `..` 路徑片段，不存取檔案系統。
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn is_relative_name(name: &str) -> bool {
    name == "." || name == ".." || name.starts_with("./") || name.starts_with("../")
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(ch) if ch.is_ascii_alphabetic() || ch == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}

#[derive(Clone, Default)]
struct OutputSink(Arc<Mutex<Vec<String>>>);

impl OutputSink {
    fn push(&self, line: String) {
        self.0.lock().push(line);
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock())
    }
}

struct ScopedResolver {
    base_dir: PathBuf,
    overrides: BTreeMap<String, Exports>,
    loader: Arc<dyn ModuleLoader>,
}

impl ModuleResolver for ScopedResolver {
    fn resolve(
        &self,
        _engine: &Engine,
        _source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<Arc<Module>, Box<EvalAltResult>> {
        if let Some(exports) = self.overrides.get(path) {
            return Ok(Arc::clone(exports.module()));
        }
        let request = resolve_request(&self.base_dir, path);
        match self.loader.load(&request) {
            Ok(exports) => Ok(Arc::clone(exports.module())),
            Err(SandboxError::ModuleNotFound(_)) => Err(Box::new(
                EvalAltResult::ErrorModuleNotFound(path.to_string(), pos),
            )),
            Err(err) => Err(Box::new(EvalAltResult::ErrorInModule(
                path.to_string(),
                Box::new(EvalAltResult::ErrorRuntime(err.to_string().into(), pos)),
                pos,
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sandbox() -> Sandbox {
        Sandbox::default()
    }

    #[test]
    fn run_returns_exported_variables() {
        let sandbox = sandbox();
        let path = Path::new("/virtual/lib/config.rhai");
        let exports = sandbox
            .run_source(
                "export const name = \"verlay\"; let hidden = 1;",
                path,
                &ImportContext::direct(&sandbox),
            )
            .unwrap();
        assert_eq!(exports.var::<String>("name").as_deref(), Some("verlay"));
        assert!(!exports.contains_var("hidden"));
        assert_eq!(exports.origin(), path);
    }

    #[test]
    fn print_output_is_captured() {
        let sandbox = sandbox();
        let exports = sandbox
            .run_source(
                "print(\"loading\"); fn greet(who) { print(\"hi \" + who); 1 }",
                Path::new("/virtual/greet.rhai"),
                &ImportContext::direct(&sandbox),
            )
            .unwrap();
        assert_eq!(exports.output(), ["loading"]);

        let outcome = sandbox
            .call(
                &exports,
                "greet",
                vec![Dynamic::from("bob".to_string())],
                &ImportContext::direct(&sandbox),
            )
            .unwrap();
        assert_eq!(outcome.output, vec!["hi bob".to_string()]);
        assert_eq!(outcome.value.as_int().unwrap(), 1);
    }

    #[test]
    fn runtime_errors_carry_the_logical_path() {
        let sandbox = sandbox();
        let path = Path::new("/virtual/broken.rhai");
        let err = sandbox
            .run_source("throw \"boom\";", path, &ImportContext::direct(&sandbox))
            .unwrap_err();
        match err {
            SandboxError::Execution { path: failed, reason } => {
                assert_eq!(failed, path);
                assert!(reason.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn thrown_errors_in_calls_propagate() {
        let sandbox = sandbox();
        let exports = sandbox
            .run_source(
                "fn fail() { throw \"intentional\"; }",
                Path::new("/virtual/fail.rhai"),
                &ImportContext::direct(&sandbox),
            )
            .unwrap();
        let imports = ImportContext::direct(&sandbox);
        let err = sandbox.call(&exports, "fail", Vec::new(), &imports).unwrap_err();
        assert!(matches!(err, SandboxError::Call { ref function, .. } if function == "fail"));
        assert!(matches!(
            sandbox.call(&exports, "fail()", Vec::new(), &imports),
            Err(SandboxError::InvalidFunctionName(_))
        ));
    }

    #[test]
    fn relative_imports_resolve_against_the_logical_path() {
        let temp = tempdir().unwrap();
        let versioned = temp.path().join("versions/v1/lib");
        fs::create_dir_all(&versioned).unwrap();
        fs::write(versioned.join("helper.rhai"), "export const word = \"howdy\";").unwrap();

        let sandbox = sandbox();
        let exports = sandbox
            .run_source(
                "import \"./helper\" as h; export const spoken = h::word;",
                &versioned.join("speaker.rhai"),
                &ImportContext::direct(&sandbox),
            )
            .unwrap();
        assert_eq!(exports.var::<String>("spoken").as_deref(), Some("howdy"));
    }

    #[test]
    fn overrides_win_over_loading() {
        let sandbox = sandbox();
        let mock = sandbox
            .run_source(
                "export const word = \"mocked\";",
                Path::new("/virtual/mock.rhai"),
                &ImportContext::direct(&sandbox),
            )
            .unwrap();
        let imports = ImportContext::direct(&sandbox).with_override("./missing", mock);
        let exports = sandbox
            .run_source(
                "import \"./missing\" as m; export const spoken = m::word;",
                Path::new("/virtual/lib/speaker.rhai"),
                &imports,
            )
            .unwrap();
        assert_eq!(exports.var::<String>("spoken").as_deref(), Some("mocked"));
    }

    #[test]
    fn imports_inside_called_functions_use_the_given_context() {
        let sandbox = sandbox();
        let exports = sandbox
            .run_source(
                "fn say() { import \"./word\" as w; w::word }",
                Path::new("/virtual/lib/speaker.rhai"),
                &ImportContext::direct(&sandbox),
            )
            .unwrap();
        let stub = sandbox
            .run_source(
                "export const word = \"stubbed\";",
                Path::new("/virtual/stub.rhai"),
                &ImportContext::direct(&sandbox),
            )
            .unwrap();

        let imports = ImportContext::direct(&sandbox).with_override("./word", stub);
        let outcome = sandbox.call(&exports, "say", Vec::new(), &imports).unwrap();
        assert_eq!(outcome.value.into_string().unwrap(), "stubbed");
    }

    #[test]
    fn direct_loader_appends_its_extension() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("helper.script"), "export const n = 4;").unwrap();
        fs::write(temp.path().join("helper.rhai"), "export const n = 1;").unwrap();

        let sandbox = sandbox();
        let loader = DirectLoader::new(sandbox.clone()).with_extension("script");
        let imports = ImportContext::new(Arc::new(loader));
        let exports = sandbox
            .run_source(
                "import \"./helper\" as h; export const n = h::n;",
                &temp.path().join("main.script"),
                &imports,
            )
            .unwrap();
        assert_eq!(exports.var::<i64>("n"), Some(4));
    }

    #[test]
    fn missing_imports_fail_the_run() {
        let sandbox = sandbox();
        let err = sandbox
            .run_source(
                "import \"./nowhere\" as n;",
                Path::new("/virtual/lib/a.rhai"),
                &ImportContext::direct(&sandbox),
            )
            .unwrap_err();
        assert!(matches!(err, SandboxError::Execution { .. }));
    }

    #[test]
    fn combined_units_prefer_overlay_functions() {
        let sandbox = sandbox();
        let base = sandbox
            .compile(
                "fn one(x) { two(x + 1) } fn two(x) { three(x + 2) } fn three(x) { x + 3 }",
                Path::new("/src/lib/index.rhai"),
            )
            .unwrap();
        let overlay = sandbox
            .compile(
                "fn two(x) { three(x.to_string() + \"2\") }",
                Path::new("/versions/v1/lib/index.rhai"),
            )
            .unwrap();
        let combined = SourceUnit::combine(&base, &overlay);
        assert_eq!(combined.origin(), overlay.origin());

        let imports = ImportContext::direct(&sandbox);
        let original = sandbox.run(&base, base.origin(), &imports).unwrap();
        let merged = sandbox.run(&combined, combined.origin(), &imports).unwrap();

        let seven = sandbox
            .call(&original, "one", vec![Dynamic::from(1_i64)], &imports)
            .unwrap();
        assert_eq!(seven.value.as_int().unwrap(), 7);
        let text = sandbox
            .call(&merged, "one", vec![Dynamic::from(1_i64)], &imports)
            .unwrap();
        assert_eq!(text.value.into_string().unwrap(), "223");
    }

    #[test]
    fn overlay_statements_run_after_base() {
        let sandbox = sandbox();
        let base = sandbox
            .compile("export let label = \"base\";", Path::new("/src/a.rhai"))
            .unwrap();
        let overlay = sandbox
            .compile("label += \"+overlay\";", Path::new("/versions/v1/a.rhai"))
            .unwrap();
        let combined = SourceUnit::combine(&base, &overlay);
        let exports = sandbox
            .run(&combined, combined.origin(), &ImportContext::direct(&sandbox))
            .unwrap();
        assert_eq!(exports.var::<String>("label").as_deref(), Some("base+overlay"));
    }

    #[test]
    fn operation_limits_stop_runaway_scripts() {
        let sandbox = Sandbox::new(SandboxLimits {
            max_operations: 1_000,
            ..SandboxLimits::default()
        });
        let err = sandbox
            .run_source(
                "let x = 0; loop { x += 1; }",
                Path::new("/virtual/spin.rhai"),
                &ImportContext::direct(&sandbox),
            )
            .unwrap_err();
        assert!(matches!(err, SandboxError::Execution { .. }));
    }

    #[test]
    fn requests_are_normalized() {
        let base = Path::new("/root/versions/v1/lib");
        assert_eq!(
            resolve_request(base, "../shared/util"),
            PathBuf::from("/root/versions/v1/shared/util")
        );
        assert_eq!(resolve_request(base, "./a"), PathBuf::from("/root/versions/v1/lib/a"));
        assert_eq!(resolve_request(base, "vendor/b"), PathBuf::from("vendor/b"));
        assert_eq!(
            normalize_path(Path::new("/a/./b/../c")),
            PathBuf::from("/a/c")
        );
    }

    #[test]
    fn limits_deserialize_with_defaults() {
        let limits: SandboxLimits = serde_json::from_str("{\"max_operations\": 10}").unwrap();
        assert_eq!(limits.max_operations, 10);
        assert_eq!(limits.max_call_depth, 64);
        let mut zeroed = SandboxLimits {
            max_call_depth: 0,
            ..limits
        };
        zeroed.sanitize();
        assert_eq!(zeroed.max_call_depth, 64);
    }
}
