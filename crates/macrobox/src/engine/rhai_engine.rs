//! [`ScriptEngine`] backed by the Rhai interpreter.
//!
//! Every run gets its own `rhai::Engine` and `rhai::Scope`, so top-level
//! variables of one run are invisible to every other run unless the runner
//! carries them over through [`ExecutionContext::globals`]. Values with no
//! JSON form travel as `Dynamic`s in [`ExecutionContext::native`], next to
//! the script functions the macro has defined so far.
//!
//! Evaluation happens on a blocking worker thread. Host callbacks are async;
//! they are driven from that thread with [`Handle::block_on`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use rhai::module_resolvers::FileModuleResolver;
use rhai::{
    AST, Dynamic, EvalAltResult, INT, ImmutableString, ParseError, ParseErrorType, Position, Scope,
};
use sha2::{Digest, Sha256};
use tokio::runtime::Handle;

use crate::callback::{CallContext, Callback, CallbackError};
use crate::context::{ExecutionContext, Globals, NativeState, NativeValue};
use crate::transpile::Diagnostic;

use super::{EngineError, ScriptEngine};

/// Longest uninterrupted nap inside `sleep()`, so cancellation is noticed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Rhai-based script engine.
///
/// Besides the Rhai standard library, macro code can call:
///
/// | function | description |
/// |---|---|
/// | `run_id()` | id of the current run, e.g. `"foo@003"` |
/// | `is_startup()` | whether this is a startup run |
/// | `script_path()` | path of the macro, or `()` |
/// | `is_cancelled()` | whether cancellation was requested |
/// | `sleep(ms)` | pause, returning early on cancellation |
/// | `now_ms()` | milliseconds since the Unix epoch |
/// | `random_uuid()` | a random v4 UUID string |
/// | `sha256(text)` / `hex_encode(text)` | hashing and encoding helpers |
/// | `to_json(value)` / `parse_json(text)` | JSON conversion |
/// | `host_functions()` | map of host callback names to their descriptions |
///
/// `print` and `debug` go to the run's log channel, `import` resolves files
/// relative to the macro's directory, and every host callback is available
/// under its own name.
#[derive(Debug, Clone, Default)]
pub struct RhaiEngine {
    max_operations: Option<u64>,
}

impl RhaiEngine {
    /// Create an engine with no operation limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort runs after `limit` interpreter operations.
    #[must_use]
    pub const fn with_max_operations(mut self, limit: u64) -> Self {
        self.max_operations = Some(limit);
        self
    }
}

#[async_trait]
impl ScriptEngine for RhaiEngine {
    fn name(&self) -> &str {
        "rhai"
    }

    fn check(&self, code: &str) -> Result<(), Vec<Diagnostic>> {
        rhai::Engine::new()
            .compile(code)
            .map(|_| ())
            .map_err(|e| vec![diagnostic(&e, code)])
    }

    async fn run(
        &self,
        code: &str,
        context: &mut ExecutionContext,
    ) -> Result<serde_json::Value, EngineError> {
        let code = code.to_owned();
        let input = context.clone();
        let handle = Handle::current();
        let max_operations = self.max_operations;

        let joined = tokio::task::spawn_blocking(move || {
            evaluate(&code, &input, &handle, max_operations)
        })
        .await;

        match joined {
            Ok(Evaluation {
                globals,
                native,
                result,
            }) => {
                context.globals = globals;
                context.native = native;
                result
            }
            Err(e) => Err(EngineError::runtime(format!("macro evaluation aborted: {e}"))),
        }
    }
}

/// User state left behind by one evaluation.
struct Evaluation {
    globals: Globals,
    native: NativeState,
    result: Result<serde_json::Value, EngineError>,
}

/// Run `code` on the current (blocking) thread.
fn evaluate(
    code: &str,
    context: &ExecutionContext,
    handle: &Handle,
    max_operations: Option<u64>,
) -> Evaluation {
    let engine = build_engine(context, handle, max_operations);

    let mut scope = Scope::new();
    for (name, value) in &context.globals {
        match rhai::serde::to_dynamic(value) {
            Ok(value) => {
                scope.push_dynamic(name.as_str(), value);
            }
            Err(e) => tracing::debug!(name = %name, error = %e, "global not representable in rhai"),
        }
    }
    // Pushed last so they shadow a JSON global of the same name.
    for (name, value) in &context.native.values {
        match (**value).downcast_ref::<Dynamic>() {
            Some(value) => {
                scope.push_dynamic(name.as_str(), value.clone());
            }
            None => tracing::debug!(name = %name, "native global was not produced by rhai"),
        }
    }

    let carried = context
        .native
        .functions
        .as_ref()
        .and_then(|functions| (**functions).downcast_ref::<AST>());
    let (ast, defined) = match compile(&engine, context.host().prelude(), carried, code) {
        Ok(compiled) => compiled,
        Err(e) => {
            return Evaluation {
                globals: context.globals.clone(),
                native: context.native.clone(),
                result: Err(e),
            };
        }
    };

    let result = match engine.eval_ast_with_scope::<Dynamic>(&mut scope, &ast) {
        Ok(value) => Ok(to_json(&value)),
        Err(e) if context.cancellation().is_cancelled() && is_terminated(&e) => {
            tracing::debug!(run = %context.run_id(), "macro terminated after cancellation");
            Ok(serde_json::Value::Null)
        }
        Err(e) => Err(EngineError::Runtime {
            message: e.to_string(),
            line: e.position().line(),
        }),
    };

    let (globals, values) = collect_globals(&scope);
    let functions = if defined.has_functions() {
        let functions: NativeValue = Arc::new(match carried {
            Some(carried) => carried.merge(&defined),
            None => defined,
        });
        Some(functions)
    } else {
        context.native.functions.clone()
    };
    Evaluation {
        globals,
        native: NativeState { values, functions },
        result,
    }
}

fn build_engine(
    context: &ExecutionContext,
    handle: &Handle,
    max_operations: Option<u64>,
) -> rhai::Engine {
    let mut engine = rhai::Engine::new();
    let metadata = context.metadata();

    if let Some(limit) = max_operations {
        engine.set_max_operations(limit);
    }
    if let Some(dir) = context.script_path().and_then(|p| p.parent()) {
        engine.set_module_resolver(FileModuleResolver::new_with_path(dir));
    }

    let token = metadata.cancellation.clone();
    engine.on_progress(move |_| token.is_cancelled().then_some(Dynamic::UNIT));

    let (host, run_id) = (context.host().clone(), metadata.run_id.clone());
    engine.on_print(move |line| host.emit_output(&run_id, line));
    let (host, run_id) = (context.host().clone(), metadata.run_id.clone());
    engine.on_debug(move |line, _source, _pos| host.emit_output(&run_id, line));

    let run_id = metadata.run_id.to_string();
    engine.register_fn("run_id", move || run_id.clone());
    let startup = metadata.startup;
    engine.register_fn("is_startup", move || startup);
    let path = metadata
        .script_path
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned());
    engine.register_fn("script_path", move || {
        path.clone().map_or(Dynamic::UNIT, Dynamic::from)
    });
    let token = metadata.cancellation.clone();
    engine.register_fn("is_cancelled", move || token.is_cancelled());
    let token = metadata.cancellation.clone();
    engine.register_fn("sleep", move |ms: INT| {
        let deadline = Instant::now() + Duration::from_millis(u64::try_from(ms).unwrap_or(0));
        while !token.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    });

    register_helpers(&mut engine);

    let catalog: rhai::Map = context
        .host()
        .callbacks()
        .iter()
        .map(|(name, callback)| {
            (name.as_str().into(), Dynamic::from(callback.description().to_string()))
        })
        .collect();
    engine.register_fn("host_functions", move || catalog.clone());

    for (name, callback) in context.host().callbacks() {
        let (handle0, callback0, call0) = (handle.clone(), callback.clone(), context.call_context());
        engine.register_fn(name.as_str(), move || {
            invoke_callback(&handle0, callback0.as_ref(), call0.clone(), serde_json::Value::Null)
        });
        let (handle1, callback1, call1) = (handle.clone(), callback.clone(), context.call_context());
        engine.register_fn(name.as_str(), move |args: Dynamic| {
            let args: serde_json::Value = rhai::serde::from_dynamic(&args.flatten_clone())?;
            invoke_callback(&handle1, callback1.as_ref(), call1.clone(), args)
        });
    }

    engine
}

fn register_helpers(engine: &mut rhai::Engine) {
    engine.register_fn("now_ms", || {
        let elapsed = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        INT::try_from(elapsed.as_millis()).unwrap_or(INT::MAX)
    });
    engine.register_fn("random_uuid", || uuid::Uuid::new_v4().to_string());
    engine.register_fn("sha256", |text: ImmutableString| {
        hex::encode(Sha256::digest(text.as_bytes()))
    });
    engine.register_fn("hex_encode", |text: ImmutableString| hex::encode(text.as_bytes()));
    engine.register_fn(
        "to_json",
        |value: Dynamic| -> Result<String, Box<EvalAltResult>> {
            let value: serde_json::Value = rhai::serde::from_dynamic(&value.flatten_clone())?;
            serde_json::to_string(&value).map_err(|e| e.to_string().into())
        },
    );
    engine.register_fn(
        "parse_json",
        |text: ImmutableString| -> Result<Dynamic, Box<EvalAltResult>> {
            let value: serde_json::Value =
                serde_json::from_str(text.as_str()).map_err(|e| e.to_string())?;
            rhai::serde::to_dynamic(&value)
        },
    );
}

fn invoke_callback(
    handle: &Handle,
    callback: &dyn Callback,
    call: CallContext,
    args: serde_json::Value,
) -> Result<Dynamic, Box<EvalAltResult>> {
    let token = call.cancellation.clone();
    let result = handle.block_on(async {
        tokio::select! {
            result = callback.invoke(call, args) => result,
            () = token.cancelled() => Err(CallbackError::Cancelled),
        }
    });
    match result {
        Ok(value) => rhai::serde::to_dynamic(&value),
        // A cancelled run stops at the pending call, as if the progress hook fired.
        Err(CallbackError::Cancelled) => {
            Err(EvalAltResult::ErrorTerminated(Dynamic::UNIT, Position::NONE).into())
        }
        Err(e) => Err(format!("{}: {e}", callback.name()).into()),
    }
}

/// Compile the macro, making the prelude's functions and those `carried`
/// over from earlier runs available to it.
///
/// Returns the runnable AST and the functions the macro itself defines.
/// The macro's definitions win over carried ones, which win over the prelude.
fn compile(
    engine: &rhai::Engine,
    prelude: &str,
    carried: Option<&AST>,
    code: &str,
) -> Result<(AST, AST), EngineError> {
    let ast = engine
        .compile(code)
        .map_err(|e| EngineError::Compile(vec![diagnostic(&e, code)]))?;
    let defined = ast.clone_functions_only();

    let mut library = if prelude.trim().is_empty() {
        AST::empty()
    } else {
        engine
            .compile(prelude)
            .map_err(|e| {
                let mut d = diagnostic(&e, prelude);
                d.message = format!("in prelude: {}", d.message);
                EngineError::Compile(vec![d])
            })?
            .clone_functions_only()
    };
    if let Some(carried) = carried {
        library = library.merge(carried);
    }
    Ok((library.merge(&ast), defined))
}

fn diagnostic(err: &ParseError, code: &str) -> Diagnostic {
    let ParseError(kind, pos) = err;
    let line = pos.line().unwrap_or(0);
    let column = pos.position().unwrap_or(0);
    let d = Diagnostic::new(line, column, kind.to_string());

    let recoverable = match kind.as_ref() {
        ParseErrorType::UnexpectedEOF => true,
        ParseErrorType::MissingToken(..) => is_end_of_input(line, column, code),
        _ => false,
    };
    if recoverable { d.recoverable() } else { d }
}

/// Whether a 1-based position lies past the last character of `code`.
fn is_end_of_input(line: usize, column: usize, code: &str) -> bool {
    let lines: Vec<&str> = code.lines().collect();
    match lines.len() {
        0 => true,
        n if line > n => true,
        n if line == n => column > lines[n - 1].chars().count(),
        _ => false,
    }
}

fn is_terminated(err: &EvalAltResult) -> bool {
    match err {
        EvalAltResult::ErrorTerminated(..) => true,
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _)
        | EvalAltResult::ErrorInModule(_, inner, _) => is_terminated(inner),
        _ => false,
    }
}

fn to_json(value: &Dynamic) -> serde_json::Value {
    rhai::serde::from_dynamic(&value.flatten_clone())
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()))
}

/// Read top-level variables back out of the scope, splitting them into JSON
/// data and native values such as closures. Later shadowing declarations win.
fn collect_globals(scope: &Scope<'_>) -> (Globals, BTreeMap<String, NativeValue>) {
    let mut globals = Globals::new();
    let mut native = BTreeMap::new();
    for (name, _constant, value) in scope.iter() {
        match rhai::serde::from_dynamic::<serde_json::Value>(&value.flatten_clone()) {
            Ok(value) => {
                native.remove(name);
                globals.insert(name.to_string(), value);
            }
            Err(_) => {
                tracing::trace!(name, type_name = value.type_name(), "keeping native global");
                globals.remove(name);
                let value: NativeValue = Arc::new(value);
                native.insert(name.to_string(), value);
            }
        }
    }
    (globals, native)
}
