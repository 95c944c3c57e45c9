//! Isolated execution of tenant scripts.
//!
//! Every invocation gets a freshly built `rhai` engine: no module resolver,
//! no `eval`, bounded operations, call depth and data sizes, and a deadline
//! checked from the progress callback. The engine runs on the blocking pool
//! under an outer timeout, so a runaway script never stalls the async
//! workers.
//!
//! Scripts see two variables: `payload` (mutable) and `context` (constant).
//! The value of the last expression is the result; when that value is unit
//! the possibly mutated `payload` is returned instead.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use conduit_core::{redirect_policy, Clock, RealClock, UrlPolicy};
use rhai::{module_resolvers::DummyModuleResolver, Dynamic, Engine, EvalAltResult, Scope};
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, warn};

mod convert;
mod helpers;

pub use convert::{dynamic_to_json, json_to_dynamic};
pub use helpers::MAX_SLEEP_MS;

use crate::error::ScriptError;
use helpers::HelperEnv;

/// Resource limits for script execution.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Wall-clock budget per invocation.
    pub timeout: Duration,
    /// Deepest container nesting a result may have.
    pub max_depth: usize,
    /// Engine operation budget; 0 disables the count.
    pub max_operations: u64,
    /// Function call depth.
    pub max_call_levels: usize,
    /// Expression nesting, at global level and inside functions.
    pub max_expr_depth: (usize, usize),
    /// Longest string in bytes.
    pub max_string_size: usize,
    /// Largest array.
    pub max_array_size: usize,
    /// Largest object map.
    pub max_map_size: usize,
    /// Timeout for `httpGet`/`httpPost`.
    pub http_timeout: Duration,
    /// Targets `httpGet`/`httpPost` may reach.
    pub url_policy: UrlPolicy,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_depth: 50,
            max_operations: 50_000_000,
            max_call_levels: 64,
            max_expr_depth: (64, 32),
            max_string_size: 1024 * 1024,
            max_array_size: 100_000,
            max_map_size: 10_000,
            http_timeout: Duration::from_secs(10),
            url_policy: UrlPolicy::default(),
        }
    }
}

/// Runs scripts against JSON inputs.
#[derive(Debug, Clone)]
pub struct ScriptSandbox {
    config: SandboxConfig,
    clock: Arc<dyn Clock>,
    http: Option<reqwest::Client>,
}

/// Redirect hops `httpGet`/`httpPost` follow.
const MAX_HTTP_REDIRECTS: usize = 3;

impl Default for ScriptSandbox {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

impl ScriptSandbox {
    /// Creates a sandbox on the real clock.
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_clock(config, Arc::new(RealClock::new()))
    }

    /// Creates a sandbox whose `now()` reads `clock`.
    pub fn with_clock(config: SandboxConfig, clock: Arc<dyn Clock>) -> Self {
        let http = reqwest::Client::builder()
            .redirect(redirect_policy(config.url_policy, MAX_HTTP_REDIRECTS))
            .build()
            .map_err(|e| warn!(error = %e, "script HTTP client unavailable"))
            .ok();
        Self { config, clock, http }
    }

    /// Active limits.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Clock behind `now()`.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Evaluates `script` with `payload` and `context` in scope.
    ///
    /// # Errors
    ///
    /// Returns the matching [`ScriptError`] for parse failures, runtime
    /// errors, timeouts, limit violations and unconvertible results.
    pub async fn run(&self, script: &str, payload: &Value, context: &Value) -> Result<Value, ScriptError> {
        let timeout = self.config.timeout;
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);

        let job = Invocation {
            script: script.to_string(),
            payload: payload.clone(),
            context: context.clone(),
            config: self.config.clone(),
            env: HelperEnv {
                clock: self.clock.clone(),
                deadline: Instant::now() + timeout,
                runtime: Handle::current(),
                http: self.http.clone(),
                http_timeout: self.config.http_timeout,
                url_policy: self.config.url_policy,
                max_depth: self.config.max_depth,
            },
        };

        let task = tokio::task::spawn_blocking(move || job.execute());

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                warn!(error = %join_error, "script worker failed");
                Err(ScriptError::Internal { message: join_error.to_string() })
            },
            Err(_) => Err(ScriptError::Timeout { timeout_ms }),
        }
    }
}

struct Invocation {
    script: String,
    payload: Value,
    context: Value,
    config: SandboxConfig,
    env: HelperEnv,
}

impl Invocation {
    fn execute(self) -> Result<Value, ScriptError> {
        let timeout_ms = u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX);
        let engine = build_engine(&self.config, &self.env);

        let ast = engine
            .compile(&self.script)
            .map_err(|e| ScriptError::Compile { message: e.to_string() })?;

        let mut scope = Scope::new();
        scope.push("payload", json_to_dynamic(&self.payload));
        scope.push_constant("context", json_to_dynamic(&self.context));

        let result = engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
            .map_err(|e| classify(*e, timeout_ms))?;

        let result = if result.is_unit() {
            scope.get_value::<Dynamic>("payload").unwrap_or(Dynamic::UNIT)
        } else {
            result
        };

        dynamic_to_json(&result, self.config.max_depth)
    }
}

fn build_engine(config: &SandboxConfig, env: &HelperEnv) -> Engine {
    let mut engine = Engine::new();

    engine.set_module_resolver(DummyModuleResolver::new());
    engine.disable_symbol("eval");

    engine.set_max_operations(config.max_operations);
    engine.set_max_call_levels(config.max_call_levels);
    engine.set_max_expr_depths(config.max_expr_depth.0, config.max_expr_depth.1);
    engine.set_max_string_size(config.max_string_size);
    engine.set_max_array_size(config.max_array_size);
    engine.set_max_map_size(config.max_map_size);
    engine.set_max_modules(0);

    let deadline = env.deadline;
    engine.on_progress(move |ops| {
        if ops % 256 == 0 && Instant::now() >= deadline {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });

    engine.on_print(|text| debug!(target: "conduit::script", "{text}"));
    engine.on_debug(|text, source, pos| {
        debug!(target: "conduit::script", source = source.unwrap_or_default(), %pos, "{text}");
    });

    helpers::register(&mut engine, env);
    engine
}

fn classify(error: EvalAltResult, timeout_ms: u64) -> ScriptError {
    match error {
        EvalAltResult::ErrorTerminated(..) => ScriptError::Timeout { timeout_ms },
        EvalAltResult::ErrorParsing(..) => ScriptError::Compile { message: error.to_string() },
        EvalAltResult::ErrorTooManyOperations(..)
        | EvalAltResult::ErrorStackOverflow(..)
        | EvalAltResult::ErrorDataTooLarge(..)
        | EvalAltResult::ErrorTooManyModules(..) => {
            ScriptError::ResourceLimit { message: error.to_string() }
        },
        other => ScriptError::Runtime { message: other.to_string() },
    }
}
