//! Boa evaluation primitives shared by both engine modes.
//!
//! A script body is an expression that evaluates to a function, for example
//! `x => x + 1`. It is wrapped in parentheses, evaluated once to obtain the
//! function object, and then called with the decoded arguments. Boa's
//! `Context` is neither `Send` nor `Sync`, so everything here runs on the
//! thread that owns the context.
//!
//! Both steps run as budgeted scripts: the VM hands control back every
//! [`DEADLINE_CHECK_BUDGET`] units of work, and the run is dropped as soon as
//! its [`Deadline`] has passed. A context whose run was dropped still holds
//! the abandoned call frames and must not be used again.

use boa_engine::{
    builtins::promise::PromiseState, js_string, object::builtins::JsArray,
    object::ObjectInitializer, property::Attribute, script::Script, value::JsValue, Context,
    JsError, JsObject, JsResult, Source,
};
use std::future::Future;
use std::pin::pin;
use std::task::{self, Poll};
use std::time::{Duration, Instant};

use crate::error::EngineError;
use crate::resource_limits::ResourceLimits;
use crate::runtime::conversions::{decode_arg, result_to_string};

/// Wraps a script body so that it parses as a single expression.
///
/// The closing parenthesis goes on its own line so a trailing line comment
/// in the body cannot swallow it.
pub(crate) fn wrap(body: &str) -> String {
    format!("({}\n)", body)
}

/// Creates a context with the runaway-execution ceilings applied.
pub(crate) fn new_context(limits: &ResourceLimits) -> Context {
    let mut ctx = Context::default();
    let runtime_limits = ctx.runtime_limits_mut();
    runtime_limits.set_loop_iteration_limit(limits.loop_iteration_limit);
    runtime_limits.set_recursion_limit(limits.recursion_limit);
    ctx
}

/// Parses a wrapped source without running it.
pub(crate) fn check_syntax(source: &str, ctx: &mut Context) -> Result<(), EngineError> {
    Script::parse(Source::from_bytes(source), None, ctx)
        .map(|_| ())
        .map_err(|e| {
            let message = e.to_string();
            EngineError::Compilation {
                line: line_number(&message),
                message,
            }
        })
}

/// VM work between two deadline checks.
const DEADLINE_CHECK_BUDGET: u32 = 4_096;

/// Global the entry script reads the function and its arguments from.
const ENTRY_SLOT: &str = "__jsexec_entry";

/// Point in time after which a running script is abandoned.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    at: Option<Instant>,
    timeout: Duration,
}

impl Deadline {
    pub(crate) fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(timeout),
            timeout,
        }
    }

    pub(crate) fn passed(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Polls a budgeted run on the current thread until it finishes or the
/// deadline passes.
fn drive<F: Future>(run: F, deadline: Deadline) -> Result<F::Output, EngineError> {
    let waker = futures::task::noop_waker();
    let mut cx = task::Context::from_waker(&waker);
    let mut run = pin!(run);

    loop {
        if let Poll::Ready(output) = run.as_mut().poll(&mut cx) {
            return Ok(output);
        }
        if deadline.passed() {
            return Err(EngineError::Timeout(deadline.timeout()));
        }
    }
}

fn run_script(
    source: &str,
    ctx: &mut Context,
    deadline: Deadline,
) -> Result<JsResult<JsValue>, EngineError> {
    let script = match Script::parse(Source::from_bytes(source), None, ctx) {
        Ok(script) => script,
        Err(e) => return Ok(Err(e)),
    };
    drive(
        script.evaluate_async_with_budget(ctx, DEADLINE_CHECK_BUDGET),
        deadline,
    )
}

/// Evaluates a wrapped source and returns the function it produces.
pub(crate) fn evaluate_function(
    source: &str,
    ctx: &mut Context,
    deadline: Deadline,
) -> Result<JsObject, EngineError> {
    let value = run_script(source, ctx, deadline)?.map_err(|e| runtime_error(e, ctx))?;

    value
        .as_object()
        .filter(|obj| obj.is_callable())
        .ok_or_else(|| EngineError::runtime("TypeError: script must evaluate to a function"))
}

/// Source of the script that calls the function parked in [`ENTRY_SLOT`].
///
/// Calling from script code keeps the whole call inside the budgeted run.
/// Arguments are read by index so a patched array iterator cannot interfere.
fn entry_source(argc: usize) -> String {
    let args: Vec<String> = (0..argc)
        .map(|i| format!("{}.args[{}]", ENTRY_SLOT, i))
        .collect();
    format!("(0, {}.fn)({})", ENTRY_SLOT, args.join(", "))
}

/// Calls a script function and renders its (settled) result.
pub(crate) fn call(
    function: &JsObject,
    args: &[String],
    ctx: &mut Context,
    deadline: Deadline,
) -> Result<String, EngineError> {
    let mut js_args = Vec::with_capacity(args.len());
    for arg in args {
        js_args.push(decode_arg(arg, ctx)?);
    }

    let js_args = JsArray::from_iter(js_args, ctx);
    let entry = ObjectInitializer::new(ctx)
        .property(js_string!("fn"), function.clone(), Attribute::all())
        .property(js_string!("args"), js_args, Attribute::all())
        .build();
    let global = ctx.global_object();
    global
        .set(js_string!(ENTRY_SLOT), entry, false, ctx)
        .map_err(|e| runtime_error(e, ctx))?;

    let value = run_script(&entry_source(args.len()), ctx, deadline)?;
    let _ = global.set(js_string!(ENTRY_SLOT), JsValue::undefined(), false, ctx);

    let value = value.map_err(|e| runtime_error(e, ctx))?;
    let value = settle(value, ctx)?;

    result_to_string(value, ctx)
}

/// Resolves a returned promise by draining the job queue.
fn settle(value: JsValue, ctx: &mut Context) -> Result<JsValue, EngineError> {
    let Some(promise) = value.as_promise() else {
        return Ok(value);
    };

    let _ = ctx.run_jobs();

    match promise.state() {
        PromiseState::Fulfilled(result) => Ok(result),
        PromiseState::Rejected(reason) => Err(runtime_error(JsError::from_opaque(reason), ctx)),
        PromiseState::Pending => Err(EngineError::runtime(
            "Promise returned by script never settled",
        )),
    }
}

fn runtime_error(err: JsError, ctx: &mut Context) -> EngineError {
    let message = err
        .try_native(ctx)
        .map(|native| native.to_string())
        .unwrap_or_else(|_| err.to_string());

    EngineError::Runtime {
        line: line_number(&message),
        message,
    }
}

/// Extracts the first `line N` position from an engine message.
pub(crate) fn line_number(message: &str) -> Option<u32> {
    let start = message.find("line ")? + "line ".len();
    let digits: String = message[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
