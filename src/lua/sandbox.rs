//! Per-run isolation around one long-lived Lua VM.
//!
//! Every request gets a brand new environment table holding only whitelisted
//! globals, so top-level bindings of one run are unreachable from the next.
//! The standard library tables are shared with the VM, so their contents are
//! snapshotted at startup and restored after each run.
//!
//! An instruction-count hook polls the interrupt flag and the wall-clock
//! deadline. Once either fires, the hook keeps raising on every check and the
//! sandbox `pcall`/`xpcall` re-raise instead of catching, so user code cannot
//! swallow the cancellation. Lua runs finalizers with hooks disabled, so the
//! sandbox `setmetatable` refuses `__gc`. A native call that never returns to
//! the VM is not interruptible this way; the orchestrator abandons such a
//! worker.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use mlua::{Function, HookTriggers, Lua, MultiValue, Result as LuaResult, Table, Value, VmState};

use crate::{
    config::RuntimeConfig,
    constants::CHUNK_NAME,
    core::{
        domain::{ErrorKind, ExecutionRequest, ExecutionResult},
        interrupt::InterruptChannel,
    },
    lua::{
        capture::OutputBuffer,
        convert::{json_args_to_lua, lua_to_json},
    },
};

const SAFE_GLOBALS: &[&str] = &[
    "tostring",
    "tonumber",
    "type",
    "pairs",
    "ipairs",
    "next",
    "select",
    "error",
    "assert",
    "rawget",
    "rawset",
    "rawlen",
    "rawequal",
    "getmetatable",
    "_VERSION",
];

const SHARED_LIBS: &[&str] = &["string", "math", "table", "utf8"];

const OS_FUNCTIONS: &[&str] = &["clock", "time", "date", "difftime"];

const TRACEBACK_SEPARATOR: &str = "\nstack traceback:";

const GUARDS: &str = r#"
local raw_pcall, raw_xpcall, raw_setmetatable, pack, unpack, cancelled = ...

local function finish(results)
    if not results[1] and cancelled() then
        error(results[2], 0)
    end
    return unpack(results, 1, results.n)
end

local function pcall(f, ...)
    return finish(pack(raw_pcall(f, ...)))
end

local function xpcall(f, handler, ...)
    return finish(pack(raw_xpcall(f, function(e)
        if cancelled() then
            return e
        end
        return handler(e)
    end, ...)))
end

-- Finalizers run with hooks disabled, so they could never be cancelled.
local function setmetatable(t, mt)
    if type(mt) == "table" and rawget(mt, "__gc") ~= nil then
        error("__gc metamethods are not allowed", 2)
    end
    return raw_setmetatable(t, mt)
end

return pcall, xpcall, setmetatable
"#;

#[derive(Clone, Copy, Debug)]
enum Stream {
    Stdout,
    Stderr,
}

/// State of the run in progress, shared with the Lua callbacks.
#[derive(Debug, Default)]
struct RunState {
    stdout: RefCell<OutputBuffer>,
    stderr: RefCell<OutputBuffer>,
    cause: Cell<Option<ErrorKind>>,
    overflow_is_fatal: Cell<bool>,
}

impl RunState {
    fn begin(&self, cap: usize, overflow_is_fatal: bool) {
        self.stdout.borrow_mut().reset(cap);
        self.stderr.borrow_mut().reset(cap);
        self.cause.set(None);
        self.overflow_is_fatal.set(overflow_is_fatal);
    }

    fn finish(&self, cap: usize) -> (String, String) {
        (
            self.stdout.borrow_mut().reset(cap),
            self.stderr.borrow_mut().reset(cap),
        )
    }

    fn write(&self, stream: Stream, text: &str) -> LuaResult<()> {
        let buf = match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        };
        let fits = buf.borrow_mut().push(text);
        if !fits && self.overflow_is_fatal.get() {
            self.cause.set(Some(ErrorKind::OutputOverflow));
            return Err(mlua::Error::RuntimeError("output limit exceeded".to_string()));
        }
        Ok(())
    }
}

/// Functions installed into every environment, created once per VM.
#[derive(Debug)]
struct Prelude {
    print: Function,
    warn: Function,
    io_write: Function,
    stdout_write: Function,
    stderr_write: Function,
    pcall: Function,
    xpcall: Function,
    setmetatable: Function,
}

/// Contents of the shared library tables at startup.
#[derive(Debug)]
struct Baseline {
    tables: Vec<(Table, Vec<(Value, Value)>, Option<Table>)>,
}

impl Baseline {
    fn capture(lua: &Lua) -> LuaResult<Self> {
        let globals = lua.globals();
        let mut shared = Vec::new();
        for name in SHARED_LIBS {
            if let Value::Table(table) = globals.get::<Value>(*name)? {
                shared.push(table);
            }
        }
        if let Some(string_mt) = lua
            .load("return getmetatable('')")
            .set_name("=baseline")
            .eval::<Option<Table>>()?
        {
            shared.push(string_mt);
        }

        let mut tables = Vec::with_capacity(shared.len());
        for table in shared {
            let entries = table
                .clone()
                .pairs::<Value, Value>()
                .collect::<LuaResult<Vec<_>>>()?;
            let metatable = table.metatable();
            tables.push((table, entries, metatable));
        }
        Ok(Self { tables })
    }

    fn restore(&self) -> LuaResult<()> {
        for (table, entries, metatable) in &self.tables {
            let keys = table
                .clone()
                .pairs::<Value, Value>()
                .map(|pair| pair.map(|(k, _)| k))
                .collect::<LuaResult<Vec<_>>>()?;
            for key in keys {
                table.raw_set(key, Value::Nil)?;
            }
            for (key, value) in entries {
                table.raw_set(key.clone(), value.clone())?;
            }
            table.set_metatable(metatable.clone());
        }
        Ok(())
    }
}

/// A failed run before it is turned into an [`ExecutionResult`].
#[derive(Debug)]
struct RunFailure {
    kind: ErrorKind,
    message: String,
    traceback: Option<String>,
}

impl RunFailure {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            traceback: None,
        }
    }
}

impl From<mlua::Error> for RunFailure {
    fn from(err: mlua::Error) -> Self {
        let mut callback_traceback = None;
        let mut root = &err;
        while let mlua::Error::CallbackError { traceback, cause } = root {
            callback_traceback.get_or_insert_with(|| traceback.clone());
            root = cause.as_ref();
        }

        match root {
            mlua::Error::SyntaxError { message, .. } => Self {
                kind: ErrorKind::SyntaxError,
                message: message.clone(),
                traceback: Some(message.clone()),
            },
            mlua::Error::MemoryError(msg) => Self::new(ErrorKind::MemoryError, msg.clone()),
            mlua::Error::RuntimeError(msg) => {
                let (head, traceback) = match msg.split_once(TRACEBACK_SEPARATOR) {
                    Some((head, _)) => (head.to_string(), Some(msg.clone())),
                    None => (msg.clone(), callback_traceback.or_else(|| Some(msg.clone()))),
                };
                Self {
                    kind: ErrorKind::RuntimeError,
                    message: head,
                    traceback,
                }
            }
            other => Self {
                kind: ErrorKind::RuntimeError,
                message: other.to_string(),
                traceback: callback_traceback,
            },
        }
    }
}

/// Removes the instruction hook when the run ends, on every exit path.
struct ArmedHook<'a> {
    lua: &'a Lua,
}

impl Drop for ArmedHook<'_> {
    fn drop(&mut self) {
        self.lua.remove_hook();
    }
}

pub struct Sandbox {
    lua: Lua,
    config: RuntimeConfig,
    interrupt: InterruptChannel,
    state: Rc<RunState>,
    prelude: Prelude,
    baseline: Baseline,
}

impl Sandbox {
    pub fn new(config: &RuntimeConfig, interrupt: InterruptChannel) -> LuaResult<Self> {
        let lua = Lua::new();
        if let Some(limit) = config.memory_limit_bytes {
            lua.set_memory_limit(limit)?;
        }

        let state = Rc::new(RunState::default());
        let prelude = build_prelude(&lua, &state)?;
        let baseline = Baseline::capture(&lua)?;

        Ok(Self {
            lua,
            config: config.clone(),
            interrupt,
            state,
            prelude,
            baseline,
        })
    }

    pub fn version(&self) -> String {
        self.lua
            .globals()
            .get::<String>("_VERSION")
            .unwrap_or_else(|_| "Lua".to_string())
    }

    pub fn used_memory(&self) -> usize {
        self.lua.used_memory()
    }

    /// Runs one request in a fresh namespace.
    ///
    /// Every outcome of the user code is reported inside the returned
    /// result. `Err` means the VM could not be brought back to its baseline
    /// and must not serve further requests.
    pub fn execute(&self, request: &ExecutionRequest) -> LuaResult<ExecutionResult> {
        let started = Instant::now();
        let timeout = self.config.effective_timeout(request.timeout_ms);
        self.state
            .begin(self.config.output_cap_chars, self.config.overflow_is_fatal);

        let outcome = {
            let _armed = self.arm(started + timeout);
            self.run_request(request)
        };
        let execution_time_ms = started.elapsed().as_millis() as u64;

        let restored = self.baseline.restore();
        self.lua.gc_collect()?;
        restored?;

        let (stdout, stderr) = self.state.finish(self.config.output_cap_chars);
        let result = match (self.state.cause.get(), outcome) {
            (Some(kind), _) => {
                ExecutionResult::failure(kind, self.cancel_message(kind, timeout), execution_time_ms)
                    .with_output(stdout, stderr)
            }
            (None, Ok(return_value)) => {
                ExecutionResult::success(stdout, stderr, return_value, execution_time_ms)
            }
            (None, Err(failure)) => {
                ExecutionResult::failure(failure.kind, &failure.message, execution_time_ms)
                    .with_output(stdout, stderr)
                    .with_traceback(failure.traceback)
            }
        };

        tracing::debug!(
            request_id = %request.id,
            success = result.success,
            kind = ?result.kind,
            execution_time_ms,
            "Run finished"
        );
        Ok(result)
    }

    fn arm(&self, deadline: Instant) -> ArmedHook<'_> {
        let state = Rc::clone(&self.state);
        let interrupt = self.interrupt.clone();

        self.lua.set_hook(
            HookTriggers::new().every_nth_instruction(self.config.hook_instruction_interval),
            move |_lua, _debug| {
                if state.cause.get().is_none() {
                    if interrupt.is_raised() {
                        state.cause.set(Some(ErrorKind::Interrupted));
                    } else if Instant::now() >= deadline {
                        state.cause.set(Some(ErrorKind::Timeout));
                    }
                }
                match state.cause.get() {
                    Some(kind) => Err(mlua::Error::RuntimeError(format!(
                        "execution cancelled ({kind})"
                    ))),
                    None => Ok(VmState::Continue),
                }
            },
        );

        ArmedHook { lua: &self.lua }
    }

    fn run_request(
        &self,
        request: &ExecutionRequest,
    ) -> Result<Option<serde_json::Value>, RunFailure> {
        let env = self.build_env()?;
        let main = self
            .lua
            .load(request.code.as_str())
            .set_name(CHUNK_NAME)
            .set_environment(env.clone())
            .into_function()?;

        let mut value: Value = main.call(())?;

        if let Some(name) = &request.entry_point {
            let entry = match env.raw_get::<Value>(name.as_str())? {
                Value::Function(f) => f,
                Value::Nil => {
                    return Err(RunFailure::new(
                        ErrorKind::RuntimeError,
                        format!("entry point '{name}' is not defined"),
                    ));
                }
                other => {
                    return Err(RunFailure::new(
                        ErrorKind::RuntimeError,
                        format!("entry point '{name}' is a {}, not a function", other.type_name()),
                    ));
                }
            };
            let args = json_args_to_lua(&self.lua, &request.args)?;
            value = entry.call(args)?;
        }

        match value {
            Value::Nil => Ok(None),
            other => Ok(Some(lua_to_json(&other)?)),
        }
    }

    fn build_env(&self) -> LuaResult<Table> {
        let lua = &self.lua;
        let globals = lua.globals();
        let env = lua.create_table()?;

        for name in SAFE_GLOBALS.iter().chain(SHARED_LIBS) {
            let value: Value = globals.get(*name)?;
            if !value.is_nil() {
                env.raw_set(*name, value)?;
            }
        }

        env.raw_set("print", self.prelude.print.clone())?;
        env.raw_set("warn", self.prelude.warn.clone())?;
        env.raw_set("pcall", self.prelude.pcall.clone())?;
        env.raw_set("xpcall", self.prelude.xpcall.clone())?;
        env.raw_set("setmetatable", self.prelude.setmetatable.clone())?;

        let stdout = lua.create_table()?;
        stdout.raw_set("write", self.prelude.stdout_write.clone())?;
        let stderr = lua.create_table()?;
        stderr.raw_set("write", self.prelude.stderr_write.clone())?;
        let io = lua.create_table()?;
        io.raw_set("write", self.prelude.io_write.clone())?;
        io.raw_set("stdout", stdout)?;
        io.raw_set("stderr", stderr)?;
        env.raw_set("io", io)?;

        let os = lua.create_table()?;
        if let Value::Table(real_os) = globals.get::<Value>("os")? {
            for name in OS_FUNCTIONS {
                os.raw_set(*name, real_os.get::<Value>(*name)?)?;
            }
        }
        env.raw_set("os", os)?;

        env.raw_set("_G", env.clone())?;
        Ok(env)
    }

    fn cancel_message(&self, kind: ErrorKind, timeout: Duration) -> String {
        match kind {
            ErrorKind::Timeout => format!("execution exceeded {}ms", timeout.as_millis()),
            ErrorKind::Interrupted => "execution was aborted".to_string(),
            ErrorKind::OutputOverflow => format!(
                "output exceeded {} characters",
                self.config.output_cap_chars
            ),
            other => other.to_string(),
        }
    }
}

fn build_prelude(lua: &Lua, state: &Rc<RunState>) -> LuaResult<Prelude> {
    let globals = lua.globals();
    let tostring: Function = globals.get("tostring")?;

    let print = {
        let state = Rc::clone(state);
        let tostring = tostring.clone();
        lua.create_function(move |_, args: MultiValue| {
            let mut line = join_display(&tostring, args, "\t")?;
            line.push('\n');
            state.write(Stream::Stdout, &line)
        })?
    };

    let warn = {
        let state = Rc::clone(state);
        let tostring = tostring.clone();
        lua.create_function(move |_, args: MultiValue| {
            let mut line = join_display(&tostring, args, "")?;
            line.push('\n');
            state.write(Stream::Stderr, &line)
        })?
    };

    let io_write = stream_writer(lua, state, &tostring, Stream::Stdout, false)?;
    let stdout_write = stream_writer(lua, state, &tostring, Stream::Stdout, true)?;
    let stderr_write = stream_writer(lua, state, &tostring, Stream::Stderr, true)?;

    let cancelled = {
        let state = Rc::clone(state);
        lua.create_function(move |_, ()| Ok(state.cause.get().is_some()))?
    };
    let table_lib: Table = globals.get("table")?;
    let (pcall, xpcall, setmetatable): (Function, Function, Function) =
        lua.load(GUARDS).set_name("=guards").call((
            globals.get::<Function>("pcall")?,
            globals.get::<Function>("xpcall")?,
            globals.get::<Function>("setmetatable")?,
            table_lib.get::<Function>("pack")?,
            table_lib.get::<Function>("unpack")?,
            cancelled,
        ))?;

    Ok(Prelude {
        print,
        warn,
        io_write,
        stdout_write,
        stderr_write,
        pcall,
        xpcall,
        setmetatable,
    })
}

/// `io.write` style writer. Method variants (`io.stderr:write`) skip `self`.
fn stream_writer(
    lua: &Lua,
    state: &Rc<RunState>,
    tostring: &Function,
    stream: Stream,
    method: bool,
) -> LuaResult<Function> {
    let state = Rc::clone(state);
    let tostring = tostring.clone();
    lua.create_function(move |_, args: MultiValue| {
        let args: MultiValue = if method {
            args.into_iter().skip(1).collect()
        } else {
            args
        };
        let text = join_display(&tostring, args, "")?;
        state.write(stream, &text)
    })
}

fn join_display(tostring: &Function, args: MultiValue, separator: &str) -> LuaResult<String> {
    let mut out = String::new();
    for (i, arg) in args.into_iter().enumerate() {
        if i > 0 {
            out.push_str(separator);
        }
        let text: mlua::String = tostring.call(arg)?;
        out.push_str(&text.to_string_lossy());
    }
    Ok(out)
}
