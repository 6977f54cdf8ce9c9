// Tool registry and dispatcher.
//
// The registry is a fixed-capacity slot arena with a name index in
// front of it, so invocation does not pay a linear scan. A tool is
// immutable once registered; the four implementation variants are
// native handlers, composite step lists, scripts (reserved, always
// NotImplemented), and governed bytecode programs.
//
// system.defineTool is the installation path for dynamic tools: it
// parses a definition document, builds the variant payload, installs
// the tool, and snapshots it under tool.<name> when the definition
// asks for persistence. Registry init replays every tool.-prefixed
// snapshot, which is what makes installed capabilities survive a
// power cycle.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, error, info, warn};
use serde_json::{json, Value as Json};

use crate::bytecode::Program;
use crate::clock::Clock;
use crate::composite::{self, ExecFrame, Step};
use crate::govern::{Governor, LoadedProgram};
use crate::json::{get_array, get_bool, get_object, get_str, validate_params};
use crate::storage::PersistentStore;
use crate::value::Value;
use crate::vm::{Fault, HostFunctions, Interpreter};


pub const DEFINE_TOOL: &str = "system.defineTool";
pub const LIST_TOOLS: &str = "system.listTools";
pub const TOOL_KEY_PREFIX: &str = "tool.";


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ToolStatus {
    Success = 0,
    InvalidParameters = 1,
    NotFound = 2,
    ExecutionError = 3,
    PermissionDenied = 4,
    Timeout = 5,
    NotImplemented = 6,
    ParseError = 7,
    PersistFailed = 8,
}

impl ToolStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}


// Status plus an owned JSON body; failures carry the wire envelope
// {"error":true,"code":N,"message":...}. The optional binary
// side-band carries non-JSON payloads.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolResult {
    pub status: ToolStatus,
    pub body: Json,
    pub binary: Option<Vec<u8>>,
}

impl ToolResult {
    pub fn success(body: Json) -> ToolResult {
        ToolResult {
            status: ToolStatus::Success,
            body,
            binary: None,
        }
    }

    pub fn error(status: ToolStatus, message: &str) -> ToolResult {
        ToolResult {
            status,
            body: json!({
                "error": true,
                "code": status.code(),
                "message": message,
            }),
            binary: None,
        }
    }

    pub fn with_binary(mut self, data: Vec<u8>) -> ToolResult {
        self.binary = Some(data);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }
}


#[derive(Clone, Debug, PartialEq)]
pub enum RegistryError {
    InvalidArgument,
    AlreadyRegistered,
    CapacityExhausted,
    NotFound,
    NotDynamic,
    ParseError(String),
    MissingField(&'static str),
    UnknownImplementation(String),
    QuotaRefused,
    PersistFailed,
}

impl RegistryError {
    pub fn code(&self) -> i32 {
        match self {
            RegistryError::InvalidArgument => -1,
            RegistryError::AlreadyRegistered => -2,
            RegistryError::NotFound => -2,
            RegistryError::CapacityExhausted => -3,
            RegistryError::NotDynamic => -1,
            RegistryError::ParseError(_) => -1,
            RegistryError::MissingField(_) => -1,
            RegistryError::UnknownImplementation(_) => -1,
            RegistryError::QuotaRefused => -4,
            RegistryError::PersistFailed => -5,
        }
    }

    fn to_tool_result(&self) -> ToolResult {
        match self {
            RegistryError::ParseError(msg) => ToolResult::error(
                ToolStatus::ParseError,
                &format!("definition parse error: {}", msg)
            ),
            RegistryError::MissingField(field) => ToolResult::error(
                ToolStatus::InvalidParameters,
                &format!("missing required field '{}'", field)
            ),
            RegistryError::UnknownImplementation(kind) => ToolResult::error(
                ToolStatus::InvalidParameters,
                &format!("unknown implementation type '{}'", kind)
            ),
            RegistryError::AlreadyRegistered => ToolResult::error(
                ToolStatus::ExecutionError,
                "a tool with this name is already registered"
            ),
            RegistryError::CapacityExhausted => ToolResult::error(
                ToolStatus::ExecutionError,
                "tool registry is full"
            ),
            RegistryError::QuotaRefused => ToolResult::error(
                ToolStatus::ExecutionError,
                "bytecode program refused by the memory governor"
            ),
            RegistryError::PersistFailed => ToolResult::error(
                ToolStatus::PersistFailed,
                "failed to persist the tool definition"
            ),
            RegistryError::NotFound => ToolResult::error(
                ToolStatus::NotFound,
                "tool not found"
            ),
            _ => ToolResult::error(
                ToolStatus::InvalidParameters,
                "invalid tool definition"
            ),
        }
    }
}

pub type Result<T> = core::result::Result<T, RegistryError>;


pub type NativeHandler = fn(&Json) -> ToolResult;

pub enum ToolImpl {
    Native(NativeHandler),
    Composite(Vec<Step>),
    Script { source: String, language: String },
    Bytecode(LoadedProgram),
}

impl ToolImpl {
    pub fn type_name(&self) -> &'static str {
        match self {
            ToolImpl::Native(_) => "native",
            ToolImpl::Composite(_) => "composite",
            ToolImpl::Script { .. } => "script",
            ToolImpl::Bytecode(_) => "bytecode",
        }
    }
}


pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub schema: Option<Json>,
    pub implementation: ToolImpl,
    pub dynamic: bool,
    pub persistent: bool,
    pub created_ms: u64,
}


pub struct ToolRegistry {
    tools: Vec<Option<ToolDefinition>>,
    index: HashMap<String, usize>,
    store: Rc<RefCell<PersistentStore>>,
    governor: Governor,
    host: HostFunctions,
    clock: Rc<Clock>,
}

impl ToolRegistry {
    pub fn new(
        max_tools: usize,
        store: Rc<RefCell<PersistentStore>>,
        governor: Governor,
        clock: Rc<Clock>
    ) -> Result<ToolRegistry> {
        if max_tools == 0 {
            return Err(RegistryError::InvalidArgument);
        }
        let mut tools = Vec::with_capacity(max_tools);
        tools.resize_with(max_tools, || None);
        Ok(ToolRegistry {
            tools,
            index: HashMap::new(),
            store,
            governor,
            host: HostFunctions::new(),
            clock,
        })
    }

    // Register the built-in definition tool and replay persisted
    // dynamic tools. Fails if init already ran.
    pub fn init(&mut self) -> Result<usize> {
        if self.index.contains_key(DEFINE_TOOL) {
            return Err(RegistryError::AlreadyRegistered);
        }
        self.register_native(
            DEFINE_TOOL,
            define_tool_stub,
            Some(define_tool_schema())
        )?;
        let loaded = self.load_all_dynamic();
        info!("tools: registry up, {} persisted tool(s) restored", loaded);
        Ok(loaded)
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    pub fn governor_mut(&mut self) -> &mut Governor {
        &mut self.governor
    }

    pub fn host_mut(&mut self) -> &mut HostFunctions {
        &mut self.host
    }

    pub fn tool_count(&self) -> usize {
        self.index.len()
    }

    pub fn register_native(
        &mut self,
        name: &str,
        handler: NativeHandler,
        schema: Option<Json>
    ) -> Result<()> {
        if name.is_empty() {
            return Err(RegistryError::InvalidArgument);
        }
        self.check_installable(name)?;
        self.install(ToolDefinition {
            name: String::from(name),
            description: None,
            schema,
            implementation: ToolImpl::Native(handler),
            dynamic: false,
            persistent: false,
            created_ms: self.clock.now_ms(),
        })
    }

    fn check_installable(&self, name: &str) -> Result<()> {
        if self.index.contains_key(name) {
            return Err(RegistryError::AlreadyRegistered);
        }
        if self.tools.iter().all(Option::is_some) {
            return Err(RegistryError::CapacityExhausted);
        }
        Ok(())
    }

    fn install(&mut self, definition: ToolDefinition) -> Result<()> {
        self.check_installable(&definition.name)?;
        let slot = self.tools
            .iter()
            .position(Option::is_none)
            .ok_or(RegistryError::CapacityExhausted)?;
        debug!("tools: installing '{}' ({})",
               definition.name, definition.implementation.type_name());
        self.index.insert(definition.name.clone(), slot);
        self.tools[slot] = Some(definition);
        Ok(())
    }

    // The handler behind system.defineTool.
    pub fn register_dynamic(&mut self, params: &Json) -> Result<String> {
        if !params.is_object() {
            return Err(RegistryError::ParseError(
                String::from("definition is not an object")
            ));
        }

        let name = get_str(params, "name")
            .ok_or(RegistryError::MissingField("name"))?;
        if name.is_empty() {
            return Err(RegistryError::InvalidArgument);
        }
        let name = String::from(name);

        // Fail before the payload is built so a refused install
        // cannot leak a charged bytecode program.
        self.check_installable(&name)?;

        let description = get_str(params, "description").map(String::from);
        let schema = params.get("schema").filter(|s| s.is_object()).cloned();
        let persistent = get_bool(params, "persistent", false);

        let implementation_doc = get_object(params, "implementation")
            .ok_or(RegistryError::MissingField("implementation"))?;

        // A definition without an implementationType is composite;
        // dynamic tools cannot carry a native function pointer.
        let impl_type = get_str(params, "implementationType")
            .unwrap_or("composite");

        let implementation = match impl_type {
            "composite" => {
                ToolImpl::Composite(parse_steps(implementation_doc)?)
            },
            "script" => {
                let source = get_str(implementation_doc, "script")
                    .ok_or(RegistryError::MissingField("script"))?;
                let language = get_str(implementation_doc, "language")
                    .unwrap_or("");
                ToolImpl::Script {
                    source: String::from(source),
                    language: String::from(language),
                }
            },
            "bytecode" => {
                let encoded = get_str(implementation_doc, "bytecode")
                    .ok_or(RegistryError::MissingField("bytecode"))?;
                let program = Program::from_base64(encoded).map_err(|e| {
                    RegistryError::ParseError(format!("{:?}", e))
                })?;
                program.validate().map_err(|e| {
                    RegistryError::ParseError(format!("{:?}", e))
                })?;
                let loaded = self.governor
                    .load_program(program)
                    .map_err(|_| RegistryError::QuotaRefused)?;
                ToolImpl::Bytecode(loaded)
            },
            other => {
                return Err(RegistryError::UnknownImplementation(
                    String::from(other)
                ));
            },
        };

        self.install(ToolDefinition {
            name: name.clone(),
            description,
            schema,
            implementation,
            dynamic: true,
            persistent,
            created_ms: self.clock.now_ms(),
        })?;

        if persistent {
            if let Err(e) = self.save_dynamic(&name) {
                warn!("tools: persisting '{}' failed: {:?}", name, e);
                let _ = self.unregister(&name);
                return Err(RegistryError::PersistFailed);
            }
        }

        Ok(name)
    }

    pub fn unregister(&mut self, name: &str) -> Result<()> {
        let slot = *self.index.get(name).ok_or(RegistryError::NotFound)?;
        let dynamic = self.tools[slot]
            .as_ref()
            .map_or(false, |t| t.dynamic);
        if !dynamic {
            return Err(RegistryError::NotDynamic);
        }

        self.index.remove(name);
        if let Some(definition) = self.tools[slot].take() {
            if let ToolImpl::Bytecode(loaded) = definition.implementation {
                self.governor.free_program(loaded);
            }
            if definition.persistent {
                let key = format!("{}{}", TOOL_KEY_PREFIX, name);
                let _ = self.store.borrow_mut().delete(&key);
            }
        }
        Ok(())
    }

    pub fn get_definition(&self, name: &str) -> Option<&ToolDefinition> {
        self.index
            .get(name)
            .and_then(|&slot| self.tools[slot].as_ref())
    }

    pub fn get_schema(&self, name: &str) -> Option<&Json> {
        self.get_definition(name).and_then(|t| t.schema.as_ref())
    }

    pub fn list(&self) -> Json {
        let tools: Vec<Json> = self.tools
            .iter()
            .flatten()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "hasSchema": t.schema.is_some(),
                    "isDynamic": t.dynamic,
                    "type": t.implementation.type_name(),
                })
            })
            .collect();
        Json::Array(tools)
    }

    // Top-level dispatch for a {"tool": ..., "params": ...}
    // invocation document.
    pub fn execute(&mut self, doc: &Json) -> ToolResult {
        let mut frame = ExecFrame::new();
        self.execute_in_frame(doc, &mut frame)
    }

    pub(crate) fn execute_in_frame(
        &mut self,
        doc: &Json,
        frame: &mut ExecFrame
    ) -> ToolResult {
        let name = match get_str(doc, "tool") {
            Some(name) => String::from(name),
            None => {
                return ToolResult::error(
                    ToolStatus::InvalidParameters,
                    "missing tool name"
                );
            }
        };

        let slot = match self.index.get(&name) {
            Some(&slot) => slot,
            None => {
                return ToolResult::error(
                    ToolStatus::NotFound,
                    &format!("tool '{}' not found", name)
                );
            }
        };

        let params = doc.get("params").cloned().unwrap_or(Json::Null);

        // The schema gate runs before any tool body.
        if let Some(definition) = self.tools[slot].as_ref() {
            if let Some(schema) = &definition.schema {
                if !validate_params(&params, schema) {
                    return ToolResult::error(
                        ToolStatus::InvalidParameters,
                        "parameters do not satisfy the tool schema"
                    );
                }
            }
        }

        // The definition and listing tools need the registry itself
        // and are dispatched by name rather than through their table
        // slots.
        if name == DEFINE_TOOL {
            return match self.register_dynamic(&params) {
                Ok(installed) => {
                    ToolResult::success(json!({"registered": installed}))
                },
                Err(e) => e.to_tool_result(),
            };
        }
        if name == LIST_TOOLS {
            return ToolResult::success(self.list());
        }

        enum Kind {
            Native(NativeHandler),
            Composite(Vec<Step>),
            Script,
            Bytecode,
        }

        let kind = match self.tools[slot].as_ref() {
            Some(definition) => match &definition.implementation {
                ToolImpl::Native(handler) => Kind::Native(*handler),
                ToolImpl::Composite(steps) => Kind::Composite(steps.clone()),
                ToolImpl::Script { .. } => Kind::Script,
                ToolImpl::Bytecode(_) => Kind::Bytecode,
            },
            None => {
                return ToolResult::error(ToolStatus::NotFound, "tool vanished");
            }
        };

        match kind {
            Kind::Native(handler) => handler(&params),
            Kind::Composite(steps) => {
                composite::execute(self, &name, &steps, &params, frame)
            },
            Kind::Script => ToolResult::error(
                ToolStatus::NotImplemented,
                "script tools are not implemented"
            ),
            Kind::Bytecode => self.execute_bytecode(slot, &params),
        }
    }

    fn execute_bytecode(&mut self, slot: usize, params: &Json) -> ToolResult {
        let ToolRegistry { tools, governor, host, clock, .. } = self;

        let loaded = match tools[slot].as_ref().map(|t| &t.implementation) {
            Some(ToolImpl::Bytecode(loaded)) => loaded,
            _ => {
                return ToolResult::error(
                    ToolStatus::ExecutionError,
                    "not a bytecode tool"
                );
            }
        };

        let config = governor.config();
        let mut ctx = match governor.alloc_context(
            &loaded.program,
            config.max_stack_size
        ) {
            Ok(ctx) => ctx,
            Err(e) => {
                return ToolResult::error(
                    ToolStatus::ExecutionError,
                    &format!("context refused by governor: {:?}", e)
                );
            }
        };

        // Caller parameters seed same-named program variables.
        if let Some(map) = params.as_object() {
            for (key, value) in map {
                ctx.seed(&loaded.program, key, Value::from_json(value));
            }
        }

        let clock = clock.clone();
        let outcome = Interpreter::new(&loaded.program, host)
            .run(&mut ctx, &clock, config.max_execution_time_ms);

        let result = match outcome {
            Ok(value) => {
                ToolResult::success(json!({"result": value.to_json()}))
            },
            Err(Fault::Timeout) => ToolResult::error(
                ToolStatus::Timeout,
                "bytecode execution exceeded its time ceiling"
            ),
            Err(fault) => ToolResult::error(
                ToolStatus::ExecutionError,
                &fault.message()
            ),
        };

        governor.free_context(ctx);
        result
    }

    // ------------------------------------------------------------------
    // Persistence

    pub fn save_dynamic(&mut self, name: &str) -> Result<()> {
        let definition = self.get_definition(name)
            .ok_or(RegistryError::NotFound)?;
        if !definition.dynamic {
            return Err(RegistryError::NotDynamic);
        }

        let doc = serialize_tool(definition);
        let key = format!("{}{}", TOOL_KEY_PREFIX, name);
        self.store
            .borrow_mut()
            .write(&key, doc.to_string().as_bytes())
            .map_err(|e| {
                warn!("tools: write of {} failed: {:?}", key, e);
                RegistryError::PersistFailed
            })
    }

    pub fn load_dynamic(&mut self, name: &str) -> Result<()> {
        let key = format!("{}{}", TOOL_KEY_PREFIX, name);
        let raw = self.store
            .borrow()
            .read(&key)
            .map_err(|_| RegistryError::NotFound)?;
        let doc: Json = serde_json::from_slice(&raw)
            .map_err(|e| RegistryError::ParseError(e.to_string()))?;
        self.register_dynamic(&doc)?;
        Ok(())
    }

    pub fn load_all_dynamic(&mut self) -> usize {
        let keys = self.store
            .borrow()
            .keys_with_prefix(TOOL_KEY_PREFIX);

        let mut loaded = 0;
        for key in keys {
            let name = String::from(&key[TOOL_KEY_PREFIX.len()..]);
            if self.index.contains_key(&name) {
                continue;
            }
            match self.load_dynamic(&name) {
                Ok(()) => loaded += 1,
                Err(e) => {
                    error!("tools: could not restore '{}': {:?}", name, e)
                },
            }
        }
        loaded
    }
}


fn parse_steps(doc: &Json) -> Result<Vec<Step>> {
    let entries = get_array(doc, "steps")
        .ok_or(RegistryError::MissingField("steps"))?;

    let mut steps = Vec::with_capacity(entries.len());
    for entry in entries {
        let tool = match get_str(entry, "tool") {
            Some(tool) => String::from(tool),
            None => {
                warn!("tools: skipping step without a tool name");
                continue;
            }
        };

        // The template is a string on the wire, but an inline
        // object is accepted and kept in its serialized form.
        let params = match entry.get("params") {
            Some(Json::String(template)) => template.clone(),
            Some(other) if !other.is_null() => other.to_string(),
            _ => String::from("{}"),
        };

        steps.push(Step {
            tool,
            params,
            store: get_str(entry, "store").map(String::from),
        });
    }
    Ok(steps)
}


fn serialize_tool(definition: &ToolDefinition) -> Json {
    let implementation = match &definition.implementation {
        ToolImpl::Composite(steps) => {
            let steps: Vec<Json> = steps
                .iter()
                .map(|s| {
                    let mut step = json!({
                        "tool": s.tool,
                        "params": s.params,
                    });
                    if let Some(store) = &s.store {
                        step["store"] = Json::from(store.as_str());
                    }
                    step
                })
                .collect();
            json!({"steps": steps})
        },
        ToolImpl::Script { source, language } => {
            json!({"script": source, "language": language})
        },
        ToolImpl::Bytecode(loaded) => {
            json!({"bytecode": loaded.program.to_base64()})
        },
        // Native tools are never dynamic, so this arm never reaches
        // the store.
        ToolImpl::Native(_) => Json::Null,
    };

    let mut doc = json!({
        "name": definition.name,
        "implementationType": definition.implementation.type_name(),
        "implementation": implementation,
        "persistent": definition.persistent,
        "creationTime": definition.created_ms,
    });
    if let Some(description) = &definition.description {
        doc["description"] = Json::from(description.as_str());
    }
    if let Some(schema) = &definition.schema {
        doc["schema"] = schema.clone();
    }
    doc
}


fn define_tool_schema() -> Json {
    json!({
        "name": DEFINE_TOOL,
        "description": "Define a new tool dynamically",
        "params": {
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "description": {"type": "string"},
                "schema": {"type": "object"},
                "implementationType": {"type": "string"},
                "implementation": {"type": "object"},
                "persistent": {"type": "boolean"},
            },
            "required": ["name", "implementation"],
        },
    })
}

// Placeholder slot handlers; both tools are dispatched by name
// before variant dispatch ever looks here.
fn define_tool_stub(_params: &Json) -> ToolResult {
    ToolResult::error(ToolStatus::ExecutionError, "misrouted definition call")
}

pub fn list_tools_stub(_params: &Json) -> ToolResult {
    ToolResult::error(ToolStatus::ExecutionError, "misrouted listing call")
}


// ---------------------------------------------------------------------------
// Built-in native tools

pub fn builtin_log(params: &Json) -> ToolResult {
    let message = get_str(params, "message").unwrap_or("");
    match get_str(params, "level").unwrap_or("info") {
        "error" => error!("{}", message),
        "warn" => warn!("{}", message),
        "debug" => debug!("{}", message),
        _ => info!("{}", message),
    }
    ToolResult::success(json!({"logged": true}))
}

pub fn builtin_echo(params: &Json) -> ToolResult {
    ToolResult::success(params.clone())
}
