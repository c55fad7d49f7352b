//! Tool registry — maps tool names to schema-typed handlers.
//!
//! The registry is populated at startup and then shared read-only behind
//! an `Arc`; nothing locks on the lookup path. Schemas are compiled once
//! at registration so a bad schema fails the server before it serves a
//! single request.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use tb_protocol::ToolSummary;

/// Implement this trait to expose an operation through the server.
///
/// Handlers run on the Tokio runtime and may block on external I/O.
/// A returned `Err` is reported to the caller as a `handler` failure
/// carrying the original message — it never crosses the wire as a raw
/// fault and never takes down the dispatcher.
///
/// # Example
///
/// ```rust,no_run
/// use tb_server::{ToolContext, ToolHandler};
///
/// struct PingTool;
///
/// #[async_trait::async_trait]
/// impl ToolHandler for PingTool {
///     async fn call(&self, _ctx: ToolContext, _args: serde_json::Value) -> anyhow::Result<serde_json::Value> {
///         Ok(serde_json::json!({ "pong": true }))
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync + 'static {
    /// Execute the tool.
    ///
    /// * `ctx`  — request context (correlation id, cancellation token)
    /// * `args` — arguments already validated against the input schema
    async fn call(&self, ctx: ToolContext, args: Value) -> anyhow::Result<Value>;
}

/// Context provided to every handler invocation.
#[derive(Clone, Debug)]
pub struct ToolContext {
    /// Correlation id of the originating request.
    pub request_id: String,
    /// Name the tool was invoked under.
    pub tool_name: String,
    /// Cancelled when the caller sends a `cancel_notice`, the call times
    /// out, or the connection is torn down. Long-running handlers should
    /// observe it at their suspension points.
    pub cancel: CancellationToken,
}

/// Errors raised while building the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate tool name: {0}")]
    DuplicateName(String),

    #[error("invalid {which} schema for tool {tool}: {message}")]
    InvalidSchema {
        tool: String,
        which: &'static str,
        message: String,
    },
}

/// A registered tool: name, schemas, and handler. Immutable once built.
pub struct ToolDescriptor {
    name: String,
    description: String,
    input_schema: Value,
    output_schema: Value,
    input_validator: jsonschema::Validator,
    output_validator: jsonschema::Validator,
    handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .field("output_schema", &self.output_schema)
            .finish_non_exhaustive()
    }
}

impl ToolDescriptor {
    /// Build a descriptor, compiling both schemas.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        output_schema: Value,
        handler: impl ToolHandler,
    ) -> Result<Self, RegistryError> {
        Self::with_handler(
            name,
            description,
            input_schema,
            output_schema,
            Arc::new(handler),
        )
    }

    /// Same as [`new`](Self::new) with a pre-wrapped handler, for callers
    /// that construct handlers dynamically.
    pub fn with_handler(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        output_schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<Self, RegistryError> {
        let name = name.into();
        let input_validator =
            jsonschema::validator_for(&input_schema).map_err(|e| RegistryError::InvalidSchema {
                tool: name.clone(),
                which: "input",
                message: e.to_string(),
            })?;
        let output_validator =
            jsonschema::validator_for(&output_schema).map_err(|e| RegistryError::InvalidSchema {
                tool: name.clone(),
                which: "output",
                message: e.to_string(),
            })?;
        Ok(Self {
            name,
            description: description.into(),
            input_schema,
            output_schema,
            input_validator,
            output_validator,
            handler,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> Arc<dyn ToolHandler> {
        self.handler.clone()
    }

    /// Check arguments against the input schema. On violation, returns the
    /// error message and the instance path of the offending field.
    pub fn validate_input(&self, args: &Value) -> Result<(), (String, String)> {
        check(&self.input_validator, args)
    }

    /// Check a handler result against the output schema.
    pub fn validate_output(&self, result: &Value) -> Result<(), (String, String)> {
        check(&self.output_validator, result)
    }

    /// Discovery summary for this tool.
    pub fn summary(&self) -> ToolSummary {
        ToolSummary {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
            output_schema: self.output_schema.clone(),
        }
    }
}

fn check(validator: &jsonschema::Validator, instance: &Value) -> Result<(), (String, String)> {
    validator.validate(instance).map_err(|err| {
        let path = err.instance_path.to_string();
        let path = if path.is_empty() { "/".to_string() } else { path };
        (err.to_string(), path)
    })
}

/// Registry of tool descriptors, in registration order.
///
/// Populate before serving; the server holds it behind an `Arc` and never
/// mutates it afterwards.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<ToolDescriptor>>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Fails if the name is already taken.
    pub fn register(&mut self, descriptor: ToolDescriptor) -> Result<(), RegistryError> {
        if self.by_name.contains_key(descriptor.name()) {
            return Err(RegistryError::DuplicateName(descriptor.name().to_string()));
        }
        let index = self.tools.len();
        self.by_name.insert(descriptor.name().to_string(), index);
        self.tools.push(Arc::new(descriptor));
        Ok(())
    }

    /// Look up a tool by exact name.
    pub fn lookup(&self, name: &str) -> Option<Arc<ToolDescriptor>> {
        self.by_name.get(name).map(|&i| self.tools[i].clone())
    }

    /// Discovery listing, lazily produced in registration order.
    pub fn list(&self) -> impl Iterator<Item = ToolSummary> + '_ {
        self.tools.iter().map(|d| d.summary())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
