//! The `Implementor` trait: the extension point for code that answers
//! remote calls.

use std::collections::HashMap;
use std::fmt;

use hubcall_protocol::{Capability, ErrorKind, MethodSignature, RemoteError, RemoteMethodCall};
use hubcall_transport::Node;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Who is calling, and under which sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationContext {
    /// The node that issued the call. For a call made on the same node,
    /// this is the local node.
    pub calling_node: Node,
    /// The number taken from the endpoint for this call.
    pub sequence: u64,
}

/// An object that executes remote calls locally.
///
/// Implementors declare the capabilities they provide up front; an
/// endpoint only accepts an implementor that provides the endpoint's
/// capability. `invoke` runs on a blocking worker thread and may take
/// as long as it needs.
pub trait Implementor: Send + Sync + 'static {
    /// The capabilities this implementor answers.
    fn capabilities(&self) -> Vec<Capability>;

    /// Executes `call`.
    ///
    /// A returned error becomes the call's error result unchanged. A panic
    /// becomes a result of kind [`ErrorKind::ImplementorFailed`].
    fn invoke(&self, ctx: &InvocationContext, call: &RemoteMethodCall) -> Result<Value, RemoteError>;
}

/// Whether `implementor` declares a capability satisfying `required`.
pub fn provides(implementor: &dyn Implementor, required: &Capability) -> bool {
    implementor
        .capabilities()
        .iter()
        .any(|declared| declared.satisfies(required))
}

/// Decodes argument `index` of a call into `T`.
///
/// # Errors
/// [`ErrorKind::InvalidArgument`] if the argument is missing or has the
/// wrong shape.
pub fn decode_arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, RemoteError> {
    let value = args.get(index).ok_or_else(|| {
        RemoteError::new(ErrorKind::InvalidArgument, format!("missing argument {index}"))
    })?;
    serde_json::from_value(value.clone()).map_err(|e| {
        RemoteError::new(ErrorKind::InvalidArgument, format!("argument {index}: {e}"))
    })
}

// ---------------------------------------------------------------------------
// DispatchTable
// ---------------------------------------------------------------------------

type Handler = Box<dyn Fn(&InvocationContext, &[Value]) -> Result<Value, RemoteError> + Send + Sync>;

/// An [`Implementor`] assembled from closures, one per method.
///
/// The declared capability is exactly the set of registered methods, so
/// the table is also the capability declaration.
///
/// ```rust
/// use hubcall_endpoint::{DispatchTable, decode_arg};
/// use serde_json::json;
///
/// let chat = DispatchTable::new("Chat")
///     .method("say", ["string"], |ctx, args| {
///         let text: String = decode_arg(args, 0)?;
///         Ok(json!(format!("{}: {text}", ctx.calling_node)))
///     });
/// assert_eq!(chat.capability().methods.len(), 1);
/// ```
pub struct DispatchTable {
    capability: Capability,
    handlers: HashMap<MethodSignature, Handler>,
}

impl DispatchTable {
    /// Starts an empty table for the capability `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            capability: Capability::new(name),
            handlers: HashMap::new(),
        }
    }

    /// Registers `handler` for `name(arg_types...)`. Registering the same
    /// signature twice replaces the earlier handler.
    pub fn method<I, S, F>(mut self, name: impl Into<String>, arg_types: I, handler: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&InvocationContext, &[Value]) -> Result<Value, RemoteError> + Send + Sync + 'static,
    {
        let signature = MethodSignature::new(name, arg_types);
        if !self.capability.methods.contains(&signature) {
            self.capability.methods.push(signature.clone());
        }
        self.handlers.insert(signature, Box::new(handler));
        self
    }

    /// The capability this table declares.
    pub fn capability(&self) -> &Capability {
        &self.capability
    }
}

impl Implementor for DispatchTable {
    fn capabilities(&self) -> Vec<Capability> {
        vec![self.capability.clone()]
    }

    fn invoke(&self, ctx: &InvocationContext, call: &RemoteMethodCall) -> Result<Value, RemoteError> {
        let signature = MethodSignature::new(call.method_name.clone(), call.arg_types.clone());
        match self.handlers.get(&signature) {
            Some(handler) => handler(ctx, &call.args),
            None => Err(RemoteError::new(
                ErrorKind::NoSuchMethod,
                format!("{} has no method {signature}", self.capability.name),
            )),
        }
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}
