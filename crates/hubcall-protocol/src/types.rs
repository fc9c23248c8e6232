//! Remote call types: what is being called, with what, and what came back.
//!
//! Everything that travels inside a wire message lives here. Calls are
//! self-describing: a [`RemoteMethodCall`] names the endpoint, the method,
//! and the type of every argument, so the receiving side can dispatch by
//! name and signature without compiled stubs.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// One method of a capability: its name and argument type descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodSignature {
    pub name: String,
    pub arg_types: Vec<String>,
}

impl MethodSignature {
    pub fn new<I, S>(name: impl Into<String>, arg_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            arg_types: arg_types.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.arg_types.join(", "))
    }
}

/// A named interface: the explicit method table an implementor declares
/// and an endpoint requires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub methods: Vec<MethodSignature>,
}

impl Capability {
    /// Starts a capability with no methods.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    /// Adds a method to the table.
    pub fn method<I, S>(mut self, name: impl Into<String>, arg_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods.push(MethodSignature::new(name, arg_types));
        self
    }

    /// Whether a value declaring `self` can stand in for `required`:
    /// same capability name, and every required method is declared here
    /// with the same argument types.
    pub fn satisfies(&self, required: &Capability) -> bool {
        self.name == required.name
            && required
                .methods
                .iter()
                .all(|m| self.methods.contains(m))
    }

    /// Finds the method matching a call's name and argument types.
    pub fn find(&self, method_name: &str, arg_types: &[String]) -> Option<&MethodSignature> {
        self.methods
            .iter()
            .find(|m| m.name == method_name && m.arg_types == arg_types)
    }
}

/// What is being invoked and under which name.
///
/// Endpoints are keyed by `name`; the capability is checked when an
/// implementor is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteName {
    pub name: String,
    pub capability: Capability,
}

impl RemoteName {
    pub fn new(name: impl Into<String>, capability: Capability) -> Self {
        Self {
            name: name.into(),
            capability,
        }
    }
}

impl fmt::Display for RemoteName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.capability.name)
    }
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

/// A method invocation addressed to a named endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMethodCall {
    pub remote_name: String,
    pub method_name: String,
    pub args: Vec<Value>,
    pub arg_types: Vec<String>,
}

impl RemoteMethodCall {
    /// Starts a call with no arguments.
    pub fn new(remote_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            remote_name: remote_name.into(),
            method_name: method_name.into(),
            args: Vec::new(),
            arg_types: Vec::new(),
        }
    }

    /// Appends an argument together with its type descriptor.
    pub fn arg(mut self, arg_type: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arg_types.push(arg_type.into());
        self.args.push(value.into());
        self
    }
}

impl fmt::Display for RemoteMethodCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}({})",
            self.remote_name,
            self.method_name,
            self.arg_types.join(", ")
        )
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// The category of a failed remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// No implementor is registered for the name.
    NotFound,
    /// More than one result came back where exactly one was expected.
    TooManyImplementors,
    /// The transport went away while the call was outstanding.
    ConnectionLost,
    /// A capability mismatch or a bad argument.
    InvalidArgument,
    /// The invocation protocol was violated.
    IllegalState,
    /// The endpoint's capability has no method with this name and signature.
    NoSuchMethod,
    /// The implementor itself failed (returned an error or panicked).
    ImplementorFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not found",
            Self::TooManyImplementors => "too many implementors",
            Self::ConnectionLost => "connection lost",
            Self::InvalidArgument => "invalid argument",
            Self::IllegalState => "illegal state",
            Self::NoSuchMethod => "no such method",
            Self::ImplementorFailed => "implementor failed",
        };
        f.write_str(s)
    }
}

/// A captured error description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// The outcome of one remote call: a return value or a captured error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RemoteMethodCallResults {
    Value(Value),
    Error(RemoteError),
}

impl RemoteMethodCallResults {
    /// Shorthand for an error result.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error(RemoteError::new(kind, message))
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    /// The error kind, if this is an error result.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Value(_) => None,
            Self::Error(e) => Some(e.kind),
        }
    }

    /// Converts into a plain `Result`.
    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self {
            Self::Value(v) => Ok(v),
            Self::Error(e) => Err(e),
        }
    }
}

impl From<Result<Value, RemoteError>> for RemoteMethodCallResults {
    fn from(result: Result<Value, RemoteError>) -> Self {
        match result {
            Ok(v) => Self::Value(v),
            Err(e) => Self::Error(e),
        }
    }
}
