//! Wire types exchanged with the scheduler's DAG-call endpoint.
//!
//! A [`DagCall`] is sent as one length-delimited frame holding its JSON
//! encoding; the scheduler answers with exactly one [`GenericResponse`].
//! Argument bodies are opaque bytes, carried as base64 strings.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How the scheduler should deserialize an argument body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializerKind {
    /// The scheduler's default object serializer.
    #[default]
    Default,
    /// UTF-8 string.
    String,
    /// Serialized numpy array.
    Numpy,
}

/// A single serialized argument value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentValue {
    /// Raw serialized body.
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,

    /// Serializer used to produce `body`.
    #[serde(rename = "type", default)]
    pub serializer: SerializerKind,
}

impl ArgumentValue {
    /// Wraps an already-serialized body using the default serializer.
    pub fn bytes(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            serializer: SerializerKind::Default,
        }
    }

    /// Wraps a UTF-8 string argument.
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            body: value.into().into_bytes(),
            serializer: SerializerKind::String,
        }
    }

    /// Overrides the serializer tag.
    pub fn with_serializer(mut self, serializer: SerializerKind) -> Self {
        self.serializer = serializer;
        self
    }
}

/// The ordered argument list passed to one function of a DAG.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arguments {
    /// Positional argument values.
    #[serde(default)]
    pub values: Vec<ArgumentValue>,
}

impl Arguments {
    /// Creates an empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value.
    pub fn push(mut self, value: ArgumentValue) -> Self {
        self.values.push(value);
        self
    }

    /// Total size of all argument bodies in bytes.
    pub fn body_len(&self) -> usize {
        self.values.iter().map(|v| v.body.len()).sum()
    }
}

impl From<ArgumentValue> for Arguments {
    fn from(value: ArgumentValue) -> Self {
        Self {
            values: vec![value],
        }
    }
}

impl FromIterator<ArgumentValue> for Arguments {
    fn from_iter<I: IntoIterator<Item = ArgumentValue>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// A request to execute a registered DAG.
///
/// `function_args` maps each function (parameter) name to its arguments;
/// the map guarantees unique keys. When `response_address` is set the
/// scheduler pushes the result straight to that address instead of only
/// storing it in the KVS.
///
/// # Examples
///
/// ```
/// use cloudburst_client::types::{ArgumentValue, DagCall};
///
/// let call = DagCall::new("word_count")
///     .with_arg("split", ArgumentValue::string("a b c"));
/// let bytes = call.encode(1024).unwrap();
/// assert_eq!(DagCall::decode(&bytes).unwrap(), call);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagCall {
    /// Name of the registered DAG.
    pub name: String,

    /// Arguments keyed by function name.
    #[serde(default)]
    pub function_args: BTreeMap<String, Arguments>,

    /// Where the scheduler should push the result, if anywhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_address: Option<String>,
}

impl DagCall {
    /// Creates a call with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            function_args: BTreeMap::new(),
            response_address: None,
        }
    }

    /// Creates a call from a prepared argument map.
    pub fn with_args(name: impl Into<String>, function_args: BTreeMap<String, Arguments>) -> Self {
        Self {
            name: name.into(),
            function_args,
            response_address: None,
        }
    }

    /// Adds (or replaces) the arguments for one function.
    pub fn with_arg(mut self, function: impl Into<String>, args: impl Into<Arguments>) -> Self {
        self.function_args.insert(function.into(), args.into());
        self
    }

    /// Stamps the call with the address the result should be pushed to.
    pub fn with_response_address(mut self, address: impl Into<String>) -> Self {
        self.response_address = Some(address.into());
        self
    }

    /// Checks the call is well formed.
    ///
    /// # Errors
    ///
    /// [`Error::Serialization`] if the DAG name or any function name is empty.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Serialization("DAG name must not be empty".to_string()));
        }
        if let Some(key) = self.function_args.keys().find(|k| k.trim().is_empty()) {
            return Err(Error::Serialization(format!(
                "function name {:?} in call to '{}' must not be empty",
                key, self.name
            )));
        }
        Ok(())
    }

    /// Validates and encodes the call, rejecting encodings larger than
    /// `max_bytes`.
    pub fn encode(&self, max_bytes: usize) -> Result<Bytes> {
        self.validate()?;
        let encoded = serde_json::to_vec(self).map_err(|e| {
            Error::Serialization(format!("failed to encode call to '{}': {}", self.name, e))
        })?;
        if encoded.len() > max_bytes {
            return Err(Error::Serialization(format!(
                "encoded call to '{}' is {} bytes, exceeding the {} byte limit",
                self.name,
                encoded.len(),
                max_bytes
            )));
        }
        Ok(Bytes::from(encoded))
    }

    /// Decodes a call from its wire encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Serialization(format!("invalid DAG call: {}", e)))
    }
}

/// Why the scheduler refused a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallErrorCode {
    /// No DAG with the requested name is registered.
    NoSuchDag,
    /// The scheduler has no executors available.
    NoResources,
    /// The DAG failed while being scheduled.
    DagFailure,
    /// Any other scheduler-side failure.
    #[serde(other)]
    Other,
}

impl fmt::Display for CallErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuchDag => write!(f, "no_such_dag"),
            Self::NoResources => write!(f, "no_resources"),
            Self::DagFailure => write!(f, "dag_failure"),
            Self::Other => write!(f, "other"),
        }
    }
}

fn default_success() -> bool {
    true
}

/// The scheduler's acknowledgement of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericResponse {
    /// Whether the call was accepted.
    #[serde(default = "default_success")]
    pub success: bool,

    /// Error code when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CallErrorCode>,

    /// KVS key under which the result will be stored.
    #[serde(default)]
    pub response_id: String,
}

impl GenericResponse {
    /// An accepted call with the given response id.
    pub fn accepted(response_id: impl Into<String>) -> Self {
        Self {
            success: true,
            error: None,
            response_id: response_id.into(),
        }
    }

    /// A refused call.
    pub fn rejected(error: CallErrorCode) -> Self {
        Self {
            success: false,
            error: Some(error),
            response_id: String::new(),
        }
    }

    /// Encodes the response.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decodes a response from its wire encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Protocol(format!("invalid scheduler response: {}", e)))
    }

    /// Extracts the response id of an accepted call to `dag`.
    ///
    /// # Errors
    ///
    /// [`Error::Rejected`] if the scheduler refused the call and
    /// [`Error::Protocol`] if an accepted call carries no response id.
    pub fn into_response_id(self, dag: &str) -> Result<String> {
        if !self.success {
            return Err(Error::Rejected {
                dag: dag.to_string(),
                reason: self
                    .error
                    .map_or_else(|| "unspecified".to_string(), |code| code.to_string()),
            });
        }
        if self.response_id.is_empty() {
            return Err(Error::Protocol(format!(
                "scheduler accepted call to '{}' without a response id",
                dag
            )));
        }
        Ok(self.response_id)
    }
}

mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
