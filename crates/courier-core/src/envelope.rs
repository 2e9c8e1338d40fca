//! Request/reply shapes exchanged over every transport.
//!
//! ```text
//! {"targetType":"IRemoteService","targetMethod":"DoWork",
//!  "parameterValues":["{\"Payload\":\"hi\"}"],"parameterTypes":["Request"],
//!  "genericArguments":[]}
//!
//! {"outcome":"value","returnType":"Response","returnValue":"{...}"}
//! {"outcome":"void"}
//! {"outcome":"fault","errorKind":"...","errorMessage":"...","errorDetail":"..."}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{CourierError, RemoteError, Result};
use crate::wire::{EncodedArgs, Wire};

/// One remote invocation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub target_type: String,
    pub target_method: String,
    #[serde(default)]
    pub parameter_values: Vec<String>,
    #[serde(default)]
    pub parameter_types: Vec<String>,
    #[serde(default)]
    pub generic_arguments: Vec<String>,
}

impl Request {
    pub fn new(target_type: impl Into<String>, target_method: impl Into<String>) -> Self {
        Self {
            target_type: target_type.into(),
            target_method: target_method.into(),
            parameter_values: Vec::new(),
            parameter_types: Vec::new(),
            generic_arguments: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: EncodedArgs) -> Self {
        self.parameter_values = args.values;
        self.parameter_types = args.types;
        self
    }

    pub fn with_generic_arguments(mut self, generic_arguments: Vec<String>) -> Self {
        self.generic_arguments = generic_arguments;
        self
    }

    /// Check that every value has a matching type identifier.
    pub fn validate(&self) -> Result<()> {
        if self.parameter_values.len() != self.parameter_types.len() {
            return Err(CourierError::Protocol {
                message: format!(
                    "{} parameter values but {} parameter types",
                    self.parameter_values.len(),
                    self.parameter_types.len()
                ),
            });
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Failure data captured on the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fault {
    pub error_kind: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl Fault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_kind: kind.into(),
            error_message: message.into(),
            error_detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }

    /// Capture an implementation error. The kind is the error's type name and
    /// the detail walks its `source()` chain.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        Self::from_error_as(std::any::type_name::<E>(), err)
    }

    /// Capture an error under an explicit kind, keeping its message and
    /// `source()` chain.
    pub fn from_error_as<E>(kind: impl Into<String>, err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let mut detail = format!("{:?}", err);
        let mut source = err.source();
        while let Some(cause) = source {
            detail.push_str("\ncaused by: ");
            detail.push_str(&cause.to_string());
            source = cause.source();
        }
        Self {
            error_kind: kind.into(),
            error_message: err.to_string(),
            error_detail: Some(detail),
        }
    }
}

impl From<Fault> for RemoteError {
    fn from(fault: Fault) -> Self {
        RemoteError {
            original_type: fault.error_kind,
            message: fault.error_message,
            detail: fault.error_detail,
        }
    }
}

/// Outcome of one invocation.
///
/// `Void` is an explicit success value. A request that does not belong to a
/// receiver never produces a `Reply` at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum Reply {
    Void,
    #[serde(rename_all = "camelCase")]
    Value {
        return_type: String,
        return_value: String,
    },
    Fault(Fault),
}

impl Reply {
    /// Build a success reply from a typed result.
    pub fn from_value<T: Wire>(value: &T) -> Result<Self> {
        if T::is_void() {
            return Ok(Reply::Void);
        }
        Ok(Reply::Value {
            return_type: value.runtime_type(),
            return_value: crate::wire::encode_value(value)?,
        })
    }

    pub fn fault(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Reply::Fault(Fault::new(kind, message))
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, Reply::Fault(_))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
