//! Positional parameter encoding and decoding.
//!
//! Operations take their parameters as a tuple; [`FromParams`] decodes the
//! positional JSON array of a call into that tuple and [`IntoParams`] builds
//! the array on the calling side. Arity and type mismatches surface as
//! `RpcError::InvalidParams`.

use crate::error::{Result, RpcError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Decode a call's positional params into a typed value.
pub trait FromParams: Sized {
    fn from_params(params: Vec<Value>) -> Result<Self>;
}

/// Encode a typed value into a call's positional params.
pub trait IntoParams {
    fn into_params(self) -> Result<Vec<Value>>;
}

/// Normalize the raw `params` field of a call into a positional list.
///
/// Absent or `null` params read as an empty list; named (object) params are
/// rejected.
pub fn positional(params: Option<Value>) -> Result<Vec<Value>> {
    match params {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(values)) => Ok(values),
        Some(other) => Err(RpcError::InvalidParams {
            message: format!("expected positional params array, got {}", json_type(&other)),
        }),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn arity_error(expected: usize, got: usize) -> RpcError {
    RpcError::InvalidParams {
        message: format!("expected {} params, got {}", expected, got),
    }
}

fn decode<T: DeserializeOwned>(index: usize, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| RpcError::InvalidParams {
        message: format!("param {}: {}", index, e),
    })
}

fn encode<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| RpcError::InvalidParams {
        message: e.to_string(),
    })
}

impl FromParams for () {
    fn from_params(params: Vec<Value>) -> Result<Self> {
        if !params.is_empty() {
            return Err(arity_error(0, params.len()));
        }
        Ok(())
    }
}

impl IntoParams for () {
    fn into_params(self) -> Result<Vec<Value>> {
        Ok(Vec::new())
    }
}

/// Raw passthrough, for handlers that inspect params themselves.
impl FromParams for Vec<Value> {
    fn from_params(params: Vec<Value>) -> Result<Self> {
        Ok(params)
    }
}

impl IntoParams for Vec<Value> {
    fn into_params(self) -> Result<Vec<Value>> {
        Ok(self)
    }
}

macro_rules! impl_tuple_params {
    ($len:expr; $($name:ident : $idx:tt),+) => {
        impl<$($name: DeserializeOwned),+> FromParams for ($($name,)+) {
            fn from_params(params: Vec<Value>) -> Result<Self> {
                if params.len() != $len {
                    return Err(arity_error($len, params.len()));
                }
                let mut values = params.into_iter();
                Ok(($(decode::<$name>($idx, values.next().unwrap_or(Value::Null))?,)+))
            }
        }

        impl<$($name: Serialize),+> IntoParams for ($($name,)+) {
            fn into_params(self) -> Result<Vec<Value>> {
                Ok(vec![$(encode(&self.$idx)?),+])
            }
        }
    };
}

impl_tuple_params!(1; A: 0);
impl_tuple_params!(2; A: 0, B: 1);
impl_tuple_params!(3; A: 0, B: 1, C: 2);
impl_tuple_params!(4; A: 0, B: 1, C: 2, D: 3);
impl_tuple_params!(5; A: 0, B: 1, C: 2, D: 3, E: 4);
impl_tuple_params!(6; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
