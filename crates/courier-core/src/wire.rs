//! Wire types: type identity plus JSON text encoding for values that cross
//! the process boundary.
//!
//! Every argument and return value implements [`Wire`]. The type identifier
//! travels next to the JSON text so the receiver can pick the right overload
//! and decode against the right type.

use std::collections::{BTreeMap, HashMap};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CourierError, Result};

/// A value that can be sent as an argument or returned from a remote method.
pub trait Wire: Serialize + DeserializeOwned + Send + 'static {
    /// Stable identifier of the type, shared by caller and receiver.
    fn type_name() -> String;

    /// Identifier of this particular value. Polymorphic types may report a
    /// more specific identifier than [`Wire::type_name`].
    fn runtime_type(&self) -> String {
        Self::type_name()
    }

    /// Value produced when a reply carries no return value. Only `()` has one.
    fn from_void() -> Option<Self> {
        None
    }

    /// Whether a returned value of this type is sent back as a value.
    fn is_void() -> bool {
        false
    }
}

/// Declare user types as [`Wire`] types.
///
/// ```rust,ignore
/// wire_type!(Request, Response);
/// wire_type!(OrderId => "orders.OrderId");
/// ```
#[macro_export]
macro_rules! wire_type {
    ($($ty:ident),+ $(,)?) => {
        $( $crate::wire_type!($ty => stringify!($ty)); )+
    };
    ($ty:ty => $name:expr) => {
        impl $crate::wire::Wire for $ty {
            fn type_name() -> String {
                String::from($name)
            }
        }
    };
}

macro_rules! impl_wire_primitive {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(
            impl Wire for $ty {
                fn type_name() -> String {
                    $name.to_string()
                }
            }
        )*
    };
}

impl_wire_primitive!(
    bool => "bool",
    char => "char",
    i8 => "i8",
    i16 => "i16",
    i32 => "i32",
    i64 => "i64",
    isize => "isize",
    u8 => "u8",
    u16 => "u16",
    u32 => "u32",
    u64 => "u64",
    usize => "usize",
    f32 => "f32",
    f64 => "f64",
    String => "string",
);

impl Wire for () {
    fn type_name() -> String {
        "()".to_string()
    }

    fn from_void() -> Option<Self> {
        Some(())
    }

    fn is_void() -> bool {
        true
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn type_name() -> String {
        format!("Vec<{}>", T::type_name())
    }
}

impl<T: Wire> Wire for Option<T> {
    fn type_name() -> String {
        format!("Option<{}>", T::type_name())
    }
}

impl<T: Wire> Wire for HashMap<String, T> {
    fn type_name() -> String {
        format!("Map<string,{}>", T::type_name())
    }
}

impl<T: Wire> Wire for BTreeMap<String, T> {
    fn type_name() -> String {
        format!("Map<string,{}>", T::type_name())
    }
}

/// Serialize a value to JSON text.
pub fn encode_value<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Deserialize JSON text into a value.
pub fn decode_value<T: DeserializeOwned>(text: &str) -> Result<T> {
    Ok(serde_json::from_str(text)?)
}

/// Arguments of one invocation, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedArgs {
    pub values: Vec<String>,
    pub types: Vec<String>,
}

/// A tuple of [`Wire`] arguments.
pub trait WireArgs: Sized + Send + 'static {
    /// Declared parameter types.
    fn param_types() -> Vec<String>;

    /// Serialize each argument and record its runtime type.
    fn encode(&self) -> Result<EncodedArgs>;

    /// Deserialize positional values into the tuple.
    fn decode(values: &[String]) -> Result<Self>;
}

macro_rules! impl_wire_args {
    ($len:expr; $($name:ident : $idx:tt),*) => {
        impl<$($name: Wire),*> WireArgs for ($($name,)*) {
            fn param_types() -> Vec<String> {
                vec![$($name::type_name()),*]
            }

            #[allow(unused_variables)]
            fn encode(&self) -> Result<EncodedArgs> {
                Ok(EncodedArgs {
                    values: vec![$(encode_value(&self.$idx)?),*],
                    types: vec![$(self.$idx.runtime_type()),*],
                })
            }

            fn decode(values: &[String]) -> Result<Self> {
                if values.len() != $len {
                    return Err(CourierError::serialization(format!(
                        "expected {} arguments, got {}",
                        $len,
                        values.len()
                    )));
                }
                Ok(($(decode_value::<$name>(&values[$idx])?,)*))
            }
        }
    };
}

impl_wire_args!(0;);
impl_wire_args!(1; A: 0);
impl_wire_args!(2; A: 0, B: 1);
impl_wire_args!(3; A: 0, B: 1, C: 2);
impl_wire_args!(4; A: 0, B: 1, C: 2, D: 3);
impl_wire_args!(5; A: 0, B: 1, C: 2, D: 3, E: 4);
impl_wire_args!(6; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
