use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::fmt;

use crate::RpcError;

/// Rebuilds a declared type from the plain data that crossed the bus.
///
/// Only the top level goes through `revive`; nested values are whatever
/// `revive` makes of them.
pub trait Transferable: DeserializeOwned + Send + 'static {
    fn revive(plain: Value) -> Result<Self, RpcError> {
        serde_json::from_value(plain).map_err(RpcError::from)
    }
}

type ReviveFn = fn(Value) -> Result<Box<dyn Any + Send>, RpcError>;

fn revive_erased<T: Transferable>(plain: Value) -> Result<Box<dyn Any + Send>, RpcError> {
    T::revive(plain).map(|value| Box::new(value) as Box<dyn Any + Send>)
}

/// Explicit type tag supplied at registration time.
#[derive(Clone, Copy)]
pub struct TypeTag {
    name: &'static str,
    type_id: TypeId,
    revive: ReviveFn,
}

impl TypeTag {
    pub fn of<T: Transferable>() -> Self {
        TypeTag {
            name: std::any::type_name::<T>(),
            type_id: TypeId::of::<T>(),
            revive: revive_erased::<T>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    pub fn revive(&self, plain: Value) -> Result<Box<dyn Any + Send>, RpcError> {
        (self.revive)(plain)
    }

    /// Revives and hands the value back as `T`, which must be the tagged type.
    pub fn revive_as<T: 'static>(&self, plain: Value) -> Result<T, RpcError> {
        let revived = self.revive(plain)?;
        revived.downcast::<T>().map(|boxed| *boxed).map_err(|_| {
            RpcError::bad_request(format!(
                "value was revived as {} but {} was expected",
                self.name,
                std::any::type_name::<T>()
            ))
        })
    }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TypeTag").field(&self.name).finish()
    }
}

/// One positional argument as seen by a callable handler.
pub enum Arg {
    Plain(Value),
    Revived(Box<dyn Any + Send>),
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Plain(value) => f.debug_tuple("Plain").field(value).finish(),
            Arg::Revived(_) => f.write_str("Revived(..)"),
        }
    }
}

impl Arg {
    /// Plain arguments are deserialized; revived ones must already be `T`.
    pub fn into_typed<T: DeserializeOwned + 'static>(self) -> Result<T, RpcError> {
        match self {
            Arg::Plain(value) => serde_json::from_value(value).map_err(RpcError::from),
            Arg::Revived(boxed) => boxed.downcast::<T>().map(|b| *b).map_err(|_| {
                RpcError::bad_request(format!(
                    "argument was revived as a different type than {}",
                    std::any::type_name::<T>()
                ))
            }),
        }
    }
}

/// Positional arguments of a callable request.
#[derive(Debug, Default)]
pub struct CallArgs {
    args: Vec<Option<Arg>>,
}

impl CallArgs {
    pub fn new(args: Vec<Arg>) -> Self {
        CallArgs {
            args: args.into_iter().map(Some).collect(),
        }
    }

    pub fn plain(values: Vec<Value>) -> Self {
        Self::new(values.into_iter().map(Arg::Plain).collect())
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Takes argument `index` as `T`. Missing arguments read as `null`, so
    /// trailing `Option` parameters may be omitted by the caller.
    pub fn take<T: DeserializeOwned + 'static>(&mut self, index: usize) -> Result<T, RpcError> {
        match self.args.get_mut(index).and_then(Option::take) {
            Some(arg) => arg.into_typed(),
            None => serde_json::from_value(Value::Null).map_err(|_| {
                RpcError::bad_request(format!("missing argument at position {}", index))
            }),
        }
    }

    /// Decodes every argument at once as a tuple or sequence.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, RpcError> {
        let mut values = Vec::with_capacity(self.args.len());
        for (index, arg) in self.args.into_iter().enumerate() {
            match arg {
                Some(Arg::Plain(value)) => values.push(value),
                Some(Arg::Revived(_)) => {
                    return Err(RpcError::bad_request(format!(
                        "argument {} was revived, take it by position instead",
                        index
                    )))
                }
                None => values.push(Value::Null),
            }
        }
        serde_json::from_value(Value::Array(values)).map_err(RpcError::from)
    }
}
