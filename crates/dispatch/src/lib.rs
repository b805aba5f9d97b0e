//! Schema-driven dispatch: route each input device's messages to one
//! registered callback, binding payload fields to named arguments and
//! serializing the callback's return values back into messages.

pub mod args;
pub mod error;
pub mod handler;
pub mod output;
pub mod schema;

pub use {
    args::CallArgs,
    error::{Error, Result},
    handler::{
        Callback, OutputTarget, SchemaDispatchHandler, TYPED_PAYLOAD_PARAM, ValidationErrorHandler,
    },
    output::{CallbackOutput, ReturnValue},
    schema::{FieldType, Param, ParamSource, Schema, SchemaBuilder},
};
