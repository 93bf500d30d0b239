//! One executor per node kind.

pub mod conditional;
pub mod delay;
pub mod end;
pub mod error_handler;
pub mod loop_node;
pub mod memory;
pub mod model;
pub mod retrieval;
pub mod start;
pub mod tool;
pub mod variable;

#[cfg(test)]
pub(crate) mod test_support {
    use serde_json::{Map, Value};

    use graphflow_core::context::ExecutionContext;
    use graphflow_core::types::{CorrelationId, ExecutionId};

    pub fn context(inputs: Value) -> ExecutionContext {
        let inputs = match inputs {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        ExecutionContext::new(
            ExecutionId::from_string("exec-test"),
            CorrelationId::from_string("corr-test"),
            inputs,
        )
    }
}
