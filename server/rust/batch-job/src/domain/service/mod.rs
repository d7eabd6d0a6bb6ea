pub mod entity_operation;
pub mod operation_registry;

pub use entity_operation::{
    EntityFailure, EntityOperation, InterruptKind, OperationContext, OperationError,
    OperationSummary, ProgressReporter,
};
pub use operation_registry::OperationRegistry;
