pub use crate::form::{
    FieldBinding, FieldConfig, FieldHandle, FieldPath, FieldState, FormError, FormOptions,
    FormResult, FormSnapshot, FormTree, FormatInput, GroupConfig, InjectedErrors, NodeEntry,
    NodeHandle, SubmitState, Validation, ValidationError, ValidatorFault,
};
pub use crate::value::{FieldValue, FormModel, FormValue, OpaqueValue};
pub use crate::FormModel;
