mod aggregate;
mod binding;
mod controller;
mod edit;
mod errors;
mod field;
mod node;
mod path;
mod reset;
mod scheduler;
mod store;
mod validation;


pub use aggregate::{NodeEntry, flatten_array, flatten_object};
pub use binding::{ChangeHandler, EventHandler, FieldBinding};
pub use controller::{
    FormError, FormId, FormOptions, FormResult, FormSnapshot, FormTree, NodeId, NodeKind,
    SubmitState, ValidationTicket,
};
pub use edit::{EditState, Snapshot, SnapshotRecords};
pub use errors::{ErrorRegistry, InjectedErrors};
pub use field::{FieldConfig, FieldPhase, FieldState, FormatInput, InitialValue};
pub use node::{FieldHandle, GroupConfig, NodeHandle, RequestHandler, ResetHook};
pub use path::{FieldPath, PathResolver, resolve};
pub use reset::{ForceValidateFlag, ResetFlag, ResetKey};
pub use store::{GroupShape, NodeStateStore, Removal, StoreUpdate};
pub use validation::{
    AsyncFieldValidator, BoxedValidationFuture, ERROR_VALIDATING, FieldValidator, Validation,
    ValidationError, ValidationResult, ValidatorFault,
};
