pub mod form;
pub mod prelude;
pub mod value;

pub use calmform_derive::FormModel;
pub use form::{FormError, FormOptions, FormResult, FormTree};
pub use value::{FieldValue, FormValue, OpaqueValue};
