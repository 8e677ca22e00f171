use std::sync::Arc;

use super::controller::FormResult;
use super::field::FieldState;
use super::node::FieldHandle;
use super::validation::ValidationError;
use crate::value::FormValue;

pub type ChangeHandler = Arc<dyn Fn(FormValue) -> FormResult<()> + Send + Sync>;
pub type EventHandler = Arc<dyn Fn() -> FormResult<()> + Send + Sync>;

/// What a widget needs to render one field and report back into the tree.
#[derive(Clone)]
pub struct FieldBinding {
    pub value: FormValue,
    pub valid: bool,
    pub validating: bool,
    pub touched: bool,
    pub focused: bool,
    pub errors: Vec<ValidationError>,
    field: FieldHandle,
}

impl FieldBinding {
    pub(super) fn new(
        field: FieldHandle,
        state: FieldState,
        errors: Vec<ValidationError>,
    ) -> Self {
        Self {
            value: state.value,
            valid: state.valid,
            validating: state.validating,
            touched: state.touched,
            focused: state.focused,
            errors,
            field,
        }
    }

    pub fn on_change_handler(&self) -> ChangeHandler {
        let field = self.field.clone();
        Arc::new(move |next| field.on_change(next))
    }

    pub fn on_blur_handler(&self) -> EventHandler {
        let field = self.field.clone();
        Arc::new(move || field.on_blur())
    }

    pub fn on_focus_handler(&self) -> EventHandler {
        let field = self.field.clone();
        Arc::new(move || field.on_focus())
    }

    /// First error message, once the field has been touched.
    pub fn display_error(&self) -> Option<String> {
        if !self.touched {
            return None;
        }
        self.errors.first().map(ValidationError::message)
    }
}
