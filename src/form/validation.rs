use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::FormValue;

/// Error text reported when a validator faults instead of answering.
pub const ERROR_VALIDATING: &str = "errorValidating";

/// User-facing validation message, optionally with `{name}` placeholders.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub text: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub substitutes: BTreeMap<String, String>,
}

impl ValidationError {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            substitutes: BTreeMap::new(),
        }
    }

    pub fn with_substitute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.substitutes.insert(name.into(), value.into());
        self
    }

    pub fn error_validating() -> Self {
        Self::new(ERROR_VALIDATING)
    }

    /// Text with every `{name}` placeholder replaced by its substitute.
    pub fn message(&self) -> String {
        self.substitutes
            .iter()
            .fold(self.text.clone(), |text, (name, value)| {
                text.replace(&format!("{{{name}}}"), value)
            })
    }
}

/// Answer of one validator run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
}

impl Validation {
    pub fn valid() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn invalid(errors: Vec<ValidationError>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }

    /// Valid exactly when `errors` is empty.
    pub fn from_errors(errors: Vec<ValidationError>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    pub(crate) fn fault() -> Self {
        Self::invalid(vec![ValidationError::error_validating()])
    }
}

/// Internal failure of a validator, as opposed to a negative answer.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("validator fault: {0}")]
pub struct ValidatorFault(pub String);

impl ValidatorFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type ValidationResult = Result<Validation, ValidatorFault>;

pub type BoxedValidationFuture = Pin<Box<dyn Future<Output = ValidationResult> + Send + 'static>>;

pub trait FieldValidator: Send + Sync {
    fn validate(&self, value: &FormValue, dependency: &FormValue) -> ValidationResult;
}

impl<F> FieldValidator for F
where
    F: Fn(&FormValue, &FormValue) -> ValidationResult + Send + Sync,
{
    fn validate(&self, value: &FormValue, dependency: &FormValue) -> ValidationResult {
        (self)(value, dependency)
    }
}

pub trait AsyncFieldValidator: Send + Sync {
    fn validate(&self, value: FormValue, dependency: FormValue) -> BoxedValidationFuture;
}

impl<F, Fut> AsyncFieldValidator for F
where
    F: Fn(FormValue, FormValue) -> Fut + Send + Sync,
    Fut: Future<Output = ValidationResult> + Send + 'static,
{
    fn validate(&self, value: FormValue, dependency: FormValue) -> BoxedValidationFuture {
        Box::pin((self)(value, dependency))
    }
}

/// Validator registered on a field.
///
/// Sync validators answer within the pass that requested them unless a
/// debounce applies; async ones wait for `FormTree::settle`.
#[derive(Clone)]
pub(crate) enum Validator {
    Sync(Arc<dyn FieldValidator>),
    Async(Arc<dyn AsyncFieldValidator>),
}

impl Validator {
    pub(crate) fn sync<V>(validator: V) -> Self
    where
        V: FieldValidator + 'static,
    {
        Validator::Sync(Arc::new(validator))
    }

    pub(crate) fn asynchronous<V>(validator: V) -> Self
    where
        V: AsyncFieldValidator + 'static,
    {
        Validator::Async(Arc::new(validator))
    }
}
