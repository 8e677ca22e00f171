use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures_timer::Delay;
use tracing::{trace, warn};

use super::controller::{FormTree, NodeId, ValidationTicket};
use super::field::SideEffectFn;
use super::node::{RequestHandler, ResetHook};
use super::path::FieldPath;
use super::validation::{FieldValidator, Validation, ValidationResult, Validator};
use crate::value::FormValue;

/// One pending validator run for one field, driven by `FormTree::settle`.
pub(super) struct ValidationJob {
    pub(super) node: NodeId,
    pub(super) path: FieldPath,
    pub(super) ticket: ValidationTicket,
    pub(super) value: FormValue,
    pub(super) dependency: FormValue,
    pub(super) validator: Validator,
    pub(super) debounce: Duration,
}

/// Sync validator run that happens as soon as the requesting pass releases
/// the lock.
pub(super) struct InlineValidation {
    pub(super) node: NodeId,
    pub(super) path: FieldPath,
    pub(super) ticket: ValidationTicket,
    pub(super) value: FormValue,
    pub(super) dependency: FormValue,
    pub(super) validator: Arc<dyn FieldValidator>,
}

pub(super) struct ValidationOutcome {
    pub(super) node: NodeId,
    pub(super) ticket: ValidationTicket,
    pub(super) validation: Option<Validation>,
}

impl ValidationJob {
    /// Runs the validator, converting faults and panics into `errorValidating`.
    /// Yields no validation when a newer run superseded this one during the
    /// debounce window.
    pub(super) async fn run(self, tree: FormTree) -> ValidationOutcome {
        let ValidationJob {
            node,
            path,
            ticket,
            value,
            dependency,
            validator,
            debounce,
        } = self;

        let outcome = AssertUnwindSafe(async move {
            if !debounce.is_zero() {
                Delay::new(debounce).await;
                if !tree.is_latest_ticket(node, ticket) {
                    return None;
                }
            }
            Some(match validator {
                Validator::Sync(validator) => validator.validate(&value, &dependency),
                Validator::Async(validator) => validator.validate(value, dependency).await,
            })
        })
        .catch_unwind()
        .await;

        let validation = match outcome {
            Ok(Some(result)) => Some(into_validation(&path, Some(result))),
            Ok(None) => {
                trace!(path = %path, ticket = ticket.0, "validation superseded while debouncing");
                None
            }
            Err(_) => Some(into_validation(&path, None)),
        };
        ValidationOutcome {
            node,
            ticket,
            validation,
        }
    }
}

impl InlineValidation {
    pub(super) fn run(self) -> ValidationOutcome {
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.validator.validate(&self.value, &self.dependency)
        }))
        .ok();
        ValidationOutcome {
            node: self.node,
            ticket: self.ticket,
            validation: Some(into_validation(&self.path, result)),
        }
    }
}

/// `None` stands for a validator that panicked.
fn into_validation(path: &FieldPath, result: Option<ValidationResult>) -> Validation {
    match result {
        Some(Ok(validation)) => validation,
        Some(Err(fault)) => {
            warn!(path = %path, %fault, "validator failed");
            Validation::fault()
        }
        None => {
            warn!(path = %path, "validator panicked");
            Validation::fault()
        }
    }
}

/// Work that must wait until the pass that scheduled it has finished.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) enum DeferredTask {
    DiscardSnapshot { path: FieldPath, generation: u64 },
}

/// Callbacks into application code, dispatched with the state lock released.
pub(super) enum Notification {
    SideEffect {
        callback: SideEffectFn,
        value: FormValue,
        dependency: FormValue,
    },
    GroupReset {
        hook: ResetHook,
        restored: Option<FormValue>,
    },
    Request(RequestHandler),
}

impl Notification {
    pub(super) fn dispatch(self, tree: &FormTree) {
        match self {
            Notification::SideEffect {
                callback,
                value,
                dependency,
            } => callback(&value, &dependency, tree),
            Notification::GroupReset { hook, restored } => hook(restored.as_ref(), tree),
            Notification::Request(handler) => handler(),
        }
    }
}

#[derive(Default)]
pub(super) struct TaskQueue {
    validations: Vec<ValidationJob>,
    inline: Vec<InlineValidation>,
    deferred: VecDeque<DeferredTask>,
    notifications: Vec<Notification>,
}

impl TaskQueue {
    pub(super) fn push_validation(&mut self, job: ValidationJob) {
        self.validations.push(job);
    }

    pub(super) fn push_inline(&mut self, validation: InlineValidation) {
        self.inline.push(validation);
    }

    pub(super) fn defer(&mut self, task: DeferredTask) {
        self.deferred.push_back(task);
    }

    pub(super) fn notify(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }

    pub(super) fn take_validations(&mut self) -> Vec<ValidationJob> {
        std::mem::take(&mut self.validations)
    }

    pub(super) fn take_inline(&mut self) -> Vec<InlineValidation> {
        std::mem::take(&mut self.inline)
    }

    pub(super) fn take_deferred(&mut self) -> VecDeque<DeferredTask> {
        std::mem::take(&mut self.deferred)
    }

    pub(super) fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    pub(super) fn pending_validations(&self) -> usize {
        self.validations.len()
    }

    pub(super) fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }
}
