use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::controller::{FormTree, ValidationTicket};
use super::validation::{
    AsyncFieldValidator, FieldValidator, Validation, ValidationError, Validator, ValidatorFault,
};
use crate::value::FormValue;

pub(crate) type ValueFn = Arc<dyn Fn(&FormValue) -> FormValue + Send + Sync>;
pub(crate) type FormatterFn = Arc<dyn Fn(FormatInput<'_>) -> FormValue + Send + Sync>;
pub(crate) type SideEffectFn = Arc<dyn Fn(&FormValue, &FormValue, &FormTree) + Send + Sync>;

/// Arguments handed to a field formatter.
#[derive(Clone, Copy, Debug)]
pub struct FormatInput<'a> {
    pub new_value: &'a FormValue,
    pub old_value: &'a FormValue,
    pub dependency: &'a FormValue,
}

#[derive(Clone)]
pub enum InitialValue {
    Literal(FormValue),
    Derived(ValueFn),
}

/// Per-field configuration.
///
/// Formatters, dependency extractors and derived initial values run while the
/// tree is locked and must not call back into it. Validators and side effects
/// run outside the lock.
#[derive(Clone)]
pub struct FieldConfig {
    pub(crate) initial: InitialValue,
    pub(crate) dependency: Option<ValueFn>,
    pub(crate) formatter: Option<FormatterFn>,
    pub(crate) validator: Option<Validator>,
    pub(crate) side_effect: Option<SideEffectFn>,
    pub(crate) debounce: Option<Duration>,
}

impl Default for FieldConfig {
    fn default() -> Self {
        Self::new(FormValue::Null)
    }
}

impl FieldConfig {
    pub fn new(initial: impl Into<FormValue>) -> Self {
        Self {
            initial: InitialValue::Literal(initial.into()),
            dependency: None,
            formatter: None,
            validator: None,
            side_effect: None,
            debounce: None,
        }
    }

    /// Initial value computed from the field's dependency value.
    pub fn derived(initial: impl Fn(&FormValue) -> FormValue + Send + Sync + 'static) -> Self {
        Self {
            initial: InitialValue::Derived(Arc::new(initial)),
            ..Self::default()
        }
    }

    /// Extracts this field's dependency from the root's aggregate value.
    pub fn dependency(
        mut self,
        extractor: impl Fn(&FormValue) -> FormValue + Send + Sync + 'static,
    ) -> Self {
        self.dependency = Some(Arc::new(extractor));
        self
    }

    pub fn formatter(
        mut self,
        formatter: impl Fn(FormatInput<'_>) -> FormValue + Send + Sync + 'static,
    ) -> Self {
        self.formatter = Some(Arc::new(formatter));
        self
    }

    pub fn validator<V>(mut self, validator: V) -> Self
    where
        V: FieldValidator + 'static,
    {
        self.validator = Some(Validator::sync(validator));
        self
    }

    pub fn async_validator<V>(mut self, validator: V) -> Self
    where
        V: AsyncFieldValidator + 'static,
    {
        self.validator = Some(Validator::asynchronous(validator));
        self
    }

    pub fn side_effect(
        mut self,
        side_effect: impl Fn(&FormValue, &FormValue, &FormTree) + Send + Sync + 'static,
    ) -> Self {
        self.side_effect = Some(Arc::new(side_effect));
        self
    }

    /// Overrides `FormOptions::validation_debounce` for this field.
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = Some(debounce);
        self
    }

    pub fn has_validator(&self) -> bool {
        self.validator.is_some()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldPhase {
    Idle,
    Validating(ValidationTicket),
    Settled { valid: bool },
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldState {
    pub value: FormValue,
    pub valid: bool,
    pub validating: bool,
    pub touched: bool,
    pub focused: bool,
    pub errors: Vec<ValidationError>,
    pub phase: FieldPhase,
    pub dependency: FormValue,
}

impl Default for FieldState {
    fn default() -> Self {
        Self {
            value: FormValue::Null,
            valid: false,
            validating: false,
            touched: false,
            focused: false,
            errors: Vec::new(),
            phase: FieldPhase::Idle,
            dependency: FormValue::Null,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum FieldEvent {
    Mount {
        value: FormValue,
        dependency: FormValue,
    },
    Change {
        value: FormValue,
    },
    DependencyChanged {
        dependency: FormValue,
        value: FormValue,
    },
    Reset {
        value: FormValue,
    },
    ForceTouch(bool),
    Focus,
    Blur {
        touch: bool,
    },
    Resolved {
        ticket: ValidationTicket,
        validation: Validation,
    },
    Fault,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum FieldEffect {
    Validate {
        ticket: ValidationTicket,
        value: FormValue,
        dependency: FormValue,
    },
    /// `{valid, value}` may differ from what the parent holds.
    Publish,
    /// The value differs from the one before this event.
    ValueChanged,
    Errors(Vec<ValidationError>),
}

#[derive(Debug)]
pub(crate) struct Transition {
    pub(crate) state: FieldState,
    pub(crate) effects: Vec<FieldEffect>,
}

/// Pure transition function of the field state machine.
pub(crate) fn step(
    state: &FieldState,
    event: FieldEvent,
    has_validator: bool,
    ticket: ValidationTicket,
) -> Transition {
    let mut next = state.clone();
    let mut effects = Vec::new();
    match event {
        FieldEvent::Mount { value, dependency } => {
            next = FieldState {
                value,
                dependency,
                ..FieldState::default()
            };
            effects.push(FieldEffect::ValueChanged);
            begin_validation(&mut next, &mut effects, has_validator, ticket);
        }
        FieldEvent::Change { value } => {
            if next.value != value {
                effects.push(FieldEffect::ValueChanged);
            }
            next.value = value;
            begin_validation(&mut next, &mut effects, has_validator, ticket);
        }
        FieldEvent::DependencyChanged { dependency, value } => {
            if next.value != value {
                effects.push(FieldEffect::ValueChanged);
            }
            next.value = value;
            next.dependency = dependency;
            begin_validation(&mut next, &mut effects, has_validator, ticket);
        }
        FieldEvent::Reset { value } => {
            if next.value != value {
                effects.push(FieldEffect::ValueChanged);
            }
            next.value = value;
            next.touched = false;
            next.focused = false;
            begin_validation(&mut next, &mut effects, has_validator, ticket);
        }
        FieldEvent::ForceTouch(touched) => next.touched = touched,
        FieldEvent::Focus => next.focused = true,
        FieldEvent::Blur { touch } => {
            next.focused = false;
            if touch {
                next.touched = true;
            }
        }
        FieldEvent::Resolved {
            ticket: resolved,
            validation,
        } => {
            if state.phase != FieldPhase::Validating(resolved) {
                return Transition {
                    state: next,
                    effects,
                };
            }
            settle(&mut next, &mut effects, validation);
        }
        FieldEvent::Fault => settle(&mut next, &mut effects, Validation::fault()),
    }
    Transition {
        state: next,
        effects,
    }
}

fn begin_validation(
    state: &mut FieldState,
    effects: &mut Vec<FieldEffect>,
    has_validator: bool,
    ticket: ValidationTicket,
) {
    if !has_validator {
        settle(state, effects, Validation::valid());
        return;
    }
    state.validating = true;
    state.valid = false;
    state.phase = FieldPhase::Validating(ticket);
    effects.push(FieldEffect::Validate {
        ticket,
        value: state.value.clone(),
        dependency: state.dependency.clone(),
    });
    effects.push(FieldEffect::Publish);
}

fn settle(state: &mut FieldState, effects: &mut Vec<FieldEffect>, validation: Validation) {
    state.valid = validation.valid;
    state.validating = false;
    state.errors = validation.errors;
    state.phase = FieldPhase::Settled {
        valid: validation.valid,
    };
    effects.push(FieldEffect::Errors(state.errors.clone()));
    effects.push(FieldEffect::Publish);
}

/// Leaf controller: configuration plus the current machine state.
pub(crate) struct FieldController {
    config: FieldConfig,
    state: FieldState,
}

impl FieldController {
    pub(crate) fn new(config: FieldConfig) -> Self {
        Self {
            config,
            state: FieldState::default(),
        }
    }

    pub(crate) fn config(&self) -> &FieldConfig {
        &self.config
    }

    pub(crate) fn state(&self) -> &FieldState {
        &self.state
    }

    pub(crate) fn tracks_dependency(&self) -> bool {
        self.config.dependency.is_some()
    }

    pub(crate) fn extract_dependency(&self, root: &FormValue) -> Result<FormValue, ValidatorFault> {
        let Some(extractor) = &self.config.dependency else {
            return Ok(FormValue::Null);
        };
        catch_unwind(AssertUnwindSafe(|| extractor(root)))
            .map_err(|_| ValidatorFault::new("dependency extractor panicked"))
    }

    pub(crate) fn initial_value(&self, dependency: &FormValue) -> Result<FormValue, ValidatorFault> {
        match &self.config.initial {
            InitialValue::Literal(value) => Ok(value.clone()),
            InitialValue::Derived(derive) => catch_unwind(AssertUnwindSafe(|| derive(dependency)))
                .map_err(|_| ValidatorFault::new("initial value function panicked")),
        }
    }

    pub(crate) fn format(
        &self,
        new_value: FormValue,
        old_value: &FormValue,
        dependency: &FormValue,
    ) -> Result<FormValue, ValidatorFault> {
        let Some(formatter) = &self.config.formatter else {
            return Ok(new_value);
        };
        catch_unwind(AssertUnwindSafe(|| {
            formatter(FormatInput {
                new_value: &new_value,
                old_value,
                dependency,
            })
        }))
        .map_err(|_| ValidatorFault::new("formatter panicked"))
    }

    fn formatted_initial(&self, dependency: &FormValue) -> Result<FormValue, ValidatorFault> {
        let initial = self.initial_value(dependency)?;
        self.format(initial.clone(), &initial, dependency)
    }

    pub(crate) fn mount(&mut self, root: &FormValue, ticket: ValidationTicket) -> Vec<FieldEffect> {
        let (dependency, mut fault) = match self.extract_dependency(root) {
            Ok(dependency) => (dependency, None),
            Err(fault) => (FormValue::Null, Some(fault)),
        };
        let value = match self.formatted_initial(&dependency) {
            Ok(value) => value,
            Err(error) => {
                fault = Some(error);
                FormValue::Null
            }
        };
        let effects = self.apply(FieldEvent::Mount { value, dependency }, ticket);
        match fault {
            Some(fault) => self.fault(effects, &fault, ticket),
            None => effects,
        }
    }

    /// A formatter that panics leaves the previous value in place.
    pub(crate) fn change(&mut self, value: FormValue, ticket: ValidationTicket) -> Vec<FieldEffect> {
        match self.format(value, &self.state.value, &self.state.dependency) {
            Ok(value) => self.apply(FieldEvent::Change { value }, ticket),
            Err(fault) => self.fault(Vec::new(), &fault, ticket),
        }
    }

    pub(crate) fn dependency_changed(
        &mut self,
        dependency: FormValue,
        ticket: ValidationTicket,
    ) -> Vec<FieldEffect> {
        let current = self.state.value.clone();
        match self.format(current.clone(), &self.state.value, &dependency) {
            Ok(value) => self.apply(FieldEvent::DependencyChanged { dependency, value }, ticket),
            Err(fault) => {
                let effects = self.apply(
                    FieldEvent::DependencyChanged {
                        dependency,
                        value: current,
                    },
                    ticket,
                );
                self.fault(effects, &fault, ticket)
            }
        }
    }

    /// Reloads from `restored`, or from the initial value when no snapshot applies.
    pub(crate) fn reset(
        &mut self,
        restored: Option<FormValue>,
        ticket: ValidationTicket,
    ) -> Vec<FieldEffect> {
        let dependency = self.state.dependency.clone();
        let (value, fault) = match restored {
            Some(value) => (value, None),
            None => match self.formatted_initial(&dependency) {
                Ok(value) => (value, None),
                Err(fault) => (self.state.value.clone(), Some(fault)),
            },
        };
        let effects = self.apply(FieldEvent::Reset { value }, ticket);
        match fault {
            Some(fault) => self.fault(effects, &fault, ticket),
            None => effects,
        }
    }

    fn fault(
        &mut self,
        mut effects: Vec<FieldEffect>,
        fault: &ValidatorFault,
        ticket: ValidationTicket,
    ) -> Vec<FieldEffect> {
        warn!(%fault, "field callback failed");
        effects.extend(self.apply(FieldEvent::Fault, ticket));
        effects
    }

    pub(crate) fn apply(&mut self, event: FieldEvent, ticket: ValidationTicket) -> Vec<FieldEffect> {
        let transition = step(&self.state, event, self.config.has_validator(), ticket);
        self.state = transition.state;
        transition.effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validating_state(ticket: u64) -> FieldState {
        step(
            &FieldState::default(),
            FieldEvent::Mount {
                value: FormValue::from("Ivan"),
                dependency: FormValue::Null,
            },
            true,
            ValidationTicket(ticket),
        )
        .state
    }

    #[test]
    fn mount_with_validator_enters_validating() {
        let state = validating_state(1);
        assert!(state.validating);
        assert!(!state.valid);
        assert_eq!(state.phase, FieldPhase::Validating(ValidationTicket(1)));
    }

    #[test]
    fn mount_without_validator_settles_valid() {
        let transition = step(
            &FieldState::default(),
            FieldEvent::Mount {
                value: FormValue::from("Ivan"),
                dependency: FormValue::Null,
            },
            false,
            ValidationTicket(1),
        );
        assert!(transition.state.valid);
        assert!(!transition.state.validating);
        assert!(
            !transition
                .effects
                .iter()
                .any(|effect| matches!(effect, FieldEffect::Validate { .. }))
        );
    }

    #[test]
    fn stale_resolution_is_ignored() {
        let state = validating_state(2);
        let transition = step(
            &state,
            FieldEvent::Resolved {
                ticket: ValidationTicket(1),
                validation: Validation::valid(),
            },
            true,
            ValidationTicket(3),
        );
        assert_eq!(transition.state, state);
        assert!(transition.effects.is_empty());
    }

    #[test]
    fn current_resolution_settles() {
        let state = validating_state(2);
        let transition = step(
            &state,
            FieldEvent::Resolved {
                ticket: ValidationTicket(2),
                validation: Validation::invalid(vec![ValidationError::new("bad")]),
            },
            true,
            ValidationTicket(3),
        );
        assert_eq!(transition.state.phase, FieldPhase::Settled { valid: false });
        assert!(!transition.state.validating);
        assert_eq!(transition.state.errors, vec![ValidationError::new("bad")]);
    }

    #[test]
    fn force_touch_leaves_value_and_validity_alone() {
        let state = validating_state(1);
        let transition = step(&state, FieldEvent::ForceTouch(true), true, ValidationTicket(2));
        assert!(transition.state.touched);
        assert_eq!(transition.state.value, state.value);
        assert_eq!(transition.state.phase, state.phase);
        assert!(transition.effects.is_empty());
    }

    #[test]
    fn reset_clears_touch_and_focus() {
        let mut state = validating_state(1);
        state.touched = true;
        state.focused = true;
        let transition = step(
            &state,
            FieldEvent::Reset {
                value: FormValue::from("Petr"),
            },
            true,
            ValidationTicket(2),
        );
        assert!(!transition.state.touched);
        assert!(!transition.state.focused);
        assert!(transition.effects.contains(&FieldEffect::ValueChanged));
    }

    #[test]
    fn controller_formats_initial_value_before_validation() {
        let config = FieldConfig::new("  ivan ").formatter(|input: FormatInput<'_>| {
            FormValue::from(input.new_value.as_str().unwrap_or_default().trim().to_string())
        });
        let mut controller = FieldController::new(config);
        let effects = controller.mount(&FormValue::empty_map(), ValidationTicket(1));
        assert_eq!(controller.state().value, FormValue::from("ivan"));
        assert!(effects.contains(&FieldEffect::Publish));
    }

    #[test]
    fn panicking_formatter_keeps_previous_value() {
        let config = FieldConfig::new("ok").formatter(|input: FormatInput<'_>| -> FormValue {
            if input.new_value.as_str() == Some("boom") {
                panic!("formatter exploded");
            }
            input.new_value.clone()
        });
        let mut controller = FieldController::new(config);
        controller.mount(&FormValue::empty_map(), ValidationTicket(1));
        let effects = controller.change(FormValue::from("boom"), ValidationTicket(2));
        assert_eq!(controller.state().value, FormValue::from("ok"));
        assert!(!controller.state().valid);
        assert_eq!(
            controller.state().errors,
            vec![ValidationError::error_validating()]
        );
        assert!(!effects.contains(&FieldEffect::ValueChanged));
    }

    #[test]
    fn panicking_derived_initial_mounts_as_fault() {
        let config = FieldConfig::derived(|_dependency: &FormValue| -> FormValue {
            panic!("no initial value")
        });
        let mut controller = FieldController::new(config);
        controller.mount(&FormValue::empty_map(), ValidationTicket(1));
        assert_eq!(controller.state().value, FormValue::Null);
        assert_eq!(
            controller.state().errors,
            vec![ValidationError::error_validating()]
        );
    }

    #[test]
    fn panicking_extractor_is_reported_as_fault() {
        let config = FieldConfig::new("x").dependency(|_root: &FormValue| panic!("bad extractor"));
        let mut controller = FieldController::new(config);
        controller.mount(&FormValue::empty_map(), ValidationTicket(1));
        assert!(!controller.state().valid);
        assert_eq!(
            controller.state().errors,
            vec![ValidationError::error_validating()]
        );
    }
}
