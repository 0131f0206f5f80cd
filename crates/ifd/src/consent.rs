//! User consent contract
//!
//! The facade never draws dialogs itself; it hands a [`Form`] to an engine
//! implementing [`UserConsent`] and reads typed results back out of the form.
//! Engines must run a step's [`StepAction`] when the step completes; steps
//! flagged [`Step::instant_return`] complete immediately after being shown,
//! which is how hardware driven PIN entry hooks into the dialog flow.

use std::collections::HashMap;

/// Verdict of a consent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentStatus {
    /// The user completed all steps.
    Ok,
    /// The user aborted the dialog.
    Cancel,
}

/// Verdict of a step action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Continue with the next step.
    Proceed,
    /// Abort the whole form.
    Cancel,
}

/// Work attached to a step, executed by the engine when the step completes.
pub trait StepAction: Send {
    /// Run the action; the returned verdict steers the dialog flow.
    fn perform(&mut self) -> StepOutcome;
}

/// A masked input field of a step.
#[derive(Debug, Clone)]
pub struct PasswordField {
    /// Field identifier, unique within the step.
    pub id: String,
    /// Label shown next to the field.
    pub description: String,
    /// Minimum accepted input length.
    pub min_length: usize,
    /// Maximum accepted input length.
    pub max_length: usize,
}

/// One page of a consent dialog.
pub struct Step {
    /// Step identifier, unique within the form.
    pub id: String,
    /// Step title.
    pub title: String,
    /// Instruction text, if any.
    pub message: Option<String>,
    /// Masked input field, if the step captures a secret.
    pub password: Option<PasswordField>,
    /// Complete the step as soon as it is shown instead of waiting for the
    /// user to confirm it.
    pub instant_return: bool,
    /// Action the engine runs when the step completes.
    pub action: Option<Box<dyn StepAction>>,
}

impl Step {
    /// Plain step showing a message.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            message: None,
            password: None,
            instant_return: false,
            action: None,
        }
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("instant_return", &self.instant_return)
            .field("has_action", &self.action.is_some())
            .finish_non_exhaustive()
    }
}

/// A consent dialog: title plus an ordered list of steps.
#[derive(Debug)]
pub struct Form {
    /// Dialog title.
    pub title: String,
    /// Steps in display order.
    pub steps: Vec<Step>,
    /// Captured field values, keyed by (step id, field id). Filled by the
    /// engine before a step's action runs.
    pub results: HashMap<(String, String), String>,
}

impl Form {
    /// Empty form with a title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            steps: Vec::new(),
            results: HashMap::new(),
        }
    }

    /// Captured value of a field, if the user filled it in.
    pub fn field_value(&self, step_id: &str, field_id: &str) -> Option<&str> {
        self.results
            .get(&(step_id.to_string(), field_id.to_string()))
            .map(String::as_str)
    }
}

/// A dialog engine. Implementations range from real UI toolkits to the
/// scripted engines used in tests.
pub trait UserConsent: Send + Sync {
    /// Show the form, run step actions as steps complete, and report how the
    /// dialog ended. Captured field values land in [`Form::results`].
    fn run(&self, form: &mut Form) -> ConsentStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_values_round_trip() {
        let mut form = Form::new("PIN entry");
        form.steps.push(Step::new("pin", "Enter PIN"));
        form.results
            .insert(("pin".into(), "value".into()), "123456".into());
        assert_eq!(form.field_value("pin", "value"), Some("123456"));
        assert_eq!(form.field_value("pin", "other"), None);
    }
}
