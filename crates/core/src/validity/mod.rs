//! Validity decision for a single `(device, parameter)` key.
//!
//! The host query abstraction does not reliably report "became invalid" for
//! conditions that are continuously re-satisfied, so its flags are not taken
//! at face value. The policy lives here, apart from the evaluator, so it can be
//! revisited on its own once the host behaves.

use crate::{
    parameter::{ParameterUpdate, ParameterWatch, QueryResult},
    trigger::TriggerMode,
};

/// Decides whether `watch` is currently satisfied for a trigger in `mode`.
///
/// 1. A "just became valid" edge is always valid.
/// 2. A "just became invalid" edge or a not-valid result is valid for
///    continuous modes (their handlers judge the raw value themselves) and is
///    otherwise re-checked directly against the watch threshold.
/// 3. Without any signal the previous validity holds.
pub fn evaluate_validity(
    mode: TriggerMode,
    query: &QueryResult,
    update: &ParameterUpdate,
    watch: &ParameterWatch,
    was_valid: bool,
) -> bool {
    if query.just_became_valid {
        return true;
    }

    if query.just_became_invalid || !query.is_valid {
        if mode.is_continuous() {
            return true;
        }
        return watch.is_satisfied_by(&update.value);
    }

    was_valid
}
