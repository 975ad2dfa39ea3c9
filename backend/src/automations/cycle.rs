// Invocation Cycle Detector
//
// Guards nested `invoke` chains: the run's source trail is treated as the
// visited-node set of the invocation graph, and a candidate step list is
// rejected before rendering if any of its invoke targets already appears
// anywhere in the trail.

use std::collections::HashSet;

use relay_shared::{Field, StepAction, StepDefinition};

use super::AutomationError;

/// Path segment an `invoke` hop contributes to the source trail.
pub fn invoke_segment(template: &str) -> String {
    format!("invoke/{template}")
}

/// Reject a step list whose `invoke` targets would close a cycle over the
/// accumulated source trail. Membership is order-insensitive: a target
/// introduced by an ancestor several hops back is caught the same as an
/// immediate self-loop. Must run before the nested template is rendered.
pub fn detect_invoke_cycles(
    source: &[String],
    steps: &[StepDefinition],
) -> Result<(), AutomationError> {
    let visited: HashSet<&str> = source.iter().map(String::as_str).collect();

    for step in steps {
        if let StepAction::Invoke { template } = &step.action {
            // Accessor-wired targets are only known at execution time; the
            // nested invoke re-runs detection with the resolved target.
            let Field::Literal(value) = template else {
                continue;
            };
            let Some(target) = value.as_str() else {
                continue;
            };
            let candidate = invoke_segment(target);
            if visited.contains(candidate.as_str()) {
                return Err(AutomationError::AutomationInvokeCycle(candidate));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invoke_step(template: &str) -> StepDefinition {
        StepDefinition::new(StepAction::Invoke {
            template: Field::literal(json!(template)),
        })
    }

    #[test]
    fn test_no_invoke_steps() {
        let source = vec!["invoke/templateA".to_string()];
        assert!(detect_invoke_cycles(&source, &[]).is_ok());
    }

    #[test]
    fn test_no_cycle() {
        let source = vec!["invoke".to_string(), "invoke/templateA".to_string()];
        let steps = vec![invoke_step("templateC")];
        assert!(detect_invoke_cycles(&source, &steps).is_ok());
    }

    #[test]
    fn test_immediate_self_loop() {
        let source = vec!["invoke/templateA".to_string()];
        let steps = vec![invoke_step("templateA")];
        match detect_invoke_cycles(&source, &steps) {
            Err(AutomationError::AutomationInvokeCycle(segment)) => {
                assert_eq!(segment, "invoke/templateA");
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_at_any_trail_position() {
        let source = vec![
            "invoke".to_string(),
            "invoke/templateA".to_string(),
            "invoke/templateB".to_string(),
        ];
        // templateB is the last entry...
        assert!(detect_invoke_cycles(&source, &[invoke_step("templateB")]).is_err());
        // ...and templateA an earlier one; both must be caught.
        assert!(detect_invoke_cycles(&source, &[invoke_step("templateA")]).is_err());
    }

    #[test]
    fn test_non_invoke_segments_ignored() {
        let source = vec!["segment/track/event-x".to_string()];
        let steps = vec![invoke_step("event-x")];
        assert!(detect_invoke_cycles(&source, &steps).is_ok());
    }
}
