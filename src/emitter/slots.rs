//! # LLM Slot Discipline
//!
//! Skeleton files declare paired `LLM_SLOT:start:<name>` /
//! `LLM_SLOT:end:<name>` markers. The LLM stratum may only produce text
//! inserted between a pair; anything else is rejected. Slots carry typed
//! constraints (no imports, no class definitions, bounded line count, must
//! end with a return, no side-effect calls), checked before insertion. A
//! rejected emission is retried once with a reminder prompt by the caller,
//! then replaced with an empty guarded body.

use serde::{Deserialize, Serialize};

pub const SLOT_START: &str = "LLM_SLOT:start:";
pub const SLOT_END: &str = "LLM_SLOT:end:";

/// Typed constraints on what a slot body may contain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConstraints {
    pub no_imports: bool,
    pub no_class_defs: bool,
    pub max_lines: usize,
    pub must_end_with_return: bool,
    pub no_side_effect_calls: bool,
}

impl Default for SlotConstraints {
    fn default() -> Self {
        SlotConstraints {
            no_imports: true,
            no_class_defs: true,
            max_lines: 40,
            must_end_with_return: true,
            no_side_effect_calls: true,
        }
    }
}

/// Calls a slot body may never make; everything effectful goes through the
/// session handed to the service.
const SIDE_EFFECT_CALLS: &[&str] = &[
    "os.system",
    "subprocess.",
    "open(",
    "requests.",
    "urllib.",
    "socket.",
    "exec(",
    "eval(",
];

/// A slot found in a skeleton.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub name: String,
    /// Line index of the start marker
    pub start_line: usize,
    /// Line index of the end marker
    pub end_line: usize,
    /// Leading whitespace of the marker lines, reapplied to the body
    pub indent: String,
}

/// Slot discipline violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotViolation {
    #[error("slot '{name}' not found in skeleton")]
    UnknownSlot { name: String },

    #[error("unpaired slot marker '{name}'")]
    Unpaired { name: String },

    #[error("emission for slot '{name}' extends outside its slot: {reason}")]
    OutsideSlot { name: String, reason: String },

    #[error("slot '{name}' constraint violated: {reason}")]
    ConstraintViolated { name: String, reason: String },
}

/// Find all paired slots in a skeleton. Unpaired markers are an error.
pub fn find_slots(skeleton: &str) -> Result<Vec<Slot>, SlotViolation> {
    let mut open: Vec<(String, usize, String)> = Vec::new();
    let mut slots = Vec::new();

    for (idx, line) in skeleton.lines().enumerate() {
        let trimmed = line.trim_start();
        let indent: String = line[..line.len() - trimmed.len()].to_string();
        if let Some(rest) = trimmed.strip_prefix('#').map(str::trim_start) {
            if let Some(name) = rest.strip_prefix(SLOT_START) {
                open.push((name.trim().to_string(), idx, indent));
            } else if let Some(name) = rest.strip_prefix(SLOT_END) {
                let name = name.trim();
                match open.pop() {
                    Some((open_name, start_line, indent)) if open_name == name => {
                        slots.push(Slot {
                            name: open_name,
                            start_line,
                            end_line: idx,
                            indent,
                        });
                    }
                    _ => {
                        return Err(SlotViolation::Unpaired {
                            name: name.to_string(),
                        })
                    }
                }
            }
        }
    }

    if let Some((name, _, _)) = open.pop() {
        return Err(SlotViolation::Unpaired { name });
    }
    slots.sort_by_key(|s| s.start_line);
    Ok(slots)
}

/// Validate a proposed body against the slot's constraints. The body is
/// marker-free raw code; an emission that carries markers or tries to
/// rewrite surrounding code is "outside its slot".
pub fn validate_body(
    slot: &Slot,
    body: &str,
    constraints: &SlotConstraints,
) -> Result<(), SlotViolation> {
    if body.contains("LLM_SLOT") {
        return Err(SlotViolation::OutsideSlot {
            name: slot.name.clone(),
            reason: "body contains slot markers".to_string(),
        });
    }
    if body.contains("def ") && body.contains("(self") {
        return Err(SlotViolation::OutsideSlot {
            name: slot.name.clone(),
            reason: "body redefines a method outside the slot".to_string(),
        });
    }

    let lines: Vec<&str> = body.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() > constraints.max_lines {
        return Err(SlotViolation::ConstraintViolated {
            name: slot.name.clone(),
            reason: format!("{} lines exceed the {} line budget", lines.len(), constraints.max_lines),
        });
    }
    if constraints.no_imports
        && lines
            .iter()
            .any(|l| l.trim_start().starts_with("import ") || l.trim_start().starts_with("from "))
    {
        return Err(SlotViolation::ConstraintViolated {
            name: slot.name.clone(),
            reason: "imports are not allowed in slot bodies".to_string(),
        });
    }
    if constraints.no_class_defs && lines.iter().any(|l| l.trim_start().starts_with("class ")) {
        return Err(SlotViolation::ConstraintViolated {
            name: slot.name.clone(),
            reason: "class definitions are not allowed in slot bodies".to_string(),
        });
    }
    if constraints.no_side_effect_calls {
        for forbidden in SIDE_EFFECT_CALLS {
            if body.contains(forbidden) {
                return Err(SlotViolation::ConstraintViolated {
                    name: slot.name.clone(),
                    reason: format!("side-effect call '{forbidden}' is not allowed"),
                });
            }
        }
    }
    if constraints.must_end_with_return {
        let ends_with_return = lines
            .last()
            .map_or(false, |l| {
                let t = l.trim_start();
                t.starts_with("return") || t.starts_with("raise")
            });
        if !ends_with_return {
            return Err(SlotViolation::ConstraintViolated {
                name: slot.name.clone(),
                reason: "slot body must end with a return".to_string(),
            });
        }
    }
    Ok(())
}

/// Insert a validated body between the slot's markers, preserving the
/// marker lines and re-indenting the body to the slot's depth.
pub fn insert_body(skeleton: &str, slot_name: &str, body: &str) -> Result<String, SlotViolation> {
    let slots = find_slots(skeleton)?;
    let slot = slots
        .iter()
        .find(|s| s.name == slot_name)
        .ok_or_else(|| SlotViolation::UnknownSlot {
            name: slot_name.to_string(),
        })?;

    let lines: Vec<&str> = skeleton.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 8);

    for (idx, line) in lines.iter().enumerate() {
        if idx == slot.start_line {
            out.push((*line).to_string());
            for body_line in body.lines() {
                if body_line.trim().is_empty() {
                    out.push(String::new());
                } else {
                    out.push(format!("{}{}", slot.indent, body_line.trim_end()));
                }
            }
            continue;
        }
        if idx > slot.start_line && idx < slot.end_line {
            // Previous slot content is replaced wholesale.
            continue;
        }
        out.push((*line).to_string());
    }

    let mut result = out.join("\n");
    if skeleton.ends_with('\n') {
        result.push('\n');
    }
    Ok(result)
}

/// The deterministic fallback body used when an emission fails validation
/// twice: an empty guarded body satisfying the default constraints.
pub fn guarded_empty_body() -> String {
    "# generation fell back to a guarded empty body\nreturn None".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SKELETON: &str = "\
class OrderService:
    def pay_order(self, order_id):
        # LLM_SLOT:start:pay_order
        # LLM_SLOT:end:pay_order
";

    #[test]
    fn test_find_paired_slots() {
        let slots = find_slots(SKELETON).expect("slots");
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].name, "pay_order");
        assert_eq!(slots[0].indent, "        ");
    }

    #[test]
    fn test_unpaired_marker_rejected() {
        let broken = "# LLM_SLOT:start:a\n";
        assert!(matches!(
            find_slots(broken),
            Err(SlotViolation::Unpaired { .. })
        ));
    }

    #[test]
    fn test_insert_keeps_markers_and_indent() {
        let merged = insert_body(SKELETON, "pay_order", "order = self.session.get(order_id)\nreturn order")
            .expect("insert");
        assert!(merged.contains("# LLM_SLOT:start:pay_order"));
        assert!(merged.contains("# LLM_SLOT:end:pay_order"));
        assert!(merged.contains("        order = self.session.get(order_id)"));
        // Every byte of the emission lies between the paired markers.
        let start = merged.find("LLM_SLOT:start:pay_order").expect("start");
        let end = merged.find("LLM_SLOT:end:pay_order").expect("end");
        let body_pos = merged.find("return order").expect("body");
        assert!(start < body_pos && body_pos < end);
    }

    #[test]
    fn test_constraints_reject_imports_and_length() {
        let slot = Slot {
            name: "pay_order".to_string(),
            start_line: 0,
            end_line: 1,
            indent: String::new(),
        };
        let constraints = SlotConstraints::default();

        let err = validate_body(&slot, "import os\nreturn None", &constraints)
            .expect_err("imports rejected");
        assert!(matches!(err, SlotViolation::ConstraintViolated { .. }));

        let long_body = format!("{}\nreturn None", "x = 1\n".repeat(60));
        assert!(validate_body(&slot, &long_body, &constraints).is_err());

        let err = validate_body(&slot, "x = 1", &constraints).expect_err("must end with return");
        assert!(matches!(err, SlotViolation::ConstraintViolated { .. }));
    }

    #[test]
    fn test_marker_in_body_is_outside_slot() {
        let slot = Slot {
            name: "pay_order".to_string(),
            start_line: 0,
            end_line: 1,
            indent: String::new(),
        };
        let err = validate_body(
            &slot,
            "# LLM_SLOT:end:pay_order\nreturn None",
            &SlotConstraints::default(),
        )
        .expect_err("markers rejected");
        assert!(matches!(err, SlotViolation::OutsideSlot { .. }));
    }

    #[test]
    fn test_guarded_body_passes_default_constraints() {
        let slot = Slot {
            name: "x".to_string(),
            start_line: 0,
            end_line: 1,
            indent: String::new(),
        };
        assert!(validate_body(&slot, &guarded_empty_body(), &SlotConstraints::default()).is_ok());
    }
}
