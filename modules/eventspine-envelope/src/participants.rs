//! Participants allowed to appear as `source` or `target` on an envelope.

/// The application domains exchanging events, plus the harness participants
/// that inject faults and emit spine-level events.
pub const KNOWN_PARTICIPANTS: &[&str] = &[
    "receptionist",
    "flowbills",
    "compliance",
    "billing",
    "scheduler",
    "inventory",
    "crm",
    "analytics",
    "notifications",
    "payroll",
    "support",
    "reporting",
    "chaos-runner",
    "event-spine",
];

pub fn is_known_participant(name: &str) -> bool {
    KNOWN_PARTICIPANTS.contains(&name)
}
