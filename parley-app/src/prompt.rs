use chrono::{DateTime, SecondsFormat, Utc};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant that can do various tasks...";

const SCHEDULE_TOOL_NOTE: &str =
    "If the user asks to schedule a task, use the schedule_task tool to schedule the task.";

/// Builds the system prompt for a turn. Pure given `now`.
#[derive(Debug, Clone)]
pub struct PromptComposer {
    base_instructions: String,
}

impl Default for PromptComposer {
    fn default() -> Self {
        Self::new(DEFAULT_SYSTEM_PROMPT)
    }
}

impl PromptComposer {
    pub fn new(base_instructions: impl Into<String>) -> Self {
        let base_instructions = base_instructions.into();
        let base_instructions = if base_instructions.trim().is_empty() {
            DEFAULT_SYSTEM_PROMPT.to_string()
        } else {
            base_instructions.trim().to_string()
        };
        Self { base_instructions }
    }

    pub fn compose(&self, now: DateTime<Utc>) -> String {
        format!(
            "{}\n\n{}\n\n{}",
            self.base_instructions,
            schedule_hint(now),
            SCHEDULE_TOOL_NOTE
        )
    }
}

/// Describes the current time and how a schedule request is phrased.
pub fn schedule_hint(now: DateTime<Utc>) -> String {
    let stamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    format!(
        "[Schedule Task]\n\
         The current date and time is {stamp} ({weekday}).\n\
         You can schedule a task with the schedule_task tool. Give it a `description` of what\n\
         should happen and a `when` object in one of these forms:\n\
         - {{\"type\": \"at\", \"at\": \"<RFC 3339 timestamp>\"}} to run once at a given time\n\
         - {{\"type\": \"delay\", \"seconds\": <number>}} to run once after a delay\n\
         - {{\"type\": \"cron\", \"expression\": \"<cron expression>\"}} to run on a recurring schedule\n\
         Resolve relative times like \"tomorrow at 9\" against the current date and time above.\n\
         Use list_scheduled_tasks to see pending tasks and cancel_scheduled_task to remove one.",
        weekday = now.format("%A"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn compose_is_deterministic_and_embeds_time() {
        let composer = PromptComposer::default();
        let a = composer.compose(fixed_now());
        let b = composer.compose(fixed_now());
        assert_eq!(a, b);
        assert!(a.starts_with(DEFAULT_SYSTEM_PROMPT));
        assert!(a.contains("2025-03-14T09:26:53Z"));
        assert!(a.contains("Friday"));
        assert!(a.ends_with(SCHEDULE_TOOL_NOTE));
    }

    #[test]
    fn hint_describes_every_when_form() {
        let hint = schedule_hint(fixed_now());
        for form in ["\"type\": \"at\"", "\"type\": \"delay\"", "\"type\": \"cron\""] {
            assert!(hint.contains(form), "missing {form}");
        }
    }

    #[test]
    fn blank_base_falls_back_to_default() {
        let composer = PromptComposer::new("   ");
        assert!(composer.compose(fixed_now()).starts_with(DEFAULT_SYSTEM_PROMPT));
        let custom = PromptComposer::new("Be brief.");
        assert!(custom.compose(fixed_now()).starts_with("Be brief.\n\n[Schedule Task]"));
    }
}
