//! Response dispatcher: classify inbound status lines and apply them
//!
//! The scan step is ticked externally at a fixed interval. Each tick drains
//! every complete line from the shared buffer (FIFO, no rewinding), strips the
//! processor prompt, and runs the line through an ordered rule table. The
//! first matching rule applies its effect to the registry; unmatched lines
//! are dropped and surfaced as log lines.

use regex::{Captures, Regex};
use roomkey_core::{Backlight, ButtonState, DeviceRegistry};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::buffer::LineBuffer;

/// Prompt the processor prefixes to lines
pub const PROMPT_TOKEN: &str = "QNET>";

type Handler = fn(&DeviceRegistry, &Captures<'_>) -> bool;

/// One entry of the dispatch table
struct Rule {
    name: &'static str,
    pattern: Regex,
    handler: Handler,
}

impl Rule {
    fn new(name: &'static str, pattern: &str, handler: Handler) -> Self {
        Self {
            name,
            pattern: Regex::new(pattern).expect("dispatch pattern is a valid regex"),
            handler,
        }
    }
}

fn dispatch_rules() -> Vec<Rule> {
    vec![
        Rule::new(
            "backlight-active",
            r"^~DEVICE,([^,]+),89,36,(\d+)$",
            apply_backlight_active,
        ),
        Rule::new(
            "backlight-inactive",
            r"^~DEVICE,([^,]+),89,37,(\d+)$",
            apply_backlight_inactive,
        ),
        Rule::new(
            "button-led",
            r"^~DEVICE,([^,]+),8([1-8]),9,([01])$",
            apply_button_led,
        ),
        Rule::new(
            "output-level",
            r"^~OUTPUT,([^,]+),1,(\d+(?:\.\d+)?)$",
            apply_level,
        ),
        Rule::new("sysvar-level", r"^~SYSVAR,([^,]+),1,(\d+)$", apply_level),
    ]
}

fn apply_backlight(registry: &DeviceRegistry, caps: &Captures<'_>, kind: Backlight) -> bool {
    match caps[2].parse::<i32>() {
        Ok(level) => registry.set_backlight(&caps[1], kind, level),
        Err(_) => false,
    }
}

fn apply_backlight_active(registry: &DeviceRegistry, caps: &Captures<'_>) -> bool {
    apply_backlight(registry, caps, Backlight::Active)
}

fn apply_backlight_inactive(registry: &DeviceRegistry, caps: &Captures<'_>) -> bool {
    apply_backlight(registry, caps, Backlight::Inactive)
}

fn apply_button_led(registry: &DeviceRegistry, caps: &Captures<'_>) -> bool {
    let Ok(ordinal) = caps[2].parse::<u8>() else {
        return false;
    };
    registry.set_button_state(&caps[1], ordinal, ButtonState::from_flag(&caps[3]))
}

fn apply_level(registry: &DeviceRegistry, caps: &Captures<'_>) -> bool {
    match caps[2].parse::<f64>() {
        Ok(percentage) => registry.report_level(&caps[1], percentage),
        Err(_) => false,
    }
}

/// Remove leading prompt tokens and surrounding whitespace
pub fn strip_prompt(line: &str) -> &str {
    let mut rest = line.trim();
    while let Some(stripped) = rest.strip_prefix(PROMPT_TOKEN) {
        rest = stripped.trim_start();
    }
    rest
}

/// Outcome of one scan tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Complete lines drained from the buffer
    pub lines: usize,
    /// Lines matched by a rule
    pub matched: usize,
    /// Non-empty lines no rule matched
    pub dropped: usize,
}

/// Table-driven dispatcher over a shared line buffer
pub struct ResponseDispatcher {
    buffer: LineBuffer,
    registry: Arc<DeviceRegistry>,
    rules: Vec<Rule>,
}

impl ResponseDispatcher {
    pub fn new(buffer: LineBuffer, registry: Arc<DeviceRegistry>) -> Self {
        Self {
            buffer,
            registry,
            rules: dispatch_rules(),
        }
    }

    pub fn buffer(&self) -> &LineBuffer {
        &self.buffer
    }

    /// Rule names in match order
    pub fn rules(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.rules.iter().map(|r| r.name)
    }

    /// Name of the first rule matching a line, without applying it
    pub fn classify(&self, line: &str) -> Option<&'static str> {
        let line = strip_prompt(line);
        self.rules
            .iter()
            .find(|r| r.pattern.is_match(line))
            .map(|r| r.name)
    }

    /// Drain and dispatch every complete buffered line; never blocks on I/O
    pub fn scan(&self) -> ScanReport {
        let mut report = ScanReport::default();
        while let Some(line) = self.buffer.next_line() {
            report.lines += 1;
            match self.dispatch_line(&line) {
                Some(_) => report.matched += 1,
                None if strip_prompt(&line).is_empty() => {}
                None => report.dropped += 1,
            }
        }
        if report.lines > 0 {
            trace!(
                lines = report.lines,
                matched = report.matched,
                dropped = report.dropped,
                "Scan complete"
            );
        }
        report
    }

    /// Dispatch a single line, returning the name of the rule that matched
    pub fn dispatch_line(&self, raw: &str) -> Option<&'static str> {
        let line = strip_prompt(raw);
        if line.is_empty() {
            return None;
        }

        for rule in &self.rules {
            if let Some(caps) = rule.pattern.captures(line) {
                let applied = (rule.handler)(&self.registry, &caps);
                trace!(rule = rule.name, line = %line, applied, "Dispatched line");
                return Some(rule.name);
            }
        }

        debug!(line = %line, "Unrecognized line dropped");
        self.registry.notifier().log_line(format!("< {}", line));
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomkey_core::{parse_export, ExportFormat, Notification};
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::sync::broadcast::Receiver;

    fn dispatcher() -> ResponseDispatcher {
        let export = "\n\n\n\n\n\n\
Home\\Kitchen\\Keypad 1,MWP-U-4W,55,,,\n\
,,,Button 1,,On\n\
,,,Button 2,,Off\n\
Zone Name\n\
Kitchen Downlights,21\n\
\n\
Variable Name\n\
Evening,30\n";
        let registry = Arc::new(DeviceRegistry::from_ingestion(parse_export(
            export.as_bytes(),
            &ExportFormat::default(),
        )));
        ResponseDispatcher::new(LineBuffer::new(), registry)
    }

    fn drain(rx: &mut Receiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(n) => out.push(n),
                Err(TryRecvError::Empty) => return out,
                Err(e) => panic!("receiver error {:?}", e),
            }
        }
    }

    #[test]
    fn test_rule_table_order() {
        let dispatcher = dispatcher();
        let names: Vec<&str> = dispatcher.rules().collect();
        assert_eq!(
            names,
            vec![
                "backlight-active",
                "backlight-inactive",
                "button-led",
                "output-level",
                "sysvar-level"
            ]
        );
    }

    #[test]
    fn test_classify() {
        let dispatcher = dispatcher();
        assert_eq!(dispatcher.classify("~DEVICE,55,89,36,080"), Some("backlight-active"));
        assert_eq!(dispatcher.classify("~DEVICE,55,89,37,5"), Some("backlight-inactive"));
        assert_eq!(dispatcher.classify("QNET> ~DEVICE,55,84,9,0"), Some("button-led"));
        assert_eq!(dispatcher.classify("~OUTPUT,21,1,75.00"), Some("output-level"));
        assert_eq!(dispatcher.classify("~SYSVAR,30,1,2"), Some("sysvar-level"));
        assert_eq!(dispatcher.classify("~DEVICE,55,82,9,2"), None);
        assert_eq!(dispatcher.classify("~DEVICE,55,89,9,1"), None);
        assert_eq!(dispatcher.classify("~DEVICE,55,80,9,1"), None);
        assert_eq!(dispatcher.classify("~DEVICE,55,89,38,10"), None);
        assert_eq!(dispatcher.classify("~OUTPUT,21,2,75.00"), None);
    }

    #[test]
    fn test_strip_prompt() {
        assert_eq!(strip_prompt("QNET> ~DEVICE,1,81,9,1 "), "~DEVICE,1,81,9,1");
        assert_eq!(strip_prompt("QNET> QNET> GNET"), "GNET");
        assert_eq!(strip_prompt("QNET> "), "");
    }

    #[test]
    fn test_active_backlight_line() {
        let dispatcher = dispatcher();
        let mut rx = dispatcher.registry.subscribe();
        dispatcher.buffer().append(b"~DEVICE,55,89,36,080\r\n");

        let report = dispatcher.scan();
        assert_eq!(report, ScanReport { lines: 1, matched: 1, dropped: 0 });
        assert_eq!(dispatcher.registry.backlight("55", Backlight::Active), Some(80));

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .all(|e| !matches!(e, Notification::ButtonChanged { .. })));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_button_line_raises_one_notification() {
        let dispatcher = dispatcher();
        let mut rx = dispatcher.registry.subscribe();
        dispatcher.buffer().append(b"~DEVICE,55,82,9,1\r\n");
        dispatcher.scan();

        assert_eq!(
            dispatcher.registry.button_state("55", 2),
            Some(ButtonState::Active)
        );
        assert_eq!(
            drain(&mut rx),
            vec![Notification::ButtonChanged {
                device_id: "55".into(),
                ordinal: 2,
                state: ButtonState::Active,
            }]
        );
    }

    #[test]
    fn test_backlight_address_is_not_a_button() {
        let dispatcher = dispatcher();
        let mut rx = dispatcher.registry.subscribe();
        let before = dispatcher.registry.snapshot();

        assert_eq!(dispatcher.dispatch_line("~DEVICE,55,89,9,1"), None);
        assert_eq!(dispatcher.registry.snapshot(), before);
        assert_eq!(
            dispatcher.registry.button_state("55", 9),
            Some(ButtonState::Unknown)
        );
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .all(|e| !matches!(e, Notification::ButtonChanged { .. })));
    }

    #[test]
    fn test_refeeding_is_idempotent() {
        let dispatcher = dispatcher();
        let mut rx = dispatcher.registry.subscribe();

        dispatcher.buffer().append(b"~DEVICE,55,81,9,0\r\n");
        dispatcher.scan();
        let once = dispatcher.registry.snapshot();

        dispatcher.buffer().append(b"~DEVICE,55,81,9,0\r\n");
        dispatcher.scan();
        assert_eq!(dispatcher.registry.snapshot(), once);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, Notification::ButtonChanged { ordinal: 1, .. })));
    }

    #[test]
    fn test_levels_correlate_with_sections() {
        let dispatcher = dispatcher();
        let mut rx = dispatcher.registry.subscribe();
        dispatcher
            .buffer()
            .append(b"QNET> ~OUTPUT,21,1,42.50\r\n~SYSVAR,30,1,3\r\n~OUTPUT,99,1,1.00\r\n");

        let report = dispatcher.scan();
        assert_eq!(report, ScanReport { lines: 3, matched: 3, dropped: 0 });
        assert_eq!(
            drain(&mut rx),
            vec![
                Notification::BrightnessChanged {
                    id: "21".to_string(),
                    percentage: 42.5,
                    section: "Zone Name".to_string(),
                    key: "Kitchen Downlights".to_string(),
                },
                Notification::BrightnessChanged {
                    id: "30".to_string(),
                    percentage: 3.0,
                    section: "Variable Name".to_string(),
                    key: "Evening".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_unmatched_lines_are_dropped_and_logged() {
        let dispatcher = dispatcher();
        let mut rx = dispatcher.registry.subscribe();
        dispatcher
            .buffer()
            .append(b"QNET> \r\n~TIMECLOCK,1,6,2\r\n~DEVICE,55,89,36,080\r\n");

        let report = dispatcher.scan();
        assert_eq!(report, ScanReport { lines: 3, matched: 1, dropped: 1 });

        let events = drain(&mut rx);
        assert_eq!(
            events[0],
            Notification::Log {
                text: "< ~TIMECLOCK,1,6,2".to_string()
            }
        );
        assert!(matches!(events[1], Notification::BacklightChanged { level: 80, .. }));
    }

    #[test]
    fn test_partial_line_waits_for_next_tick() {
        let dispatcher = dispatcher();
        dispatcher.buffer().append(b"~DEVICE,55,89,3");
        assert_eq!(dispatcher.scan().lines, 0);
        dispatcher.buffer().append(b"7,25\r\n");
        assert_eq!(dispatcher.scan().matched, 1);
        assert_eq!(
            dispatcher.registry.backlight("55", Backlight::Inactive),
            Some(25)
        );
    }
}
