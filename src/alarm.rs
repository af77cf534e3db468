//! Alarm stream lines.
//!
//! Dahua cameras emit one line per event inside a multipart stream, e.g.
//! `Code=CrossLineDetection;action=Start;index=0;data={...}`. Boundary and header
//! lines, and `Heartbeat` keep-alives, carry no event.

pub const DEFAULT_ALARM_CODE: &str = "CrossLineDetection";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlarmEvent {
    pub code: String,
    pub action: Option<String>,
    pub index: Option<u32>,
    /// Free-form remainder (`data=` payload), if any.
    pub metadata: Option<String>,
}

impl AlarmEvent {
    /// Parse an event line. Returns `None` for lines that carry no event code.
    pub fn parse(line: &str) -> Option<Self> {
        let start = line.find("Code=")?;
        let body = line[start..].trim_end();

        let mut code = None;
        let mut action = None;
        let mut index = None;
        let mut metadata = None;
        let mut rest = body;
        while !rest.is_empty() {
            // `data=` is JSON and may itself contain ';'.
            if let Some(data) = rest.strip_prefix("data=") {
                metadata = Some(data.to_string());
                break;
            }
            let (field, tail) = rest.split_once(';').unwrap_or((rest, ""));
            if let Some((key, value)) = field.split_once('=') {
                match key {
                    "Code" => code = Some(value.to_string()),
                    "action" => action = Some(value.to_string()),
                    "index" => index = value.parse().ok(),
                    _ => {}
                }
            }
            rest = tail;
        }

        let code = code.filter(|c| !c.is_empty())?;
        Some(Self {
            code,
            action,
            index,
            metadata,
        })
    }

    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

/// True when `line` carries an event with exactly `code`.
pub fn line_matches(line: &str, code: &str) -> bool {
    if line.trim().is_empty() {
        return false;
    }
    AlarmEvent::parse(line).is_some_and(|event| event.is(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_line_crossing_start() {
        let event = AlarmEvent::parse(
            r#"Code=CrossLineDetection;action=Start;index=0;data={"Object":{"Action":"Appear"};"x":1}"#,
        )
        .unwrap();
        assert_eq!(event.code, "CrossLineDetection");
        assert_eq!(event.action.as_deref(), Some("Start"));
        assert_eq!(event.index, Some(0));
        assert_eq!(
            event.metadata.as_deref(),
            Some(r#"{"Object":{"Action":"Appear"};"x":1}"#)
        );
    }

    #[test]
    fn ignores_lines_without_events() {
        assert!(AlarmEvent::parse("--myboundary").is_none());
        assert!(AlarmEvent::parse("Content-Type: text/plain").is_none());
        assert!(AlarmEvent::parse("Heartbeat").is_none());
        assert!(AlarmEvent::parse("Code=;action=Start").is_none());
    }

    #[test]
    fn matches_only_the_requested_code() {
        assert!(line_matches(
            "Code=CrossLineDetection;action=Stop;index=0\r",
            DEFAULT_ALARM_CODE
        ));
        assert!(!line_matches(
            "Code=CrossRegionDetection;action=Start;index=0",
            DEFAULT_ALARM_CODE
        ));
        assert!(!line_matches("", DEFAULT_ALARM_CODE));
        assert!(!line_matches("   ", DEFAULT_ALARM_CODE));
    }
}
