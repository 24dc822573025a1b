use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{APIError, Error, Result, ValidationError};

/// Country calling codes the gateway accepts (US/CA, UK, AU, NZ, IE).
pub const SUPPORTED_COUNTRY_CODES: &[&str] = &["1", "44", "61", "64", "353"];

/// Default maximum call duration sent when the request does not set one.
pub const DEFAULT_MAX_DURATION_MINUTES: u32 = 120;

/// Lifecycle status of a remote call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CallStatusKind {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Other(String),
}

impl CallStatusKind {
    pub fn as_str(&self) -> &str {
        match self {
            CallStatusKind::Pending => "pending",
            CallStatusKind::InProgress => "in_progress",
            CallStatusKind::Completed => "completed",
            CallStatusKind::Failed => "failed",
            CallStatusKind::Cancelled => "cancelled",
            CallStatusKind::Other(other) => other.as_str(),
        }
    }

    /// Completed, failed and cancelled calls never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatusKind::Completed | CallStatusKind::Failed | CallStatusKind::Cancelled
        )
    }

    pub(crate) fn rank(&self) -> u8 {
        match self {
            CallStatusKind::Other(_) | CallStatusKind::Pending => 0,
            CallStatusKind::InProgress => 1,
            CallStatusKind::Completed | CallStatusKind::Failed | CallStatusKind::Cancelled => 2,
        }
    }
}

impl From<&str> for CallStatusKind {
    fn from(value: &str) -> Self {
        CallStatusKind::from(value.to_string())
    }
}

impl From<String> for CallStatusKind {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().as_str() {
            "pending" | "queued" => CallStatusKind::Pending,
            "in_progress" => CallStatusKind::InProgress,
            "completed" => CallStatusKind::Completed,
            "failed" => CallStatusKind::Failed,
            "cancelled" | "canceled" => CallStatusKind::Cancelled,
            _ => CallStatusKind::Other(value),
        }
    }
}

impl From<CallStatusKind> for String {
    fn from(value: CallStatusKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for CallStatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sub-state of an in-progress call, ordered from dialing to wrap-up.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CallPhase {
    Dialing,
    Ringing,
    Connected,
    Speaking,
    WrappingUp,
    Other(String),
}

impl CallPhase {
    pub fn as_str(&self) -> &str {
        match self {
            CallPhase::Dialing => "dialing",
            CallPhase::Ringing => "ringing",
            CallPhase::Connected => "connected",
            CallPhase::Speaking => "speaking",
            CallPhase::WrappingUp => "wrapping_up",
            CallPhase::Other(other) => other.as_str(),
        }
    }

    /// Position on the phase ladder; unknown phases have no rank.
    pub fn rank(&self) -> Option<u8> {
        match self {
            CallPhase::Dialing => Some(1),
            CallPhase::Ringing => Some(2),
            CallPhase::Connected => Some(3),
            CallPhase::Speaking => Some(4),
            CallPhase::WrappingUp => Some(5),
            CallPhase::Other(_) => None,
        }
    }
}

impl From<&str> for CallPhase {
    fn from(value: &str) -> Self {
        CallPhase::from(value.to_string())
    }
}

impl From<String> for CallPhase {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().as_str() {
            "dialing" => CallPhase::Dialing,
            "ringing" => CallPhase::Ringing,
            "connected" => CallPhase::Connected,
            "speaking" => CallPhase::Speaking,
            "wrapping_up" => CallPhase::WrappingUp,
            _ => CallPhase::Other(value),
        }
    }
}

impl From<CallPhase> for String {
    fn from(value: CallPhase) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome classification assigned by the gateway once a call is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TriageCategory {
    Successful,
    PartiallySuccessful,
    Unsuccessful,
    NoAnswer,
    Voicemail,
    Other(String),
}

impl TriageCategory {
    pub fn as_str(&self) -> &str {
        match self {
            TriageCategory::Successful => "successful",
            TriageCategory::PartiallySuccessful => "partially_successful",
            TriageCategory::Unsuccessful => "unsuccessful",
            TriageCategory::NoAnswer => "no_answer",
            TriageCategory::Voicemail => "voicemail",
            TriageCategory::Other(other) => other.as_str(),
        }
    }
}

impl From<String> for TriageCategory {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().as_str() {
            "successful" => TriageCategory::Successful,
            "partially_successful" => TriageCategory::PartiallySuccessful,
            "unsuccessful" => TriageCategory::Unsuccessful,
            "no_answer" => TriageCategory::NoAnswer,
            "voicemail" => TriageCategory::Voicemail,
            _ => TriageCategory::Other(value),
        }
    }
}

impl From<TriageCategory> for String {
    fn from(value: TriageCategory) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for TriageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Voice used by the calling agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Voice {
    Male,
    Female,
}

/// Persona the agent adopts on the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerPersona {
    Negotiator,
    Communicator,
}

/// A single turn in the call transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// "agent" or "user".
    #[serde(default)]
    pub speaker: String,
    #[serde(default)]
    pub text: String,
}

impl TranscriptEntry {
    pub fn new(speaker: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            speaker: speaker.into(),
            text: text.into(),
        }
    }
}

/// Parameters for placing a call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallRequest {
    /// Destination in E.164 form, e.g. `+14155551234`.
    pub to: String,
    /// Who is being called.
    pub name: String,
    /// Background the agent needs about the callee.
    pub context: String,
    /// What the call should accomplish.
    pub objective: String,
    pub instructions: Option<String>,
    pub caller: Option<CallerPersona>,
    pub voice: Option<Voice>,
    pub max_duration_minutes: Option<u32>,
    /// Ask the gateway for an LLM summary once the call ends.
    pub enable_summary: bool,
}

impl CallRequest {
    pub fn new(
        to: impl Into<String>,
        name: impl Into<String>,
        context: impl Into<String>,
        objective: impl Into<String>,
    ) -> Self {
        Self {
            to: to.into(),
            name: name.into(),
            context: context.into(),
            objective: objective.into(),
            ..Default::default()
        }
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn caller(mut self, caller: CallerPersona) -> Self {
        self.caller = Some(caller);
        self
    }

    pub fn voice(mut self, voice: Voice) -> Self {
        self.voice = Some(voice);
        self
    }

    pub fn max_duration_minutes(mut self, minutes: u32) -> Self {
        self.max_duration_minutes = Some(minutes);
        self
    }

    pub fn enable_summary(mut self) -> Self {
        self.enable_summary = true;
        self
    }

    /// Check required fields and the destination allow-list.
    ///
    /// The allow-list check only rejects numbers whose country code can be
    /// read (leading `+`); the gateway stays authoritative for everything else.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("to", &self.to),
            ("name", &self.name),
            ("context", &self.context),
            ("objective", &self.objective),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::new("is required").with_field(field).into());
            }
        }
        if self.max_duration_minutes == Some(0) {
            return Err(ValidationError::new("must be at least 1")
                .with_field("max_duration_minutes")
                .into());
        }

        let to = self.to.trim();
        if let Some(rest) = to.strip_prefix('+') {
            let digits: String = rest
                .chars()
                .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
                .collect();
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return Err(ValidationError::new("must be a phone number in E.164 form")
                    .with_field("to")
                    .into());
            }
            if !SUPPORTED_COUNTRY_CODES
                .iter()
                .any(|code| digits.starts_with(code))
            {
                return Err(Error::Policy(
                    APIError::new(0, format!("destination {to} is outside the supported countries"))
                        .with_code("UNSUPPORTED_COUNTRY"),
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn to_wire(&self) -> CallBody<'_> {
        CallBody {
            dialed_number: self.to.trim(),
            callee_name: &self.name,
            callee_context: &self.context,
            call_objective: &self.objective,
            detailed_instructions: self.instructions.as_deref().unwrap_or(""),
            max_duration_minutes: self
                .max_duration_minutes
                .unwrap_or(DEFAULT_MAX_DURATION_MINUTES),
            caller: self.caller,
            voice: self.voice,
            enable_summary: self.enable_summary.then_some(true),
        }
    }
}

/// Wire shape of `POST /api/v2/voice/call`.
#[derive(Debug, Serialize)]
pub(crate) struct CallBody<'a> {
    dialed_number: &'a str,
    callee_name: &'a str,
    callee_context: &'a str,
    call_objective: &'a str,
    detailed_instructions: &'a str,
    max_duration_minutes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    caller: Option<CallerPersona>,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<Voice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enable_summary: Option<bool>,
}

/// Returned when a call is successfully initiated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInitiated {
    pub call_id: String,
    pub status: CallStatusKind,
}

/// Snapshot of a call that has not reached a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallStatus {
    pub call_id: String,
    pub status: CallStatusKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<CallPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_transcript: Option<Vec<TranscriptEntry>>,
}

/// Final outcome of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    pub call_id: String,
    pub status: CallStatusKind,
    pub duration_seconds: u64,
    /// Present only when the call was placed with `enable_summary`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub transcript: Vec<TranscriptEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triage_category: Option<TriageCategory>,
    pub credits_charged: f64,
}

/// Result of `GET /api/v2/voice/call/{id}`.
#[derive(Debug, Clone, PartialEq)]
pub enum CallLookup {
    InProgress(CallStatus),
    Finished(CallResult),
}

impl CallLookup {
    pub fn call_id(&self) -> &str {
        match self {
            CallLookup::InProgress(status) => &status.call_id,
            CallLookup::Finished(result) => &result.call_id,
        }
    }

    pub fn status(&self) -> &CallStatusKind {
        match self {
            CallLookup::InProgress(status) => &status.status,
            CallLookup::Finished(result) => &result.status,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallLookup::Finished(_))
    }

    pub fn into_result(self) -> Option<CallResult> {
        match self {
            CallLookup::Finished(result) => Some(result),
            CallLookup::InProgress(_) => None,
        }
    }
}

/// Transient progress notification for an in-flight call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallProgress {
    pub call_id: String,
    pub status: CallStatusKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<CallPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    /// Cumulative transcript so far.
    #[serde(default)]
    pub partial_transcript: Vec<TranscriptEntry>,
    /// Turns that were not part of any earlier notification.
    #[serde(default)]
    pub new_turns: Vec<TranscriptEntry>,
}

impl From<CallStatus> for CallProgress {
    fn from(status: CallStatus) -> Self {
        Self {
            call_id: status.call_id,
            status: status.status,
            phase: status.phase,
            duration_seconds: status.duration_seconds,
            partial_transcript: status.partial_transcript.unwrap_or_default(),
            new_turns: Vec::new(),
        }
    }
}

/// Permissive wire shape shared by `GET` responses and stream payloads.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct WireCall {
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    status: Option<CallStatusKind>,
    #[serde(default)]
    phase: Option<CallPhase>,
    #[serde(default)]
    duration_seconds: Option<u64>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    transcript: Option<Vec<TranscriptEntry>>,
    #[serde(default)]
    partial_transcript: Option<Vec<TranscriptEntry>>,
    #[serde(default)]
    triage_category: Option<TriageCategory>,
    #[serde(default)]
    credits_charged: Option<f64>,
}

impl WireCall {
    pub(crate) fn into_lookup(self, status: CallStatusKind) -> CallLookup {
        let call_id = self.call_id.unwrap_or_default();
        if status.is_terminal() {
            return CallLookup::Finished(CallResult {
                call_id,
                status,
                duration_seconds: self.duration_seconds.unwrap_or(0),
                summary: self.summary.filter(|s| !s.trim().is_empty()),
                transcript: self.transcript.unwrap_or_default(),
                triage_category: self
                    .triage_category
                    .filter(|t| !t.as_str().trim().is_empty()),
                credits_charged: self.credits_charged.unwrap_or(0.0),
            });
        }
        CallLookup::InProgress(CallStatus {
            call_id,
            status,
            phase: self.phase,
            duration_seconds: self.duration_seconds,
            partial_transcript: self.partial_transcript.or(self.transcript),
        })
    }
}

fn parse_wire_call(raw: &str) -> Result<WireCall> {
    if raw.trim().is_empty() {
        return Err(Error::malformed(
            "gateway returned an empty call payload",
            None,
        ));
    }
    serde_json::from_str(raw)
        .map_err(|err| Error::malformed(format!("invalid call payload: {err}"), Some(raw)))
}

/// Parse a call payload (HTTP body or `result` event data). A missing or
/// blank `status` is malformed.
pub(crate) fn parse_call_payload(raw: &str) -> Result<CallLookup> {
    let mut wire = parse_wire_call(raw)?;
    let status = wire
        .status
        .take()
        .filter(|status| !status.as_str().trim().is_empty())
        .ok_or_else(|| Error::malformed("call payload is missing status", Some(raw)))?;
    Ok(wire.into_lookup(status))
}

/// Parse a progress event's data. Partial updates may omit `status`; the
/// call is still live then.
pub(crate) fn parse_progress_payload(raw: &str) -> Result<CallLookup> {
    let mut wire = parse_wire_call(raw)?;
    let status = wire
        .status
        .take()
        .filter(|status| !status.as_str().trim().is_empty())
        .unwrap_or(CallStatusKind::InProgress);
    Ok(wire.into_lookup(status))
}

#[derive(Debug, Deserialize)]
struct WireInitiated {
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    status: Option<CallStatusKind>,
}

pub(crate) fn parse_call_initiated(raw: &str) -> Result<CallInitiated> {
    let wire: WireInitiated = serde_json::from_str(raw)
        .map_err(|err| Error::malformed(format!("invalid create response: {err}"), Some(raw)))?;
    let call_id = wire
        .call_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| Error::malformed("create response is missing call_id", Some(raw)))?;
    Ok(CallInitiated {
        call_id,
        status: wire.status.unwrap_or(CallStatusKind::Pending),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use serde_json::json;

    fn request(to: &str) -> CallRequest {
        CallRequest::new(to, "Dr. Smith Office", "Local dentist", "Book a cleaning")
    }

    #[test]
    fn status_strings_round_trip_and_classify() {
        assert_eq!(CallStatusKind::from("in_progress"), CallStatusKind::InProgress);
        assert_eq!(CallStatusKind::from("Canceled"), CallStatusKind::Cancelled);
        assert!(CallStatusKind::Completed.is_terminal());
        assert!(!CallStatusKind::Pending.is_terminal());
        assert!(!CallStatusKind::from("on_hold").is_terminal());
        assert_eq!(String::from(CallStatusKind::from("on_hold")), "on_hold");
    }

    #[test]
    fn phases_are_ordered() {
        assert!(CallPhase::Dialing.rank() < CallPhase::Connected.rank());
        assert!(CallPhase::Connected.rank() < CallPhase::Speaking.rank());
        assert_eq!(CallPhase::from("hold_music").rank(), None);
    }

    #[test]
    fn validate_requires_fields() {
        let err = CallRequest::new("+14155551234", " ", "ctx", "goal")
            .validate()
            .unwrap_err();
        match err {
            Error::Validation(v) => assert_eq!(v.field.as_deref(), Some("name")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn validate_accepts_supported_countries() {
        for to in [
            "+14155551234",
            "+442071838750",
            "+61 2 9374 4000",
            "+6493020000",
            "+35316713333",
        ] {
            request(to).validate().expect(to);
        }
    }

    #[test]
    fn validate_rejects_unsupported_country_as_policy() {
        let err = request("+33100000000").validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PolicyViolation);
        assert_eq!(
            err.api_error().and_then(|api| api.code.as_deref()),
            Some("UNSUPPORTED_COUNTRY")
        );
    }

    #[test]
    fn validate_leaves_unprefixed_numbers_to_the_gateway() {
        request("4155551234").validate().expect("gateway decides");
        let err = request("+1-800-FLOWERS").validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn wire_body_applies_defaults() {
        let body = serde_json::to_value(request("+14155551234").to_wire()).unwrap();
        assert_eq!(
            body,
            json!({
                "dialed_number": "+14155551234",
                "callee_name": "Dr. Smith Office",
                "callee_context": "Local dentist",
                "call_objective": "Book a cleaning",
                "detailed_instructions": "",
                "max_duration_minutes": 120
            })
        );

        let body = serde_json::to_value(
            request("+14155551234")
                .instructions("Ask for Tuesday")
                .voice(Voice::Female)
                .caller(CallerPersona::Negotiator)
                .max_duration_minutes(15)
                .enable_summary()
                .to_wire(),
        )
        .unwrap();
        assert_eq!(body["voice"], "female");
        assert_eq!(body["caller"], "negotiator");
        assert_eq!(body["enable_summary"], true);
        assert_eq!(body["max_duration_minutes"], 15);
        assert_eq!(body["detailed_instructions"], "Ask for Tuesday");
    }

    #[test]
    fn terminal_payload_becomes_result() {
        let raw = json!({
            "call_id": "abc123",
            "status": "completed",
            "duration_seconds": 95,
            "summary": "",
            "transcript": [{"speaker": "agent", "text": "Hi"}],
            "triage_category": "successful",
            "credits_charged": 3
        })
        .to_string();
        let result = parse_call_payload(&raw).unwrap().into_result().unwrap();
        assert_eq!(result.call_id, "abc123");
        assert_eq!(result.summary, None);
        assert_eq!(result.triage_category, Some(TriageCategory::Successful));
        assert_eq!(result.credits_charged, 3.0);
        assert_eq!(result.transcript.len(), 1);
    }

    #[test]
    fn non_terminal_payload_keeps_phase_and_partial_transcript() {
        let raw = r#"{"call_id":"abc123","status":"in_progress","phase":"connected","partial_transcript":[{"speaker":"user","text":"Hello?"}]}"#;
        match parse_call_payload(raw).unwrap() {
            CallLookup::InProgress(status) => {
                assert_eq!(status.phase, Some(CallPhase::Connected));
                assert_eq!(status.partial_transcript.map(|t| t.len()), Some(1));
            }
            other => panic!("expected in-progress, got {other:?}"),
        }
    }

    #[test]
    fn empty_or_invalid_payloads_are_malformed() {
        assert_eq!(
            parse_call_payload("").unwrap_err().kind(),
            ErrorKind::MalformedResponse
        );
        assert_eq!(
            parse_call_payload("[1,2]").unwrap_err().kind(),
            ErrorKind::MalformedResponse
        );
        assert_eq!(
            parse_call_payload(r#"{"unexpected":true}"#)
                .unwrap_err()
                .kind(),
            ErrorKind::MalformedResponse
        );
        assert_eq!(
            parse_call_payload(r#"{"call_id":"abc123","status":"  "}"#)
                .unwrap_err()
                .kind(),
            ErrorKind::MalformedResponse
        );
        assert_eq!(
            parse_call_initiated(r#"{"status":"pending"}"#)
                .unwrap_err()
                .kind(),
            ErrorKind::MalformedResponse
        );
    }

    #[test]
    fn progress_payload_without_status_is_live() {
        let raw = r#"{"call_id":"abc123","partial_transcript":[{"speaker":"agent","text":"Hi"}]}"#;
        match parse_progress_payload(raw).unwrap() {
            CallLookup::InProgress(status) => assert_eq!(status.status, CallStatusKind::InProgress),
            other => panic!("expected in-progress, got {other:?}"),
        }
    }

    #[test]
    fn initiated_defaults_to_pending() {
        let initiated = parse_call_initiated(r#"{"call_id":"abc123"}"#).unwrap();
        assert_eq!(initiated.status, CallStatusKind::Pending);
    }
}
