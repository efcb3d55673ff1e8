//! Host-facing calendar tools
//!
//! Each call first asks the token lifecycle for a usable access token. If
//! there is none, the user gets a fresh authorization ticket and the host
//! receives the `[AUTH] <ticket>` sentinel instead of calendar data.

use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::tickets::TicketManager;
use crate::calendar::{CalendarClient, LOCAL_TIME_FORMAT, NewEvent};
use crate::oauth::TokenManager;
use crate::protocol::{Content, Tool, ToolAnnotations, ToolsCallResult};
use crate::{Error, Result};

/// Prefix the host looks for to start user authorization
pub const AUTH_SENTINEL: &str = "[AUTH]";

/// Result of a tool call before it is rendered for the host
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    /// Provider data
    Ok(Value),
    /// The user must authorize first; carries their ticket
    AuthRequired(String),
    /// Arguments were well-formed but unusable
    Rejected(String),
}

impl ToolOutcome {
    /// Whether the host should treat this as a tool error
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// Text handed back to the host
    #[must_use]
    pub fn into_text(self) -> String {
        match self {
            Self::Ok(value) => value.to_string(),
            Self::AuthRequired(ticket) => format!("{AUTH_SENTINEL} {ticket}"),
            Self::Rejected(message) => message,
        }
    }

    /// MCP `tools/call` result
    #[must_use]
    pub fn into_call_result(self) -> ToolsCallResult {
        let is_error = self.is_error();
        ToolsCallResult {
            content: vec![Content::text(self.into_text())],
            is_error,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AddEventArgs {
    details: String,
    start_time: String,
    end_time: String,
}

/// Calendar tools bound to the broker's token and ticket state
pub struct CalendarTools {
    tokens: Arc<TokenManager>,
    tickets: Arc<TicketManager>,
    calendar: CalendarClient,
}

impl CalendarTools {
    /// Create the tool set
    pub fn new(
        tokens: Arc<TokenManager>,
        tickets: Arc<TicketManager>,
        calendar: CalendarClient,
    ) -> Self {
        Self {
            tokens,
            tickets,
            calendar,
        }
    }

    /// Tool definitions for `tools/list`
    #[must_use]
    pub fn definitions() -> Vec<Tool> {
        vec![
            Tool {
                name: "view_calendar".to_string(),
                title: Some("View calendar".to_string()),
                description: Some(
                    "List the user's upcoming calendar events. Returns a JSON array of events, \
                     or \"[AUTH] <ticket>\" when the user has to authorize calendar access first."
                        .to_string(),
                ),
                input_schema: json!({
                    "type": "object",
                    "properties": {}
                }),
                annotations: Some(ToolAnnotations {
                    read_only_hint: Some(true),
                    destructive_hint: Some(false),
                    open_world_hint: Some(true),
                }),
            },
            Tool {
                name: "add_event_to_calendar".to_string(),
                title: Some("Add calendar event".to_string()),
                description: Some(
                    "Add an event to the user's calendar. Times are local to the calendar's \
                     timezone in YYYY-MM-DDTHH:MM:SS format (e.g. 2025-05-26T07:00:00). \
                     Returns the created event as JSON, or \"[AUTH] <ticket>\" when the user \
                     has to authorize calendar access first."
                        .to_string(),
                ),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "details": {
                            "type": "string",
                            "description": "Summary of the event (e.g. \"Team meeting\")"
                        },
                        "start_time": {
                            "type": "string",
                            "description": "Start time, YYYY-MM-DDTHH:MM:SS"
                        },
                        "end_time": {
                            "type": "string",
                            "description": "End time, YYYY-MM-DDTHH:MM:SS"
                        }
                    },
                    "required": ["details", "start_time", "end_time"]
                }),
                annotations: Some(ToolAnnotations {
                    read_only_hint: Some(false),
                    destructive_hint: Some(false),
                    open_world_hint: Some(true),
                }),
            },
        ]
    }

    /// Dispatch a tool call for `user_id`
    pub async fn call(&self, user_id: &str, name: &str, arguments: Value) -> Result<ToolOutcome> {
        match name {
            "view_calendar" => Ok(self.view_calendar(user_id).await),
            "add_event_to_calendar" => self.add_event_to_calendar(user_id, arguments).await,
            _ => Err(Error::UnknownTool(name.to_string())),
        }
    }

    /// Access token for the user, or a ticket to start consent with
    async fn access_token(&self, user_id: &str) -> std::result::Result<String, ToolOutcome> {
        match self.tokens.get_user_token(user_id).await {
            Some(token) => Ok(token),
            None => {
                info!(user_id = %user_id, "No usable credentials, authorization required");
                Err(ToolOutcome::AuthRequired(self.tickets.issue(user_id)))
            }
        }
    }

    async fn view_calendar(&self, user_id: &str) -> ToolOutcome {
        let token = match self.access_token(user_id).await {
            Ok(token) => token,
            Err(outcome) => return outcome,
        };

        match self.calendar.list_upcoming(&token).await {
            Ok(events) => ToolOutcome::Ok(Value::Array(events)),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Listing events failed");
                ToolOutcome::Ok(json!([]))
            }
        }
    }

    async fn add_event_to_calendar(&self, user_id: &str, arguments: Value) -> Result<ToolOutcome> {
        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };
        let args: AddEventArgs = serde_json::from_value(arguments)
            .map_err(|e| Error::InvalidArguments(e.to_string()))?;

        let start = match parse_local_time("start_time", &args.start_time) {
            Ok(t) => t,
            Err(outcome) => return Ok(outcome),
        };
        let end = match parse_local_time("end_time", &args.end_time) {
            Ok(t) => t,
            Err(outcome) => return Ok(outcome),
        };
        if end < start {
            return Ok(ToolOutcome::Rejected(
                "end_time must not be before start_time".to_string(),
            ));
        }

        let token = match self.access_token(user_id).await {
            Ok(token) => token,
            Err(outcome) => return Ok(outcome),
        };

        let event = NewEvent {
            summary: args.details,
            description: String::new(),
            start,
            end,
        };
        match self.calendar.create_event(&token, &event).await {
            Ok(created) => Ok(ToolOutcome::Ok(created)),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Creating event failed");
                Ok(ToolOutcome::Ok(Value::Null))
            }
        }
    }
}

fn parse_local_time(field: &str, value: &str) -> std::result::Result<NaiveDateTime, ToolOutcome> {
    NaiveDateTime::parse_from_str(value, LOCAL_TIME_FORMAT).map_err(|e| {
        ToolOutcome::Rejected(format!(
            "{field} must be YYYY-MM-DDTHH:MM:SS, got {value:?}: {e}"
        ))
    })
}
