//! Calendar REST client
//!
//! Thin wrapper over the provider's calendar API, called with a user's
//! access token once the token lifecycle has produced one.

use chrono::{NaiveDateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::config::CalendarConfig;
use crate::{Error, Result};

/// Wire format for local event times
pub const LOCAL_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Event to create in the user's calendar
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Event title
    pub summary: String,
    /// Longer description
    pub description: String,
    /// Local start time, interpreted in the calendar's timezone
    pub start: NaiveDateTime,
    /// Local end time, interpreted in the calendar's timezone
    pub end: NaiveDateTime,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventTime {
    date_time: String,
    time_zone: String,
}

#[derive(Debug, Serialize)]
struct EventBody<'a> {
    summary: &'a str,
    description: &'a str,
    start: EventTime,
    end: EventTime,
}

#[derive(Debug, Deserialize)]
struct EventsResponse {
    #[serde(default)]
    items: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct SettingResponse {
    value: Option<String>,
}

/// Calendar API client shared by all users
#[derive(Debug, Clone)]
pub struct CalendarClient {
    http_client: Client,
    api_base: String,
    calendar_id: String,
    max_results: u32,
}

impl CalendarClient {
    /// Create a client
    #[must_use]
    pub fn new(
        http_client: Client,
        api_base: impl Into<String>,
        calendar_id: impl Into<String>,
        max_results: u32,
    ) -> Self {
        Self {
            http_client,
            api_base: api_base.into(),
            calendar_id: calendar_id.into(),
            max_results,
        }
    }

    /// Create a client from configuration
    #[must_use]
    pub fn from_config(config: &CalendarConfig, http_client: Client) -> Self {
        Self::new(
            http_client,
            config.api_base.clone(),
            config.calendar_id.clone(),
            config.max_results,
        )
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|e| Error::Config(format!("Invalid calendar API base: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| Error::Config("Calendar API base cannot hold a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn events_url(&self) -> Result<Url> {
        self.url(&["calendars", &self.calendar_id, "events"])
    }

    /// Upcoming events starting from now
    pub async fn list_upcoming(&self, access_token: &str) -> Result<Vec<Value>> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let response = self
            .http_client
            .get(self.events_url()?)
            .bearer_auth(access_token)
            .query(&[
                ("timeMin", now),
                ("maxResults", self.max_results.to_string()),
            ])
            .send()
            .await?;

        let events: EventsResponse = check_status(response, "List events").await?.json().await?;
        debug!(count = events.items.len(), "Listed upcoming events");
        Ok(events.items)
    }

    /// The user's calendar timezone (for example `Europe/Helsinki`)
    pub async fn timezone(&self, access_token: &str) -> Result<String> {
        let response = self
            .http_client
            .get(self.url(&["users", "me", "settings", "timezone"])?)
            .bearer_auth(access_token)
            .send()
            .await?;

        let setting: SettingResponse =
            check_status(response, "Timezone lookup").await?.json().await?;
        setting
            .value
            .filter(|tz| !tz.is_empty())
            .ok_or_else(|| Error::Provider("Timezone setting has no value".to_string()))
    }

    /// Create an event in the user's timezone and return the provider's copy
    pub async fn create_event(&self, access_token: &str, event: &NewEvent) -> Result<Value> {
        let time_zone = self.timezone(access_token).await?;

        let body = EventBody {
            summary: &event.summary,
            description: &event.description,
            start: EventTime {
                date_time: event.start.format(LOCAL_TIME_FORMAT).to_string(),
                time_zone: time_zone.clone(),
            },
            end: EventTime {
                date_time: event.end.format(LOCAL_TIME_FORMAT).to_string(),
                time_zone,
            },
        };

        let response = self
            .http_client
            .post(self.events_url()?)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await?;

        let created: Value = check_status(response, "Create event").await?.json().await?;
        let event_id = created.get("id").and_then(Value::as_str).unwrap_or_default();
        info!(event_id, "Created calendar event");
        Ok(created)
    }
}

async fn check_status(response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(Error::Provider(format!("{action} failed: HTTP {status} - {body}")))
}
