use anyhow::Context;
use reqwest::header::{self, HeaderMap};
use serde::Deserialize;

use crate::core::time::{DateTime, Duration};

#[derive(Debug, Clone)]
pub struct CalendarEvent {
    pub id: String,
    pub summary: String,
    pub start: DateTime,
}

/// Read-only client for the calendar REST API. Authentication uses a
/// pre-provisioned bearer token; the interactive authorization flow is out
/// of scope.
#[derive(Debug, Clone)]
pub struct CalendarClient {
    client: reqwest::Client,
    base_url: String,
    calendar_id: String,
}

impl CalendarClient {
    pub fn new(base_url: &str, token: &str, calendar_id: &str) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth_value = header::HeaderValue::from_str(format!("Bearer {}", token).as_str())
            .context("Invalid calendar token")?;
        auth_value.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder().default_headers(headers).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            calendar_id: calendar_id.to_owned(),
        })
    }

    /// Events starting within the lookahead window, soonest first.
    pub async fn upcoming_events(&self, from: DateTime, lookahead: Duration) -> anyhow::Result<Vec<CalendarEvent>> {
        let url = format!("{}/calendars/{}/events", self.base_url, self.calendar_id);

        let response = self
            .client
            .get(url)
            .query(&[
                ("timeMin", from.to_iso_string()),
                ("timeMax", (from + lookahead).to_iso_string()),
                ("singleEvents", "true".to_owned()),
                ("orderBy", "startTime".to_owned()),
                ("maxResults", "10".to_owned()),
            ])
            .send()
            .await?
            .error_for_status()
            .context("Calendar API rejected the request")?;

        let events: EventsResponse = response.json().await.context("Error parsing calendar response")?;

        Ok(events
            .items
            .into_iter()
            .filter_map(|event| match parse_event(&event) {
                Some(parsed) => Some(parsed),
                None => {
                    tracing::warn!("Skipping calendar event with unparseable start: {:?}", event);
                    None
                }
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct EventsResponse {
    #[serde(default)]
    items: Vec<RawEvent>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(default)]
    summary: Option<String>,
    start: RawEventTime,
}

#[derive(Debug, Deserialize)]
struct RawEventTime {
    #[serde(rename = "dateTime", default)]
    date_time: Option<String>,
    #[serde(default)]
    date: Option<String>,
}

fn parse_event(event: &RawEvent) -> Option<CalendarEvent> {
    let start = parse_start(&event.start)?;

    Some(CalendarEvent {
        id: event.id.clone(),
        summary: event.summary.clone().unwrap_or_else(|| "No Title".to_owned()),
        start,
    })
}

fn parse_start(start: &RawEventTime) -> Option<DateTime> {
    if let Some(date_time) = &start.date_time {
        return DateTime::from_iso(date_time).ok();
    }

    //all-day events carry a bare date, taken as midnight UTC
    let date = start.date.as_deref()?;
    let naive = chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    Some(naive.and_hms_opt(0, 0, 0)?.and_utc().into())
}
