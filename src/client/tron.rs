use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::indexer::source::{EventPage, FetchError, IndexerClient};
use crate::indexer::types::{EventSelector, RawEvent, Window};

const API_KEY_HEADER: &str = "TRON-PRO-API-KEY";

/// TronGrid `/v1/contracts/{address}/events` client.
#[derive(Clone, Debug)]
pub struct TronGridClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventsResponse {
    #[serde(default)]
    data: Vec<TronEvent>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    fingerprint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TronEvent {
    block_number: u64,
    block_timestamp: u64,
    event_name: String,
    #[serde(default)]
    event_index: u64,
    transaction_id: String,
    #[serde(default)]
    result: HashMap<String, Value>,
}

impl TronGridClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| eyre::eyre!("Failed to build TronGrid HTTP client: {}", e))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

fn field_value(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Turn one decoded response body into a page of raw events.
fn parse_page(
    body: EventsResponse,
    contract: &str,
    window: Window,
) -> Result<EventPage, FetchError> {
    if body.success == Some(false) {
        let message = body.error.unwrap_or_else(|| "request unsuccessful".to_string());
        return Err(FetchError::classify(Some(window), message));
    }

    let events = body
        .data
        .into_iter()
        .map(|event| RawEvent {
            contract: contract.to_string(),
            selector: EventSelector::Name(event.event_name),
            topics: Vec::new(),
            data: Default::default(),
            fields: event
                .result
                .into_iter()
                .map(|(k, v)| (k, field_value(v)))
                .collect(),
            block_number: event.block_number,
            log_index: event.event_index,
            transaction_hash: event.transaction_id,
            timestamp: Some(event.block_timestamp / 1000),
        })
        .collect();

    Ok(EventPage {
        events,
        next: body.meta.and_then(|m| m.fingerprint).filter(|f| !f.is_empty()),
    })
}

#[async_trait]
impl IndexerClient for TronGridClient {
    async fn current_head(&self) -> Result<u64, FetchError> {
        u64::try_from(Utc::now().timestamp_millis())
            .map_err(|_| FetchError::Malformed("system clock before epoch".to_string()))
    }

    async fn fetch_events(
        &self,
        window: Window,
        contract: &str,
        event_name: &str,
        page_size: usize,
        continuation: Option<&str>,
    ) -> Result<EventPage, FetchError> {
        let url = format!("{}/v1/contracts/{}/events", self.base_url, contract);
        let mut query: Vec<(&str, String)> = vec![
            ("event_name", event_name.to_string()),
            ("min_block_timestamp", window.from.to_string()),
            ("max_block_timestamp", window.to.to_string()),
            ("order_by", "block_timestamp,asc".to_string()),
            ("limit", page_size.to_string()),
        ];
        if let Some(fingerprint) = continuation {
            query.push(("fingerprint", fingerprint.to_string()));
        }

        let mut request = self.http.get(&url).query(&query);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited(format!("HTTP {status} from {url}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::classify(Some(window), format!("HTTP {status}: {body}")));
        }

        let body: EventsResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Malformed(e.to_string()))?;
        parse_page(body, contract, window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTRACT: &str = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t";

    #[test]
    fn test_parse_events_page() {
        let body: EventsResponse = serde_json::from_str(
            r#"{
                "data": [{
                    "block_number": 61234567,
                    "block_timestamp": 1715000000000,
                    "contract_address": "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t",
                    "event_index": 2,
                    "event_name": "AddedBlackList",
                    "result": {
                        "0": "0xabcd00000000000000000000000000000000ef12",
                        "_user": "0xabcd00000000000000000000000000000000ef12"
                    },
                    "transaction_id": "aa11"
                }],
                "success": true,
                "meta": {"at": 1715000001000, "fingerprint": "next-page", "page_size": 1}
            }"#,
        )
        .unwrap();

        let page = parse_page(body, CONTRACT, Window::new(0, 1)).unwrap();
        assert_eq!(page.next.as_deref(), Some("next-page"));
        assert_eq!(page.events.len(), 1);

        let event = &page.events[0];
        assert_eq!(event.contract, CONTRACT);
        assert_eq!(event.selector, EventSelector::Name("AddedBlackList".into()));
        assert_eq!(event.block_number, 61_234_567);
        assert_eq!(event.log_index, 2);
        assert_eq!(event.timestamp, Some(1_715_000_000));
        assert_eq!(
            event.fields.get("_user").map(String::as_str),
            Some("0xabcd00000000000000000000000000000000ef12")
        );
    }

    #[test]
    fn test_last_page_has_no_token() {
        let json = r#"{"data": [], "success": true, "meta": {"page_size": 0}}"#;
        let body: EventsResponse = serde_json::from_str(json).unwrap();
        let page = parse_page(body, CONTRACT, Window::new(0, 1)).unwrap();
        assert!(page.events.is_empty());
        assert!(page.next.is_none());
    }

    #[test]
    fn test_unsuccessful_body_is_an_error() {
        let body: EventsResponse =
            serde_json::from_str(r#"{"success": false, "error": "rate limit exceeded"}"#).unwrap();
        assert!(matches!(
            parse_page(body, CONTRACT, Window::new(0, 1)),
            Err(FetchError::RateLimited(_))
        ));
    }
}
