//! # Dashboard Job Runner
//!
//! Collects one location from the operator dashboard's JSON API: the headline
//! metrics for the configured reporting period, then the items reported as not
//! found.
//!
//! HTTP outcomes map onto the job error taxonomy: 401/403 is `auth_rejected`,
//! 404 or an empty metrics payload is `no_data`, timeouts are `timeout`, other
//! transport failures and non-success statuses are `navigation_failed`, and a
//! body that does not decode is `unknown`.

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{Datelike, Days, Local, NaiveDate, NaiveDateTime, Timelike};
use reqwest::StatusCode;
use reqwest::header::COOKIE;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::collection::JobRunner;
use crate::domain::{
    CollectedLocation, CollectionError, FlaggedItem, JobErrorKind, LocationJob, LocationMetrics,
};
use crate::infrastructure::config::{DateRangeMode, EndpointConfig};
use crate::infrastructure::http_client::{HttpClient, HttpError, body_excerpt, read_json};

const LOOKUP_KEY_PLACEHOLDER: &str = "{lookup_key}";

#[derive(Debug, Default, Deserialize)]
struct MetricsDto {
    #[serde(rename = "OrdersShopped_V2")]
    orders_shopped: Option<f64>,
    #[serde(rename = "RequestedQuantity_V2")]
    requested_units: Option<f64>,
    #[serde(rename = "PickedUnits_V2")]
    picked_units: Option<f64>,
    #[serde(rename = "ShortedUnits_V2")]
    shorted_units: Option<f64>,
    #[serde(rename = "ItemNotFoundRate_V2")]
    item_not_found_rate: Option<f64>,
    #[serde(rename = "ItemFoundRate_V2")]
    item_found_rate: Option<f64>,
    #[serde(rename = "AverageUPH_V2")]
    average_uph: Option<f64>,
    #[serde(rename = "LateOrders_V2")]
    late_orders: Option<f64>,
}

impl MetricsDto {
    /// `None` when the dashboard answered without any metric.
    fn into_metrics(self) -> Option<LocationMetrics> {
        let known = [
            self.orders_shopped,
            self.requested_units,
            self.picked_units,
            self.shorted_units,
            self.item_not_found_rate,
            self.item_found_rate,
            self.average_uph,
        ];
        if known.iter().all(Option::is_none) {
            return None;
        }
        let count = |value: Option<f64>| value.unwrap_or(0.0).max(0.0).round() as u64;
        Some(LocationMetrics {
            orders_shopped: count(self.orders_shopped),
            requested_units: count(self.requested_units),
            picked_units: count(self.picked_units),
            shorted_units: count(self.shorted_units),
            item_not_found_rate: self.item_not_found_rate.unwrap_or(0.0),
            item_found_rate: self.item_found_rate.unwrap_or(0.0),
            average_units_per_hour: self.average_uph.unwrap_or(0.0),
            late_orders: count(self.late_orders),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ItemsPayload {
    List(Vec<InfItemDto>),
    Wrapped {
        #[serde(rename = "infMetrics", alias = "infDataList", default)]
        items: Vec<InfItemDto>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InfItemDto {
    #[serde(default)]
    merchant_sku: String,
    #[serde(default)]
    inf_count: u32,
    #[serde(alias = "title", alias = "productName")]
    name: Option<String>,
}

impl ItemsPayload {
    fn into_flagged(self, location_id: &str) -> Vec<FlaggedItem> {
        let items = match self {
            Self::List(items) | Self::Wrapped { items } => items,
        };
        let mut flagged: Vec<FlaggedItem> = items
            .into_iter()
            .filter(|item| !item.merchant_sku.is_empty() && item.inf_count > 0)
            .map(|item| {
                let flagged = FlaggedItem::new(item.merchant_sku, item.inf_count, location_id);
                match item.name.filter(|n| !n.is_empty()) {
                    Some(name) => flagged.with_name(name),
                    None => flagged,
                }
            })
            .collect();
        flagged.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.identifier.cmp(&b.identifier)));
        flagged
    }
}

/// First and last (date, hour) covered by `mode` at `now`
fn date_range(mode: DateRangeMode, now: NaiveDateTime) -> ((NaiveDate, u32), (NaiveDate, u32)) {
    let today = now.date();
    let days_back = |days: u64| today.checked_sub_days(Days::new(days)).unwrap_or(today);
    match mode {
        DateRangeMode::Today => ((today, 0), (today, now.hour())),
        DateRangeMode::Yesterday => ((days_back(1), 0), (days_back(1), 23)),
        DateRangeMode::Last7Days => ((days_back(6), 0), (today, now.hour())),
        DateRangeMode::Last30Days => ((days_back(29), 0), (today, now.hour())),
        DateRangeMode::WeekToDate => {
            let since_monday = u64::from(today.weekday().num_days_from_monday());
            ((days_back(since_monday), 0), (today, now.hour()))
        }
    }
}

/// Dashboard query for `mode` at `now`, months zero-based
fn date_range_params(
    lookup_key: &str,
    mode: DateRangeMode,
    now: NaiveDateTime,
) -> Vec<(&'static str, String)> {
    let ((start, start_hour), (end, end_hour)) = date_range(mode, now);
    vec![
        ("merchantIds[]", lookup_key.to_string()),
        ("startRange[year]", start.year().to_string()),
        ("startRange[month]", start.month0().to_string()),
        ("startRange[day]", start.day().to_string()),
        ("startRange[hour]", start_hour.to_string()),
        ("endRange[year]", end.year().to_string()),
        ("endRange[month]", end.month0().to_string()),
        ("endRange[day]", end.day().to_string()),
        ("endRange[hour]", end_hour.to_string()),
    ]
}

fn collection_error(error: HttpError) -> CollectionError {
    match error {
        HttpError::Timeout => CollectionError::timeout("dashboard request timed out"),
        HttpError::Cancelled => CollectionError::interrupted(),
        HttpError::Transport(message) => CollectionError::navigation_failed(message),
        HttpError::Decode(message) => CollectionError::unknown(format!("undecodable payload: {message}")),
    }
}

pub struct DashboardJobRunner {
    http: HttpClient,
    metrics_url: String,
    items_url: String,
    cookie: Option<String>,
    date_range: DateRangeMode,
}

impl DashboardJobRunner {
    pub fn new(http: HttpClient, endpoints: &EndpointConfig) -> Result<Self> {
        if endpoints.dashboard_metrics_url.is_empty() {
            bail!("endpoints.dashboard_metrics_url is not configured");
        }
        if endpoints.dashboard_items_url.is_empty() {
            bail!("endpoints.dashboard_items_url is not configured");
        }
        Ok(Self {
            http,
            metrics_url: endpoints.dashboard_metrics_url.clone(),
            items_url: endpoints.dashboard_items_url.clone(),
            cookie: endpoints.dashboard_cookie.clone(),
            date_range: endpoints.date_range_mode,
        })
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<T, CollectionError> {
        let request = match &self.cookie {
            Some(cookie) => request.header(COOKIE, cookie.as_str()),
            None => request,
        };
        let response = self
            .http
            .send_with_cancellation(request, cancel)
            .await
            .map_err(collection_error)?;

        let status = response.status();
        match status {
            s if s.is_success() => read_json(response).await.map_err(collection_error),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(CollectionError::auth_rejected(
                format!("dashboard session rejected (HTTP {})", status.as_u16()),
            )),
            StatusCode::NOT_FOUND => Err(CollectionError::no_data("dashboard has no data for location")),
            _ => Err(CollectionError::navigation_failed(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body_excerpt(response).await
            ))),
        }
    }
}

#[async_trait]
impl JobRunner for DashboardJobRunner {
    async fn run_job(
        &self,
        job: &LocationJob,
        cancel: CancellationToken,
    ) -> Result<CollectedLocation, CollectionError> {
        let request = self
            .http
            .get(&self.metrics_url)
            .query(&date_range_params(
                &job.lookup_key,
                self.date_range,
                Local::now().naive_local(),
            ));
        let metrics: MetricsDto = self.fetch(request, &cancel).await?;
        let metrics = metrics
            .into_metrics()
            .ok_or_else(|| CollectionError::no_data("metrics payload is empty"))?;

        let items_url = self.items_url.replace(LOOKUP_KEY_PLACEHOLDER, &job.lookup_key);
        let flagged_items = match self.fetch::<ItemsPayload>(self.http.get(&items_url), &cancel).await {
            Ok(payload) => payload.into_flagged(&job.location_id),
            // Metrics without an item breakdown is a valid, item-free location
            Err(e) if e.kind == JobErrorKind::NoData => Vec::new(),
            Err(e) => return Err(e),
        };

        debug!(
            location_id = %job.location_id,
            orders = metrics.orders_shopped,
            flagged = flagged_items.len(),
            "Dashboard collected"
        );
        Ok(CollectedLocation {
            metrics,
            flagged_items,
        })
    }
}
