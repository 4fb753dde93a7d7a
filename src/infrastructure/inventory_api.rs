//! # Inventory API Client
//!
//! HTTP implementation of the product, stock and shelf-location lookups.
//!
//! Every endpoint takes the api key as the `apikey` query parameter and the bearer
//! token, when one is held, as an `Authorization` header. Status codes map onto
//! [`LookupError`]: 404 is "not found", 401/403 is an authorization failure, and
//! 429, 5xx and transport errors are transient.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::StatusCode;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::domain::{LocationInfo, ProductInfo, StockInfo};
use crate::enrichment::{AuthSnapshot, InventoryLookup, LookupError};
use crate::infrastructure::config::EndpointConfig;
use crate::infrastructure::http_client::{HttpClient, HttpError, body_excerpt, read_json};

static BAY_SIDE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^([LRlr])(\d+)$").ok());

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductDto {
    #[serde(default)]
    pack_components: Vec<PackComponentDto>,
    #[serde(default)]
    gtins: Vec<GtinDto>,
    #[serde(default)]
    image_url: Vec<ImageDto>,
    status: Option<String>,
    commercially_active: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackComponentDto {
    item_number: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GtinDto {
    id: Option<String>,
    #[serde(default)]
    additional_properties: GtinPropertiesDto,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GtinPropertiesDto {
    #[serde(default)]
    is_primary_barcode: bool,
}

#[derive(Debug, Deserialize)]
struct ImageDto {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StockDto {
    #[serde(default)]
    stock_position: Vec<StockPositionDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StockPositionDto {
    qty: Option<f64>,
    #[serde(rename = "unitofMeasure")]
    unit_of_measure: Option<String>,
    last_updated: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PriceIntegrityDto {
    #[serde(default)]
    space: SpaceDto,
    #[serde(default)]
    prices: Vec<PriceDto>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpaceDto {
    #[serde(default)]
    standard_space: ShelfListDto,
    #[serde(default)]
    promotional_space: ShelfListDto,
}

#[derive(Debug, Default, Deserialize)]
struct ShelfListDto {
    #[serde(default)]
    locations: Vec<ShelfDto>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShelfDto {
    aisle: Option<String>,
    bay_number: Option<String>,
    shelf_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PriceDto {
    price: Option<f64>,
}

impl ProductDto {
    fn into_info(self, identifier: &str) -> ProductInfo {
        ProductInfo {
            identifier: identifier.to_string(),
            description: self.description,
            primary_barcode: self
                .gtins
                .into_iter()
                .find(|g| g.additional_properties.is_primary_barcode)
                .and_then(|g| g.id),
            image_url: self.image_url.into_iter().find_map(|i| i.url),
            status: self.status,
            commercially_active: self
                .commercially_active
                .map(|flag| flag.eq_ignore_ascii_case("yes")),
            component_ids: self
                .pack_components
                .into_iter()
                .filter_map(|c| match c.item_number? {
                    serde_json::Value::String(s) if !s.is_empty() => Some(s),
                    serde_json::Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
        }
    }
}

/// "Aisle 12, Left bay 3, shelf 2"
fn format_shelf(shelf: &ShelfDto) -> String {
    let mut parts = Vec::new();
    if let Some(aisle) = shelf.aisle.as_deref().filter(|a| !a.is_empty()) {
        parts.push(format!("Aisle {aisle}"));
    }
    if let Some(bay) = shelf.bay_number.as_deref().filter(|b| !b.is_empty()) {
        match BAY_SIDE.as_ref().and_then(|re| re.captures(bay)) {
            Some(caps) => {
                let side = if caps[1].eq_ignore_ascii_case("L") { "Left" } else { "Right" };
                parts.push(format!("{side} bay {}", &caps[2]));
            }
            None => parts.push(format!("Bay {bay}")),
        }
    }
    if let Some(number) = shelf.shelf_number.as_deref().filter(|s| !s.is_empty()) {
        parts.push(format!("shelf {number}"));
    }
    parts.join(", ")
}

fn lookup_error(error: HttpError) -> LookupError {
    match error {
        HttpError::Timeout => LookupError::Timeout,
        HttpError::Cancelled => LookupError::Cancelled,
        other => LookupError::Transient(other.to_string()),
    }
}

pub struct InventoryApiClient {
    http: HttpClient,
    product_base_url: String,
    stock_base_url: String,
    location_base_url: String,
}

impl InventoryApiClient {
    #[must_use]
    pub fn new(http: HttpClient, endpoints: &EndpointConfig) -> Self {
        Self {
            http,
            product_base_url: endpoints.product_base_url.trim_end_matches('/').to_string(),
            stock_base_url: endpoints.stock_base_url.trim_end_matches('/').to_string(),
            location_base_url: endpoints.location_base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, url: String, auth: &AuthSnapshot) -> Result<T, LookupError> {
        let mut request = self.http.get(&url).query(&[("apikey", auth.api_key.as_str())]);
        if let Some(token) = auth.bearer.as_deref() {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = self.http.send(request).await.map_err(lookup_error)?;
        let status = response.status();
        match status {
            s if s.is_success() => read_json(response).await.map_err(lookup_error),
            StatusCode::NOT_FOUND => Err(LookupError::NotFound),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                debug!(url = %url, bearer = auth.bearer.is_some(), "Lookup unauthorized");
                Err(LookupError::Unauthorized {
                    status: status.as_u16(),
                })
            }
            _ => Err(LookupError::Transient(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body_excerpt(response).await
            ))),
        }
    }
}

#[async_trait]
impl InventoryLookup for InventoryApiClient {
    async fn product(&self, identifier: &str, auth: AuthSnapshot) -> Result<ProductInfo, LookupError> {
        let url = format!("{}/{}", self.product_base_url, identifier);
        let dto: ProductDto = self.fetch(url, &auth).await?;
        Ok(dto.into_info(identifier))
    }

    async fn stock(
        &self,
        location_id: &str,
        identifier: &str,
        auth: AuthSnapshot,
    ) -> Result<StockInfo, LookupError> {
        let url = format!("{}/{}/items/{}", self.stock_base_url, location_id, identifier);
        let dto: StockDto = self.fetch(url, &auth).await?;
        let position = dto.stock_position.into_iter().next().ok_or(LookupError::NotFound)?;
        Ok(StockInfo {
            identifier: identifier.to_string(),
            quantity: position.qty,
            unit_of_measure: position.unit_of_measure,
            last_updated: position.last_updated,
        })
    }

    async fn location(
        &self,
        location_id: &str,
        identifier: &str,
        auth: AuthSnapshot,
    ) -> Result<LocationInfo, LookupError> {
        let url = format!("{}/{}/items/{}", self.location_base_url, location_id, identifier);
        let dto: PriceIntegrityDto = self.fetch(url, &auth).await?;
        Ok(LocationInfo {
            standard_locations: dto.space.standard_space.locations.iter().map(format_shelf).collect(),
            promotional_locations: dto.space.promotional_space.locations.iter().map(format_shelf).collect(),
            price: dto.prices.into_iter().find_map(|p| p.price),
        })
    }
}
