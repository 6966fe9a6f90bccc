//! Endpoint weight table and parameter schema
//!
//! Maps an endpoint name plus caller overrides to a validated `LogicalRequest`
//! and the `(bucket, weight)` it must be charged against. Defaults declared
//! in the profile are merged first, then overrides; unknown parameters are
//! rejected unless the endpoint allows extras.

use std::collections::{BTreeMap, HashMap};

use crate::adapters::errors::{ExchangeError, ExchangeResult};
use crate::adapters::types::LogicalRequest;
use crate::config::types::{EndpointConfig, ParamLocation};

/// Tokens to take from one bucket for a single attempt
#[derive(Debug, Clone, PartialEq)]
pub struct RequestCost {
    pub bucket: String,
    pub weight: f64,
}

impl RequestCost {
    pub fn new(bucket: impl Into<String>, weight: f64) -> Self {
        Self {
            bucket: bucket.into(),
            weight,
        }
    }
}

/// Cost of one call given its resolved parameters
///
/// Tiered endpoints pick the first tier whose `max` is at or above the
/// parameter value, or the last tier when the value is above every `max`.
/// A missing tier parameter charges the base cost.
pub fn endpoint_cost(spec: &EndpointConfig, params: &BTreeMap<String, String>) -> ExchangeResult<f64> {
    let Some(tiers) = &spec.cost_tiers else {
        return Ok(spec.cost);
    };
    let Some(raw) = params.get(&tiers.param) else {
        return Ok(spec.cost);
    };
    let value: f64 = raw.trim().parse().map_err(|_| {
        ExchangeError::invalid_request(format!(
            "Endpoint '{}': parameter '{}' must be numeric (got '{}')",
            spec.name, tiers.param, raw
        ))
    })?;
    Ok(tiers
        .tiers
        .iter()
        .find(|tier| value <= tier.max)
        .or_else(|| tiers.tiers.last())
        .map_or(spec.cost, |tier| tier.cost))
}

/// Endpoint definitions indexed by name
#[derive(Debug, Clone, Default)]
pub struct EndpointTable {
    endpoints: HashMap<String, EndpointConfig>,
}

impl EndpointTable {
    pub fn new(endpoints: &[EndpointConfig]) -> ExchangeResult<Self> {
        let mut table = HashMap::with_capacity(endpoints.len());
        for endpoint in endpoints {
            if table.insert(endpoint.name.clone(), endpoint.clone()).is_some() {
                return Err(ExchangeError::Configuration(format!(
                    "Duplicate endpoint '{}'",
                    endpoint.name
                )));
            }
        }
        Ok(Self { endpoints: table })
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn get(&self, name: &str) -> ExchangeResult<&EndpointConfig> {
        self.endpoints
            .get(name)
            .ok_or_else(|| ExchangeError::Configuration(format!("Unknown endpoint '{}'", name)))
    }

    /// Merge declared defaults with caller overrides and check the schema
    pub fn resolve_params(
        &self,
        name: &str,
        overrides: &BTreeMap<String, String>,
    ) -> ExchangeResult<BTreeMap<String, String>> {
        let spec = self.get(name)?;

        let mut params: BTreeMap<String, String> = spec
            .params
            .iter()
            .filter_map(|p| p.default.as_ref().map(|d| (p.name.clone(), d.clone())))
            .collect();

        for (key, value) in overrides {
            let declared = spec.params.iter().any(|p| &p.name == key);
            if !declared && !spec.allow_extra {
                return Err(ExchangeError::invalid_request(format!(
                    "Endpoint '{}': unknown parameter '{}'",
                    name, key
                )));
            }
            params.insert(key.clone(), value.clone());
        }

        if let Some(missing) = spec
            .params
            .iter()
            .find(|p| p.required && !params.contains_key(&p.name))
        {
            return Err(ExchangeError::invalid_request(format!(
                "Endpoint '{}': missing required parameter '{}'",
                name, missing.name
            )));
        }

        Ok(params)
    }

    /// Cost of calling `name` with the given overrides
    pub fn cost(&self, name: &str, overrides: &BTreeMap<String, String>) -> ExchangeResult<RequestCost> {
        let params = self.resolve_params(name, overrides)?;
        let spec = self.get(name)?;
        Ok(RequestCost::new(&spec.bucket, endpoint_cost(spec, &params)?))
    }

    /// Build the logical request and its cost in one pass
    pub fn build_request(
        &self,
        name: &str,
        overrides: &BTreeMap<String, String>,
    ) -> ExchangeResult<(LogicalRequest, RequestCost)> {
        let spec = self.get(name)?;
        let mut params = self.resolve_params(name, overrides)?;
        let cost = RequestCost::new(&spec.bucket, endpoint_cost(spec, &params)?);

        let path = fill_path(&spec.name, &spec.path, &mut params)?;
        let mut request = LogicalRequest::new(spec.method, path);
        request.requires_auth = spec.auth;

        match spec.param_location() {
            ParamLocation::Query => request.query = params,
            ParamLocation::Body => {
                let body: serde_json::Map<String, serde_json::Value> = params
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::String(v)))
                    .collect();
                request.body = Some(serde_json::Value::Object(body));
            }
        }

        Ok((request, cost))
    }
}

/// Substitute `{param}` placeholders, consuming the used parameters
fn fill_path(endpoint: &str, template: &str, params: &mut BTreeMap<String, String>) -> ExchangeResult<String> {
    let mut path = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        let key = &rest[start + 1..start + len];
        let value = params.remove(key).ok_or_else(|| {
            ExchangeError::invalid_request(format!(
                "Endpoint '{}': missing path parameter '{}'",
                endpoint, key
            ))
        })?;
        path.push_str(&rest[..start]);
        path.push_str(&encode_segment(&value)?);
        rest = &rest[start + len + 1..];
    }
    path.push_str(rest);
    Ok(path)
}

/// Percent-encode one path segment (`/` and space included, never `+`)
fn encode_segment(value: &str) -> ExchangeResult<String> {
    let mut scratch = url::Url::parse("http://segment.local/")
        .map_err(|e| ExchangeError::Configuration(format!("Path encoder: {}", e)))?;
    scratch
        .path_segments_mut()
        .map_err(|_| ExchangeError::Configuration("Path encoder: base URL has no path".to_string()))?
        .clear()
        .push(value);
    Ok(scratch.path().trim_start_matches('/').to_string())
}
